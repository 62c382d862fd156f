//! MQTT Broker Core
//!
//! `Broker` is the dispatch coordinator: it owns the subscription trie, the
//! shared-subscription selector, one session task per client, the retained
//! message store and the authorization cache, and exposes the operations the
//! transport layer drives (subscribe, unsubscribe, publish, acks, session
//! start/end).
//!
//! Operations are split by concern:
//! - `publish.rs`: routing and inbound QoS handshakes
//! - `subscribe.rs`: subscribe/unsubscribe and retained delivery
//! - `lifecycle.rs`: session start/end and ack handling
//! - `maintenance.rs`: trie compaction schedule and shutdown

mod error;
mod lifecycle;
mod maintenance;
mod publish;
mod subscribe;

pub use error::DispatchError;
pub use lifecycle::SessionStart;
pub use publish::{InboundPublish, PublishReport};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::bus::{LocalBus, MessageBus};
use crate::config::Config;
use crate::hooks::{AuthorizationCache, DefaultHooks, Hooks};
use crate::persistence::{MemoryBackend, PersistenceManager, RedeliveryStore, StorageBackend};
use crate::protocol::{QoS, SubscriptionOptions};
use crate::retain::RetainedStore;
use crate::session::{SessionHandle, SessionSettings};
use crate::topic::{SharedStrategy, SharedSubscriptionSelector, SubscriptionTrie};

/// Broker configuration
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Limits for every session task
    pub session: SessionSettings,
    /// Empty trie node sweep interval
    pub compaction_interval: Duration,
    /// Shared subscription member selection
    pub shared_strategy: SharedStrategy,
    /// Maximum topic levels (0 = unlimited)
    pub max_topic_levels: usize,
    /// Maximum QoS
    pub max_qos: QoS,
    /// Retain available
    pub retain_available: bool,
    /// Wildcard subscription available
    pub wildcard_subscription_available: bool,
    /// Shared subscriptions available
    pub shared_subscriptions_available: bool,
    /// This node's identity on the message bus
    pub service_id: Arc<str>,
    /// Bus topic for retained updates
    pub retained_topic: String,
    /// Distinct topics whose publish authorization is cached per client
    pub auth_cache_topics: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            session: SessionSettings::default(),
            compaction_interval: Duration::from_secs(60),
            shared_strategy: SharedStrategy::RoundRobin,
            max_topic_levels: 0,
            max_qos: QoS::ExactlyOnce,
            retain_available: true,
            wildcard_subscription_available: true,
            shared_subscriptions_available: true,
            service_id: Arc::from("trellismq-1"),
            retained_topic: "trellismq.retained".to_string(),
            auth_cache_topics: 1024,
        }
    }
}

impl From<&Config> for BrokerConfig {
    fn from(config: &Config) -> Self {
        Self {
            session: SessionSettings {
                max_inflight: config.session.max_inflight,
                max_queued_messages: config.session.max_queued_messages,
                max_awaiting_rel: config.session.max_awaiting_rel,
                max_stored_messages: config.session.max_stored_messages,
                retry_interval: config.session.retry_interval,
                command_channel_capacity: config.session.command_channel_capacity,
            },
            compaction_interval: config.subscriptions.compaction_interval,
            shared_strategy: config.subscriptions.shared_strategy,
            max_topic_levels: config.subscriptions.max_topic_levels,
            max_qos: QoS::from_u8(config.mqtt.max_qos).unwrap_or(QoS::ExactlyOnce),
            retain_available: config.mqtt.retain_available,
            wildcard_subscription_available: config.mqtt.wildcard_subscriptions,
            shared_subscriptions_available: config.mqtt.shared_subscriptions,
            service_id: Arc::from(config.cluster.service_id.as_str()),
            retained_topic: config.cluster.retained_topic.clone(),
            auth_cache_topics: config.session.auth_cache_topics,
        }
    }
}

/// Broker events
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerEvent {
    /// Session task attached to a transport
    SessionStarted {
        client_id: Arc<str>,
        session_present: bool,
    },
    /// Session detached (clean = state discarded)
    SessionEnded { client_id: Arc<str>, clean: bool },
    /// Message routed
    MessagePublished {
        topic: Arc<str>,
        qos: QoS,
        recipients: usize,
    },
    /// Filter added to the trie
    SubscriptionAdded { client_id: Arc<str>, filter: Arc<str> },
    /// Filter removed from the trie
    SubscriptionRemoved { client_id: Arc<str>, filter: Arc<str> },
}

/// The MQTT Broker
///
/// # Example
///
/// ```
/// use bytes::Bytes;
/// use tokio::sync::mpsc;
/// use trellismq::broker::{Broker, BrokerConfig};
/// use trellismq::protocol::{OutboundPacket, QoS, SubscriptionOptions};
///
/// # tokio_test::block_on(async {
/// let broker = Broker::new(BrokerConfig::default());
/// let (tx, mut rx) = mpsc::channel(16);
/// broker.start_session("reader", true, tx).await?;
/// broker
///     .subscribe(
///         "reader",
///         vec![("sensors/+/temp".to_string(), SubscriptionOptions::with_qos(QoS::AtLeastOnce))],
///     )
///     .await?;
///
/// let report = broker
///     .publish("thermo-1", "sensors/kitchen/temp", Bytes::from("21.5"), QoS::AtLeastOnce, false)
///     .await?;
/// assert_eq!(report.delivered(), 1);
/// assert!(matches!(rx.recv().await, Some(OutboundPacket::Publish { .. })));
/// # Ok::<(), trellismq::broker::DispatchError>(())
/// # }).unwrap();
/// ```
pub struct Broker {
    config: BrokerConfig,
    trie: Arc<SubscriptionTrie>,
    selector: SharedSubscriptionSelector,
    /// One session task per client
    sessions: DashMap<Arc<str>, SessionHandle>,
    /// Filters each client holds in the trie, by original filter string
    client_filters: DashMap<Arc<str>, HashMap<Arc<str>, SubscriptionOptions>>,
    redelivery: Arc<RedeliveryStore>,
    retained: Arc<RetainedStore>,
    persistence: Option<Arc<PersistenceManager>>,
    hooks: Arc<dyn Hooks>,
    auth_cache: AuthorizationCache,
    events: broadcast::Sender<BrokerEvent>,
    shutdown: broadcast::Sender<()>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Assembles a `Broker` from its collaborators
pub struct BrokerBuilder {
    config: BrokerConfig,
    backend: Option<Arc<dyn StorageBackend>>,
    persistence: Option<Arc<PersistenceManager>>,
    bus: Option<Arc<dyn MessageBus>>,
    hooks: Option<Arc<dyn Hooks>>,
}

impl BrokerBuilder {
    /// Storage for redelivery records (default: in memory)
    pub fn backend(mut self, backend: Arc<dyn StorageBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Background writer for retained messages
    pub fn persistence(mut self, persistence: Arc<PersistenceManager>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    /// Inter-node message bus (default: in-process)
    pub fn bus(mut self, bus: Arc<dyn MessageBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Authorization and event hooks (default: allow all)
    pub fn hooks(mut self, hooks: Arc<dyn Hooks>) -> Self {
        self.hooks = Some(hooks);
        self
    }

    pub fn build(self) -> Broker {
        let backend = self
            .backend
            .or_else(|| self.persistence.as_ref().map(|p| p.backend().clone()))
            .unwrap_or_else(|| Arc::new(MemoryBackend::new()));
        let bus = self.bus.unwrap_or_else(|| Arc::new(LocalBus::default()));
        let retained = Arc::new(RetainedStore::new(
            self.config.service_id.clone(),
            bus,
            self.config.retained_topic.clone(),
            self.persistence.clone(),
        ));
        let (shutdown, _) = broadcast::channel(1);
        let (events, _) = broadcast::channel(1024);
        let auth_cache = AuthorizationCache::with_max_topics(self.config.auth_cache_topics);

        Broker {
            selector: SharedSubscriptionSelector::new(self.config.shared_strategy),
            config: self.config,
            trie: Arc::new(SubscriptionTrie::new()),
            sessions: DashMap::new(),
            client_filters: DashMap::new(),
            redelivery: Arc::new(RedeliveryStore::new(backend)),
            retained,
            persistence: self.persistence,
            hooks: self.hooks.unwrap_or_else(|| Arc::new(DefaultHooks)),
            auth_cache,
            events,
            shutdown,
            tasks: Mutex::new(Vec::new()),
        }
    }
}

impl Broker {
    /// Create a broker with in-memory storage, a local bus and default hooks
    pub fn new(config: BrokerConfig) -> Self {
        Self::builder(config).build()
    }

    pub fn builder(config: BrokerConfig) -> BrokerBuilder {
        BrokerBuilder {
            config,
            backend: None,
            persistence: None,
            bus: None,
            hooks: None,
        }
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub fn subscription_trie(&self) -> &Arc<SubscriptionTrie> {
        &self.trie
    }

    pub fn redelivery_store(&self) -> &Arc<RedeliveryStore> {
        &self.redelivery
    }

    pub fn retained_store(&self) -> &Arc<RetainedStore> {
        &self.retained
    }

    /// Subscribe to broker events
    pub fn subscribe_events(&self) -> broadcast::Receiver<BrokerEvent> {
        self.events.subscribe()
    }

    /// Get session count
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Get retained message count
    pub fn retained_count(&self) -> usize {
        self.retained.len()
    }

    fn session(&self, client_id: &str) -> Option<SessionHandle> {
        self.sessions.get(client_id).map(|h| h.clone())
    }

    fn emit(&self, event: BrokerEvent) {
        // No receivers is fine
        let _ = self.events.send(event);
    }
}

impl Default for Broker {
    fn default() -> Self {
        Self::new(BrokerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::SubscriptionOptions;
    use tokio::sync::mpsc;

    #[test]
    fn test_config_from_file_config() {
        let config = Config::parse(
            r#"
[session]
max_inflight = 4
retry_interval = "2s"

[subscriptions]
compaction_interval = "5s"
shared_strategy = "random"

[mqtt]
max_qos = 1
shared_subscriptions = false

[cluster]
service_id = "edge-7"
"#,
        )
        .unwrap();
        let broker_config = BrokerConfig::from(&config);
        assert_eq!(broker_config.session.max_inflight, 4);
        assert_eq!(broker_config.session.retry_interval, Duration::from_secs(2));
        assert_eq!(broker_config.compaction_interval, Duration::from_secs(5));
        assert_eq!(broker_config.shared_strategy, SharedStrategy::Random);
        assert_eq!(broker_config.max_qos, QoS::AtLeastOnce);
        assert!(!broker_config.shared_subscriptions_available);
        assert!(broker_config.wildcard_subscription_available);
        assert_eq!(&*broker_config.service_id, "edge-7");
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_compaction() {
        let broker = Arc::new(Broker::new(BrokerConfig {
            compaction_interval: Duration::from_secs(10),
            ..Default::default()
        }));
        broker.start().await.unwrap();

        let (tx, _rx) = mpsc::channel(8);
        broker.start_session("c", true, tx).await.unwrap();
        broker
            .subscribe("c", vec![("a/b/c".to_string(), SubscriptionOptions::default())])
            .await
            .unwrap();
        broker.unsubscribe("c", vec!["a/b/c".to_string()]).await.unwrap();
        assert_eq!(broker.subscription_trie().node_count(), 3);

        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(broker.subscription_trie().node_count(), 0);

        broker.shutdown().await;
        assert_eq!(broker.session_count(), 0);
    }
}
