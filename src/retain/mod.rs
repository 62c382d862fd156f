//! Retained messages
//!
//! The last retained message per topic, cached in memory, written to
//! persistence in the background and announced on the message bus so every
//! node keeps the same view. Updates a node sent itself are ignored when the
//! bus echoes them back.

use std::sync::Arc;

use bincode::{Decode, Encode};
use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::bus::{BusError, BusRecord, MessageBus};
use crate::persistence::{PersistenceError, PersistenceManager, PersistenceOp, StoredRetainedMessage};
use crate::protocol::{Message, QoS};
use crate::topic::{topic_matches_filter, TopicFilter};

/// Retained update as carried on the bus
#[derive(Debug, Clone, Encode, Decode)]
struct RetainedUpdate {
    topic: String,
    payload: Vec<u8>,
    qos: u8,
}

pub struct RetainedStore {
    messages: DashMap<Arc<str>, Message>,
    persistence: Option<Arc<PersistenceManager>>,
    bus: Arc<dyn MessageBus>,
    bus_topic: String,
    service_id: Arc<str>,
}

impl RetainedStore {
    pub fn new(
        service_id: impl Into<Arc<str>>,
        bus: Arc<dyn MessageBus>,
        bus_topic: impl Into<String>,
        persistence: Option<Arc<PersistenceManager>>,
    ) -> Self {
        Self {
            messages: DashMap::new(),
            persistence,
            bus,
            bus_topic: bus_topic.into(),
            service_id: service_id.into(),
        }
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn get(&self, topic: &str) -> Option<Message> {
        self.messages.get(topic).map(|m| m.clone())
    }

    /// Store (or clear, for an empty payload) the retained message of a
    /// topic and announce it to the other nodes
    pub async fn update(&self, message: &Message) -> Result<(), BusError> {
        self.apply(message, true);

        let update = RetainedUpdate {
            topic: message.topic.to_string(),
            payload: message.payload.to_vec(),
            qos: message.qos as u8,
        };
        let payload = bincode::encode_to_vec(&update, bincode::config::standard())?;
        self.bus
            .send(
                &self.bus_topic,
                BusRecord {
                    origin: self.service_id.clone(),
                    payload: Bytes::from(payload),
                },
            )
            .await
    }

    fn apply(&self, message: &Message, persist: bool) {
        if message.payload.is_empty() {
            if self.messages.remove(&*message.topic).is_some() {
                debug!("Cleared retained message on {}", message.topic);
            }
            if persist {
                if let Some(ref persistence) = self.persistence {
                    persistence.write(PersistenceOp::DeleteRetained {
                        topic: message.topic.to_string(),
                    });
                }
            }
            return;
        }

        let retained = message.for_recipient(message.qos, true);
        if persist {
            if let Some(ref persistence) = self.persistence {
                persistence.write(PersistenceOp::SetRetained {
                    topic: message.topic.to_string(),
                    message: StoredRetainedMessage::from(&retained),
                });
            }
        }
        self.messages.insert(message.topic.clone(), retained);
    }

    /// Apply an update received from the bus. Returns false for our own
    /// echoes and undecodable records.
    pub fn apply_remote(&self, record: &BusRecord) -> bool {
        if record.origin == self.service_id {
            return false;
        }

        let update: RetainedUpdate =
            match bincode::decode_from_slice(&record.payload, bincode::config::standard()) {
                Ok((update, _)) => update,
                Err(e) => {
                    warn!("Undecodable retained update from {}: {}", record.origin, e);
                    return false;
                }
            };
        let Some(qos) = QoS::from_u8(update.qos) else {
            warn!("Retained update from {} has invalid QoS {}", record.origin, update.qos);
            return false;
        };

        let message = Message::new(update.topic, update.payload, qos, true);
        self.apply(&message, true);
        true
    }

    /// Retained messages whose topic matches `filter`, ordered by topic
    pub fn matching(&self, filter: &TopicFilter) -> Vec<Message> {
        let mut matched: Vec<Message> = self
            .messages
            .iter()
            .filter(|entry| topic_matches_filter(entry.key(), &filter.filter))
            .map(|entry| entry.value().clone())
            .collect();
        matched.sort_by(|a, b| a.topic.cmp(&b.topic));
        matched
    }

    /// Load stored retained messages into the cache. Startup only.
    pub async fn restore(&self) -> Result<usize, PersistenceError> {
        let Some(ref persistence) = self.persistence else {
            return Ok(0);
        };

        let stored = persistence.load_retained().await?;
        let mut restored = 0;
        for (_, message) in stored {
            match message.to_message() {
                Ok(message) => {
                    self.messages.insert(message.topic.clone(), message);
                    restored += 1;
                }
                Err(e) => warn!("Skipping stored retained message: {}", e),
            }
        }
        info!("Restored {} retained messages", restored);
        Ok(restored)
    }

    /// Follow retained updates from other nodes until shutdown
    pub fn spawn_listener(self: &Arc<Self>, mut shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
        let store = self.clone();
        let mut rx = self.bus.subscribe(&self.bus_topic);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    record = rx.recv() => match record {
                        Ok(record) => {
                            store.apply_remote(&record);
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!("Retained listener lagged, {} updates skipped", n);
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    _ = shutdown.recv() => break,
                }
            }
            debug!("Retained listener stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::LocalBus;
    use crate::persistence::{MemoryBackend, StorageBackend};
    use crate::topic::parse_filter;
    use std::time::Duration;

    fn store(service_id: &str, bus: Arc<dyn MessageBus>) -> RetainedStore {
        RetainedStore::new(service_id, bus, "retained", None)
    }

    #[tokio::test]
    async fn test_store_and_clear() {
        let store = store("n1", Arc::new(LocalBus::default()));
        store
            .update(&Message::new("a/b", "v", QoS::AtLeastOnce, true))
            .await
            .unwrap();
        assert_eq!(store.len(), 1);
        assert!(store.get("a/b").unwrap().retain);

        store
            .update(&Message::new("a/b", Bytes::new(), QoS::AtMostOnce, true))
            .await
            .unwrap();
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_matching_by_filter() {
        let store = store("n1", Arc::new(LocalBus::default()));
        for topic in ["s/b", "s/a", "x/a", "$SYS/a"] {
            store
                .update(&Message::new(topic, "v", QoS::AtMostOnce, true))
                .await
                .unwrap();
        }

        let topics: Vec<String> = store
            .matching(&parse_filter("s/+").unwrap())
            .iter()
            .map(|m| m.topic.to_string())
            .collect();
        assert_eq!(topics, vec!["s/a", "s/b"]);
        assert_eq!(store.matching(&parse_filter("#").unwrap()).len(), 3);
    }

    #[tokio::test]
    async fn test_propagates_between_nodes_and_ignores_echo() {
        let bus: Arc<dyn MessageBus> = Arc::new(LocalBus::default());
        let n1 = store("n1", bus.clone());
        let n2 = store("n2", bus.clone());
        let mut rx = bus.subscribe("retained");

        n1.update(&Message::new("t", "v", QoS::AtLeastOnce, true))
            .await
            .unwrap();
        let record = rx.recv().await.unwrap();

        assert!(!n1.apply_remote(&record));
        assert!(n2.apply_remote(&record));
        assert_eq!(n2.get("t").unwrap().qos, QoS::AtLeastOnce);
    }

    #[tokio::test]
    async fn test_listener_applies_remote_updates() {
        let bus: Arc<dyn MessageBus> = Arc::new(LocalBus::default());
        let n1 = store("n1", bus.clone());
        let n2 = Arc::new(store("n2", bus.clone()));
        let (shutdown_tx, _) = broadcast::channel(1);
        let listener = n2.spawn_listener(shutdown_tx.subscribe());

        n1.update(&Message::new("t", "v", QoS::AtMostOnce, true))
            .await
            .unwrap();
        for _ in 0..50 {
            if n2.get("t").is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(n2.get("t").is_some());

        shutdown_tx.send(()).unwrap();
        listener.await.unwrap();
    }

    #[tokio::test]
    async fn test_restore_from_persistence() {
        let backend: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
        let message = Message::new("r", "v", QoS::ExactlyOnce, true);
        backend
            .set_retained("r", &StoredRetainedMessage::from(&message))
            .await
            .unwrap();

        let manager = Arc::new(PersistenceManager::new(backend, Duration::from_secs(1), 10));
        let store = RetainedStore::new("n", Arc::new(LocalBus::default()), "retained", Some(manager));
        assert_eq!(store.restore().await.unwrap(), 1);
        assert_eq!(store.get("r").unwrap(), message);
    }
}
