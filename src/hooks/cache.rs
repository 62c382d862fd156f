//! Per-client memo of publish authorization decisions

use std::collections::VecDeque;
use std::sync::Arc;

use ahash::AHashMap;
use dashmap::DashMap;

use crate::protocol::QoS;

/// Default number of distinct topics remembered per client
pub const DEFAULT_MAX_TOPICS: usize = 1024;

/// One answer per (QoS, retain) combination of a topic
type Decisions = [Option<bool>; 6];

fn slot(qos: QoS, retain: bool) -> usize {
    qos as usize * 2 + usize::from(retain)
}

#[derive(Default)]
struct ClientDecisions {
    topics: AHashMap<Arc<str>, Decisions>,
    /// First-cached first-out once `max_topics` is reached
    order: VecDeque<Arc<str>>,
}

/// Remembers `on_publish_check` answers per (client, topic, QoS, retain).
///
/// Entries live as long as the client's session; `evict` is called when the
/// session ends so a reconnecting client is checked afresh. Each client keeps
/// at most `max_topics` topics, the oldest is forgotten first.
pub struct AuthorizationCache {
    publish: DashMap<Arc<str>, ClientDecisions>,
    max_topics: usize,
}

impl Default for AuthorizationCache {
    fn default() -> Self {
        Self::with_max_topics(DEFAULT_MAX_TOPICS)
    }
}

impl AuthorizationCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// `max_topics == 0` disables caching
    pub fn with_max_topics(max_topics: usize) -> Self {
        Self {
            publish: DashMap::new(),
            max_topics,
        }
    }

    pub fn get(&self, client_id: &str, topic: &str, qos: QoS, retain: bool) -> Option<bool> {
        self.publish
            .get(client_id)
            .and_then(|client| client.topics.get(topic).and_then(|d| d[slot(qos, retain)]))
    }

    pub fn insert(&self, client_id: &str, topic: &str, qos: QoS, retain: bool, allowed: bool) {
        if self.max_topics == 0 {
            return;
        }
        let mut entry = self.publish.entry(Arc::from(client_id)).or_default();
        let client = &mut *entry;

        if let Some(decisions) = client.topics.get_mut(topic) {
            decisions[slot(qos, retain)] = Some(allowed);
            return;
        }

        while client.topics.len() >= self.max_topics {
            let Some(oldest) = client.order.pop_front() else {
                break;
            };
            client.topics.remove(&oldest);
        }

        let topic: Arc<str> = Arc::from(topic);
        let mut decisions: Decisions = [None; 6];
        decisions[slot(qos, retain)] = Some(allowed);
        client.order.push_back(topic.clone());
        client.topics.insert(topic, decisions);
    }

    /// Forget everything cached for a client
    pub fn evict(&self, client_id: &str) {
        self.publish.remove(client_id);
    }

    /// Topics with cached decisions for one client
    pub fn topic_count(&self, client_id: &str) -> usize {
        self.publish
            .get(client_id)
            .map(|client| client.topics.len())
            .unwrap_or(0)
    }

    /// Number of clients with cached decisions
    pub fn len(&self) -> usize {
        self.publish.len()
    }

    pub fn is_empty(&self) -> bool {
        self.publish.is_empty()
    }
}
