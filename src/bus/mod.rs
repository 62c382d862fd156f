//! Cluster message bus boundary
//!
//! The broker treats the inter-node log as an opaque at-least-once
//! publish/subscribe primitive. `LocalBus` is the in-process implementation
//! used by a single node and by tests; a networked log plugs in behind the
//! same trait.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::broadcast;
use tracing::trace;

/// Errors from the message bus
#[derive(Debug)]
pub enum BusError {
    /// The bus is shut down
    Closed,
    /// Record could not be encoded
    Serialize(String),
}

impl fmt::Display for BusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BusError::Closed => write!(f, "message bus closed"),
            BusError::Serialize(e) => write!(f, "message bus serialization error: {}", e),
        }
    }
}

impl std::error::Error for BusError {}

impl From<bincode::error::EncodeError> for BusError {
    fn from(err: bincode::error::EncodeError) -> Self {
        BusError::Serialize(err.to_string())
    }
}

/// One record on a bus topic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusRecord {
    /// Node that produced the record
    pub origin: Arc<str>,
    pub payload: Bytes,
}

/// Partitioned publish/subscribe log between broker nodes
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Append a record; returns once the bus has accepted it
    async fn send(&self, topic: &str, record: BusRecord) -> Result<(), BusError>;

    /// Receive every record sent to `topic` from now on
    fn subscribe(&self, topic: &str) -> broadcast::Receiver<BusRecord>;
}

/// In-process bus over tokio broadcast channels
pub struct LocalBus {
    topics: DashMap<String, broadcast::Sender<BusRecord>>,
    capacity: usize,
}

impl LocalBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            topics: DashMap::new(),
            capacity: capacity.max(1),
        }
    }

    fn sender(&self, topic: &str) -> broadcast::Sender<BusRecord> {
        self.topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait]
impl MessageBus for LocalBus {
    async fn send(&self, topic: &str, record: BusRecord) -> Result<(), BusError> {
        let receivers = self.sender(topic).send(record).unwrap_or(0);
        trace!("Bus record on {} reached {} receivers", topic, receivers);
        Ok(())
    }

    fn subscribe(&self, topic: &str) -> broadcast::Receiver<BusRecord> {
        self.sender(topic).subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_local_bus_fanout() {
        let bus = LocalBus::default();
        let mut a = bus.subscribe("retained");
        let mut b = bus.subscribe("retained");
        let mut other = bus.subscribe("other");

        let record = BusRecord {
            origin: Arc::from("node-1"),
            payload: Bytes::from_static(b"x"),
        };
        bus.send("retained", record.clone()).await.unwrap();

        assert_eq!(a.recv().await.unwrap(), record);
        assert_eq!(b.recv().await.unwrap(), record);
        assert!(other.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_send_without_receivers_is_ok() {
        let bus = LocalBus::default();
        let record = BusRecord {
            origin: Arc::from("n"),
            payload: Bytes::new(),
        };
        assert!(bus.send("nobody", record).await.is_ok());
    }
}
