//! Persistence module for TrellisMQ.
//!
//! Provides durable storage for:
//! - Redelivery backlogs (unacknowledged QoS 1/2 messages per client)
//! - Inbound QoS 2 messages acknowledged with PUBREC but not yet released
//! - Retained messages
//!
//! Uses a trait-based design allowing different backends:
//! - `FjallBackend` (default) - Local LSM-tree storage
//! - `MemoryBackend` - process-local, for tests and persistence-disabled runs

mod backend;
mod error;
mod fjall;
mod memory;
mod models;
mod redelivery;

pub use backend::{PersistenceOp, StorageBackend};
pub use error::{PersistenceError, Result};
pub use fjall::FjallBackend;
pub use memory::MemoryBackend;
pub use models::{
    PersistedPacketType, RedeliveryRecord, StoredAwaitingRelease, StoredRedeliveryRecord,
    StoredRetainedMessage,
};
pub use redelivery::RedeliveryStore;

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Background writer for operations off the delivery path (retained messages)
pub struct PersistenceManager {
    backend: Arc<dyn StorageBackend>,
    tx: mpsc::Sender<PersistenceOp>,
    shutdown_tx: mpsc::Sender<()>,
    writer: Mutex<Option<JoinHandle<()>>>,
}

impl PersistenceManager {
    /// Create a new persistence manager with the given backend
    ///
    /// This spawns a background task that batches and commits writes.
    pub fn new(
        backend: Arc<dyn StorageBackend>,
        flush_interval: Duration,
        max_batch_size: usize,
    ) -> Self {
        let (tx, rx) = mpsc::channel(10_000);
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);

        let writer = tokio::spawn(Self::writer_loop(
            backend.clone(),
            rx,
            shutdown_rx,
            flush_interval,
            max_batch_size.max(1),
        ));

        Self {
            backend,
            tx,
            shutdown_tx,
            writer: Mutex::new(Some(writer)),
        }
    }

    pub fn backend(&self) -> &Arc<dyn StorageBackend> {
        &self.backend
    }

    /// Fire-and-forget write operation (non-blocking for hot path)
    ///
    /// If the channel is full, the operation is dropped (backpressure).
    pub fn write(&self, op: PersistenceOp) {
        if let Err(e) = self.tx.try_send(op) {
            warn!("Persistence channel full, dropping operation: {:?}", e);
        }
    }

    /// Stored retained messages, for restore at startup
    pub async fn load_retained(&self) -> Result<Vec<(String, StoredRetainedMessage)>> {
        self.backend.list_retained().await
    }

    /// Gracefully shutdown the persistence manager
    ///
    /// Waits for the writer to flush its batch, then closes the backend.
    pub async fn shutdown(&self) -> Result<()> {
        info!("Shutting down persistence manager");

        let _ = self.shutdown_tx.send(()).await;
        let writer = self.writer.lock().take();
        if let Some(writer) = writer {
            if let Err(e) = writer.await {
                error!("Persistence writer task failed: {}", e);
            }
        }

        self.backend.flush().await?;
        self.backend.close().await?;

        info!("Persistence manager shutdown complete");
        Ok(())
    }

    async fn flush_batch(backend: &Arc<dyn StorageBackend>, batch: &mut Vec<PersistenceOp>, why: &str) {
        if batch.is_empty() {
            return;
        }
        let count = batch.len();
        match backend.batch_write(std::mem::take(batch)).await {
            Ok(()) => debug!("Flushed {} operations ({})", count, why),
            Err(e) => error!("Failed to write batch of {} ({}): {}", count, why, e),
        }
    }

    /// Background writer loop that batches and commits writes
    async fn writer_loop(
        backend: Arc<dyn StorageBackend>,
        mut rx: mpsc::Receiver<PersistenceOp>,
        mut shutdown_rx: mpsc::Receiver<()>,
        flush_interval: Duration,
        max_batch_size: usize,
    ) {
        let mut batch = Vec::with_capacity(max_batch_size);
        let mut interval = tokio::time::interval(flush_interval);

        loop {
            tokio::select! {
                op = rx.recv() => {
                    match op {
                        Some(op) => {
                            batch.push(op);
                            if batch.len() >= max_batch_size {
                                Self::flush_batch(&backend, &mut batch, "max batch").await;
                            }
                        }
                        None => {
                            Self::flush_batch(&backend, &mut batch, "channel closed").await;
                            break;
                        }
                    }
                }

                _ = interval.tick() => {
                    Self::flush_batch(&backend, &mut batch, "interval").await;
                }

                _ = shutdown_rx.recv() => {
                    info!("Persistence writer received shutdown signal");
                    // Take whatever is still queued before the final flush
                    while let Ok(op) = rx.try_recv() {
                        batch.push(op);
                    }
                    Self::flush_batch(&backend, &mut batch, "shutdown").await;
                    break;
                }
            }
        }

        info!("Persistence writer loop exited");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn retained(topic: &str, payload: u8) -> StoredRetainedMessage {
        StoredRetainedMessage {
            topic: topic.to_string(),
            payload: vec![payload],
            qos: 1,
            timestamp_secs: 0,
        }
    }

    #[tokio::test]
    async fn test_fjall_backend_retained_operations() {
        let temp_dir = tempfile::tempdir().unwrap();
        let backend = FjallBackend::open(temp_dir.path()).unwrap();

        backend
            .set_retained("test/topic", &retained("test/topic", 3))
            .await
            .unwrap();

        let retrieved = backend.get_retained("test/topic").await.unwrap().unwrap();
        assert_eq!(retrieved.topic, "test/topic");
        assert_eq!(retrieved.payload, vec![3]);

        backend.delete_retained("test/topic").await.unwrap();
        assert!(backend.get_retained("test/topic").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_fjall_redelivery_prefix_isolation() {
        let temp_dir = tempfile::tempdir().unwrap();
        let backend = FjallBackend::open(temp_dir.path()).unwrap();
        let message = crate::protocol::Message::new("t", "p", crate::protocol::QoS::AtLeastOnce, false);

        // "ab" must not see records of "a" and vice versa
        for serial in [3, 1, 2] {
            backend
                .put_redelivery(&StoredRedeliveryRecord::new("a", serial, &message))
                .await
                .unwrap();
        }
        backend
            .put_redelivery(&StoredRedeliveryRecord::new("ab", 7, &message))
            .await
            .unwrap();

        let serials: Vec<u64> = backend
            .list_redelivery("a")
            .await
            .unwrap()
            .iter()
            .map(|r| r.serial)
            .collect();
        assert_eq!(serials, vec![1, 2, 3]);
        assert_eq!(backend.last_serial("a").await.unwrap(), Some(3));
        assert_eq!(backend.last_serial("ab").await.unwrap(), Some(7));

        assert_eq!(backend.clear_redelivery("a").await.unwrap(), 3);
        assert_eq!(backend.list_redelivery("ab").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_fjall_backend_batch_write() {
        let temp_dir = tempfile::tempdir().unwrap();
        let backend = FjallBackend::open(temp_dir.path()).unwrap();

        let ops = vec![
            PersistenceOp::SetRetained {
                topic: "topic1".to_string(),
                message: retained("topic1", 1),
            },
            PersistenceOp::SetRetained {
                topic: "topic2".to_string(),
                message: retained("topic2", 2),
            },
            PersistenceOp::DeleteRetained {
                topic: "topic1".to_string(),
            },
        ];

        backend.batch_write(ops).await.unwrap();

        let retained = backend.list_retained().await.unwrap();
        assert_eq!(retained.len(), 1);
        assert_eq!(retained[0].0, "topic2");
    }

    #[tokio::test]
    async fn test_manager_flushes_on_shutdown() {
        let backend: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
        let manager = PersistenceManager::new(backend.clone(), Duration::from_secs(3600), 100);

        manager.write(PersistenceOp::SetRetained {
            topic: "a".to_string(),
            message: retained("a", 1),
        });
        manager.shutdown().await.unwrap();

        assert!(backend.get_retained("a").await.unwrap().is_some());
    }
}
