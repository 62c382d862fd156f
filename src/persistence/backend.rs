//! Storage backend trait for persistence.
//!
//! Backends hold three kinds of data: retained messages keyed by topic,
//! redelivery records keyed by (client ID, serial) and scanned in serial
//! order, and inbound QoS 2 messages awaiting PUBREL keyed by (client ID,
//! packet ID).

use async_trait::async_trait;

use super::error::Result;
use super::models::{StoredAwaitingRelease, StoredRedeliveryRecord, StoredRetainedMessage};

/// Persistence operation for batch writes
#[derive(Debug, Clone)]
pub enum PersistenceOp {
    /// Set a retained message
    SetRetained {
        topic: String,
        message: StoredRetainedMessage,
    },
    /// Delete a retained message
    DeleteRetained { topic: String },
    /// Insert or overwrite a redelivery record
    PutRedelivery { record: StoredRedeliveryRecord },
    /// Delete a redelivery record
    DeleteRedelivery { client_id: String, serial: u64 },
}

/// Storage backend trait for persistence
#[async_trait]
pub trait StorageBackend: Send + Sync {
    // ========================================================================
    // Retained messages
    // ========================================================================

    /// Get a retained message by topic
    async fn get_retained(&self, topic: &str) -> Result<Option<StoredRetainedMessage>>;

    /// Set a retained message
    async fn set_retained(&self, topic: &str, message: &StoredRetainedMessage) -> Result<()>;

    /// Delete a retained message
    async fn delete_retained(&self, topic: &str) -> Result<()>;

    /// List all retained messages
    async fn list_retained(&self) -> Result<Vec<(String, StoredRetainedMessage)>>;

    // ========================================================================
    // Redelivery records
    // ========================================================================

    /// Insert or overwrite a record
    async fn put_redelivery(&self, record: &StoredRedeliveryRecord) -> Result<()>;

    /// Get a record by client and serial
    async fn get_redelivery(
        &self,
        client_id: &str,
        serial: u64,
    ) -> Result<Option<StoredRedeliveryRecord>>;

    /// Delete a record
    async fn delete_redelivery(&self, client_id: &str, serial: u64) -> Result<()>;

    /// All records of a client in ascending serial order
    async fn list_redelivery(&self, client_id: &str) -> Result<Vec<StoredRedeliveryRecord>>;

    /// Delete all records of a client, returning how many were removed
    async fn clear_redelivery(&self, client_id: &str) -> Result<usize>;

    /// Highest serial stored for a client
    async fn last_serial(&self, client_id: &str) -> Result<Option<u64>> {
        Ok(self
            .list_redelivery(client_id)
            .await?
            .last()
            .map(|r| r.serial))
    }

    // ========================================================================
    // Inbound QoS 2 awaiting PUBREL
    // ========================================================================

    /// Hold an inbound message until its PUBREL arrives
    async fn put_awaiting_release(&self, message: &StoredAwaitingRelease) -> Result<()>;

    /// PUBREL processed
    async fn delete_awaiting_release(&self, client_id: &str, packet_id: u16) -> Result<()>;

    /// All held messages of a client in packet id order
    async fn list_awaiting_release(&self, client_id: &str) -> Result<Vec<StoredAwaitingRelease>>;

    /// Delete all held messages of a client, returning how many were removed
    async fn clear_awaiting_release(&self, client_id: &str) -> Result<usize>;

    // ========================================================================
    // Batch operations
    // ========================================================================

    /// Execute a batch of operations atomically
    async fn batch_write(&self, ops: Vec<PersistenceOp>) -> Result<()>;

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Flush all pending writes to disk
    async fn flush(&self) -> Result<()>;

    /// Close the backend (flush and release resources)
    async fn close(&self) -> Result<()>;
}
