//! Fjall-based storage backend implementation.
//!
//! Uses fjall (an LSM-tree based embedded database) for local persistence.
//! Redelivery keys are `client_id 0x00 serial(be u64)` so a prefix scan
//! yields one client's backlog already in serial order. Awaiting-release keys
//! are `client_id 0x00 packet_id(be u16)`.

use std::path::Path;

use async_trait::async_trait;
use fjall::{Config, Keyspace, PartitionCreateOptions, PartitionHandle, PersistMode};
use tracing::warn;

use super::backend::{PersistenceOp, StorageBackend};
use super::error::{PersistenceError, Result};
use super::models::{StoredAwaitingRelease, StoredRedeliveryRecord, StoredRetainedMessage};

/// Fjall-based storage backend
pub struct FjallBackend {
    keyspace: Keyspace,
    retained: PartitionHandle,
    redelivery: PartitionHandle,
    awaiting_release: PartitionHandle,
}

impl FjallBackend {
    /// Open a fjall backend at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let keyspace = Config::new(path).open()?;

        let retained = keyspace.open_partition("retained", PartitionCreateOptions::default())?;
        let redelivery =
            keyspace.open_partition("redelivery", PartitionCreateOptions::default())?;
        let awaiting_release =
            keyspace.open_partition("awaiting_release", PartitionCreateOptions::default())?;

        Ok(Self {
            keyspace,
            retained,
            redelivery,
            awaiting_release,
        })
    }

    fn client_prefix(client_id: &str) -> Vec<u8> {
        let mut key = Vec::with_capacity(client_id.len() + 1);
        key.extend_from_slice(client_id.as_bytes());
        key.push(0);
        key
    }

    fn redelivery_key(client_id: &str, serial: u64) -> Vec<u8> {
        let mut key = Self::client_prefix(client_id);
        key.extend_from_slice(&serial.to_be_bytes());
        key
    }

    fn release_key(client_id: &str, packet_id: u16) -> Vec<u8> {
        let mut key = Self::client_prefix(client_id);
        key.extend_from_slice(&packet_id.to_be_bytes());
        key
    }

    /// Serial from the tail of a redelivery key
    fn key_serial(key: &[u8]) -> Option<u64> {
        let tail = key.len().checked_sub(8).map(|start| &key[start..])?;
        <[u8; 8]>::try_from(tail).ok().map(u64::from_be_bytes)
    }

    fn clear_prefix(&self, partition: &PartitionHandle, client_id: &str) -> Result<usize> {
        let mut batch = self.keyspace.batch();
        let mut count = 0;
        for item in partition.prefix(Self::client_prefix(client_id)) {
            let (key, _) = item?;
            batch.remove(partition, key);
            count += 1;
        }
        batch.commit()?;
        Ok(count)
    }

    /// Serialize a value using bincode
    fn serialize<T: bincode::Encode>(value: &T) -> Result<Vec<u8>> {
        bincode::encode_to_vec(value, bincode::config::standard()).map_err(PersistenceError::from)
    }

    /// Deserialize a value using bincode
    fn deserialize<T: bincode::Decode<()>>(bytes: &[u8]) -> Result<T> {
        bincode::decode_from_slice(bytes, bincode::config::standard())
            .map(|(value, _)| value)
            .map_err(PersistenceError::from)
    }
}

#[async_trait]
impl StorageBackend for FjallBackend {
    // ========================================================================
    // Retained messages
    // ========================================================================

    async fn get_retained(&self, topic: &str) -> Result<Option<StoredRetainedMessage>> {
        match self.retained.get(topic)? {
            Some(bytes) => Ok(Some(Self::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn set_retained(&self, topic: &str, message: &StoredRetainedMessage) -> Result<()> {
        let bytes = Self::serialize(message)?;
        self.retained.insert(topic, bytes)?;
        Ok(())
    }

    async fn delete_retained(&self, topic: &str) -> Result<()> {
        self.retained.remove(topic)?;
        Ok(())
    }

    async fn list_retained(&self) -> Result<Vec<(String, StoredRetainedMessage)>> {
        let mut result = Vec::new();
        for item in self.retained.iter() {
            let (key, value) = item?;
            let topic = String::from_utf8_lossy(&key).to_string();
            let message: StoredRetainedMessage = Self::deserialize(&value)?;
            result.push((topic, message));
        }
        Ok(result)
    }

    // ========================================================================
    // Redelivery records
    // ========================================================================

    async fn put_redelivery(&self, record: &StoredRedeliveryRecord) -> Result<()> {
        let bytes = Self::serialize(record)?;
        self.redelivery
            .insert(Self::redelivery_key(&record.client_id, record.serial), bytes)?;
        Ok(())
    }

    async fn get_redelivery(
        &self,
        client_id: &str,
        serial: u64,
    ) -> Result<Option<StoredRedeliveryRecord>> {
        match self.redelivery.get(Self::redelivery_key(client_id, serial))? {
            Some(bytes) => Ok(Some(Self::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn delete_redelivery(&self, client_id: &str, serial: u64) -> Result<()> {
        self.redelivery
            .remove(Self::redelivery_key(client_id, serial))?;
        Ok(())
    }

    async fn list_redelivery(&self, client_id: &str) -> Result<Vec<StoredRedeliveryRecord>> {
        let mut result = Vec::new();
        for item in self.redelivery.prefix(Self::client_prefix(client_id)) {
            let (key, value) = item?;
            match Self::deserialize::<StoredRedeliveryRecord>(&value) {
                Ok(record) => result.push(record),
                Err(e) => {
                    // Left in place; `last_serial` reads keys, so serials stay monotonic
                    warn!(
                        "Skipping undecodable redelivery record {}/{:?}: {}",
                        client_id,
                        Self::key_serial(&key),
                        e
                    );
                }
            }
        }
        Ok(result)
    }

    async fn clear_redelivery(&self, client_id: &str) -> Result<usize> {
        self.clear_prefix(&self.redelivery, client_id)
    }

    async fn last_serial(&self, client_id: &str) -> Result<Option<u64>> {
        match self
            .redelivery
            .prefix(Self::client_prefix(client_id))
            .next_back()
        {
            Some(item) => {
                let (key, _) = item?;
                Ok(Self::key_serial(&key))
            }
            None => Ok(None),
        }
    }

    // ========================================================================
    // Inbound QoS 2 awaiting PUBREL
    // ========================================================================

    async fn put_awaiting_release(&self, message: &StoredAwaitingRelease) -> Result<()> {
        let bytes = Self::serialize(message)?;
        self.awaiting_release
            .insert(Self::release_key(&message.client_id, message.packet_id), bytes)?;
        Ok(())
    }

    async fn delete_awaiting_release(&self, client_id: &str, packet_id: u16) -> Result<()> {
        self.awaiting_release
            .remove(Self::release_key(client_id, packet_id))?;
        Ok(())
    }

    async fn list_awaiting_release(&self, client_id: &str) -> Result<Vec<StoredAwaitingRelease>> {
        let mut result = Vec::new();
        for item in self.awaiting_release.prefix(Self::client_prefix(client_id)) {
            let (_, value) = item?;
            match Self::deserialize::<StoredAwaitingRelease>(&value) {
                Ok(message) => result.push(message),
                Err(e) => warn!(
                    "Skipping undecodable awaiting-release message for {}: {}",
                    client_id, e
                ),
            }
        }
        Ok(result)
    }

    async fn clear_awaiting_release(&self, client_id: &str) -> Result<usize> {
        self.clear_prefix(&self.awaiting_release, client_id)
    }

    // ========================================================================
    // Batch operations
    // ========================================================================

    async fn batch_write(&self, ops: Vec<PersistenceOp>) -> Result<()> {
        let mut batch = self.keyspace.batch();

        for op in ops {
            match op {
                PersistenceOp::SetRetained { topic, message } => {
                    let bytes = Self::serialize(&message)?;
                    batch.insert(&self.retained, topic, bytes);
                }
                PersistenceOp::DeleteRetained { topic } => {
                    batch.remove(&self.retained, topic);
                }
                PersistenceOp::PutRedelivery { record } => {
                    let bytes = Self::serialize(&record)?;
                    batch.insert(
                        &self.redelivery,
                        Self::redelivery_key(&record.client_id, record.serial),
                        bytes,
                    );
                }
                PersistenceOp::DeleteRedelivery { client_id, serial } => {
                    batch.remove(&self.redelivery, Self::redelivery_key(&client_id, serial));
                }
            }
        }

        batch.commit()?;
        Ok(())
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    async fn flush(&self) -> Result<()> {
        self.keyspace.persist(PersistMode::SyncAll)?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.flush().await?;
        // fjall handles cleanup on drop
        Ok(())
    }
}
