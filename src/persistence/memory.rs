//! In-memory storage backend.
//!
//! Used when persistence is disabled and in tests. Nothing survives a restart.

use std::collections::BTreeMap;

use async_trait::async_trait;
use parking_lot::RwLock;

use super::backend::{PersistenceOp, StorageBackend};
use super::error::Result;
use super::models::{StoredAwaitingRelease, StoredRedeliveryRecord, StoredRetainedMessage};

#[derive(Default)]
pub struct MemoryBackend {
    retained: RwLock<BTreeMap<String, StoredRetainedMessage>>,
    redelivery: RwLock<BTreeMap<(String, u64), StoredRedeliveryRecord>>,
    awaiting_release: RwLock<BTreeMap<(String, u16), StoredAwaitingRelease>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn client_range(
        map: &BTreeMap<(String, u64), StoredRedeliveryRecord>,
        client_id: &str,
    ) -> Vec<StoredRedeliveryRecord> {
        map.range((client_id.to_string(), 0)..=(client_id.to_string(), u64::MAX))
            .map(|(_, r)| r.clone())
            .collect()
    }

    fn apply(&self, op: PersistenceOp) {
        match op {
            PersistenceOp::SetRetained { topic, message } => {
                self.retained.write().insert(topic, message);
            }
            PersistenceOp::DeleteRetained { topic } => {
                self.retained.write().remove(&topic);
            }
            PersistenceOp::PutRedelivery { record } => {
                self.redelivery
                    .write()
                    .insert((record.client_id.clone(), record.serial), record);
            }
            PersistenceOp::DeleteRedelivery { client_id, serial } => {
                self.redelivery.write().remove(&(client_id, serial));
            }
        }
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    async fn get_retained(&self, topic: &str) -> Result<Option<StoredRetainedMessage>> {
        Ok(self.retained.read().get(topic).cloned())
    }

    async fn set_retained(&self, topic: &str, message: &StoredRetainedMessage) -> Result<()> {
        self.retained
            .write()
            .insert(topic.to_string(), message.clone());
        Ok(())
    }

    async fn delete_retained(&self, topic: &str) -> Result<()> {
        self.retained.write().remove(topic);
        Ok(())
    }

    async fn list_retained(&self) -> Result<Vec<(String, StoredRetainedMessage)>> {
        Ok(self
            .retained
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    async fn put_redelivery(&self, record: &StoredRedeliveryRecord) -> Result<()> {
        self.redelivery
            .write()
            .insert((record.client_id.clone(), record.serial), record.clone());
        Ok(())
    }

    async fn get_redelivery(
        &self,
        client_id: &str,
        serial: u64,
    ) -> Result<Option<StoredRedeliveryRecord>> {
        Ok(self
            .redelivery
            .read()
            .get(&(client_id.to_string(), serial))
            .cloned())
    }

    async fn delete_redelivery(&self, client_id: &str, serial: u64) -> Result<()> {
        self.redelivery
            .write()
            .remove(&(client_id.to_string(), serial));
        Ok(())
    }

    async fn list_redelivery(&self, client_id: &str) -> Result<Vec<StoredRedeliveryRecord>> {
        Ok(Self::client_range(&self.redelivery.read(), client_id))
    }

    async fn clear_redelivery(&self, client_id: &str) -> Result<usize> {
        let mut map = self.redelivery.write();
        let before = map.len();
        map.retain(|(client, _), _| client != client_id);
        Ok(before - map.len())
    }

    async fn put_awaiting_release(&self, message: &StoredAwaitingRelease) -> Result<()> {
        self.awaiting_release
            .write()
            .insert((message.client_id.clone(), message.packet_id), message.clone());
        Ok(())
    }

    async fn delete_awaiting_release(&self, client_id: &str, packet_id: u16) -> Result<()> {
        self.awaiting_release
            .write()
            .remove(&(client_id.to_string(), packet_id));
        Ok(())
    }

    async fn list_awaiting_release(&self, client_id: &str) -> Result<Vec<StoredAwaitingRelease>> {
        Ok(self
            .awaiting_release
            .read()
            .range((client_id.to_string(), 0)..=(client_id.to_string(), u16::MAX))
            .map(|(_, m)| m.clone())
            .collect())
    }

    async fn clear_awaiting_release(&self, client_id: &str) -> Result<usize> {
        let mut map = self.awaiting_release.write();
        let before = map.len();
        map.retain(|(client, _), _| client != client_id);
        Ok(before - map.len())
    }

    async fn batch_write(&self, ops: Vec<PersistenceOp>) -> Result<()> {
        for op in ops {
            self.apply(op);
        }
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
