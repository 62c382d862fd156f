//! Durable per-client redelivery backlog.
//!
//! Every QoS 1/2 message queued for a client is written here before it is
//! handed to the transport. On resume the backlog is replayed in serial order
//! ahead of any new traffic.
//!
//! Inbound QoS 2 messages a client has published and the broker has answered
//! with PUBREC are held here too, until the client's PUBREL releases them.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, error, trace};

use super::backend::StorageBackend;
use super::error::Result;
use super::models::{
    PersistedPacketType, RedeliveryRecord, StoredAwaitingRelease, StoredRedeliveryRecord,
};
use crate::protocol::Message;

pub struct RedeliveryStore {
    backend: Arc<dyn StorageBackend>,
    /// Last serial handed out per client
    serials: DashMap<Arc<str>, u64>,
}

impl RedeliveryStore {
    pub fn new(backend: Arc<dyn StorageBackend>) -> Self {
        Self {
            backend,
            serials: DashMap::new(),
        }
    }

    pub fn backend(&self) -> &Arc<dyn StorageBackend> {
        &self.backend
    }

    async fn next_serial(&self, client_id: &str) -> Result<u64> {
        if let Some(mut last) = self.serials.get_mut(client_id) {
            *last += 1;
            return Ok(*last);
        }

        // First append since startup: continue after whatever is on disk
        let stored = self.backend.last_serial(client_id).await?.unwrap_or(0);
        let mut last = self.serials.entry(Arc::from(client_id)).or_insert(stored);
        *last += 1;
        Ok(*last)
    }

    /// Durably record a message for `client_id`, returning its serial
    pub async fn append(&self, client_id: &str, message: &Message) -> Result<u64> {
        let serial = self.next_serial(client_id).await?;
        let record = StoredRedeliveryRecord::new(client_id, serial, message);
        self.backend.put_redelivery(&record).await?;
        trace!("Stored {} serial {} for {}", message.topic, serial, client_id);
        Ok(serial)
    }

    /// Everything not yet acknowledged, in ascending serial order.
    ///
    /// A record that cannot be turned back into a message is deleted so it
    /// never blocks the rest of the backlog.
    pub async fn load_for_resend(&self, client_id: &str) -> Result<Vec<RedeliveryRecord>> {
        let stored = self.backend.list_redelivery(client_id).await?;
        let mut records = Vec::with_capacity(stored.len());
        for record in stored {
            let serial = record.serial;
            match RedeliveryRecord::try_from(record) {
                Ok(record) => records.push(record),
                Err(e) => {
                    error!("Discarding {}", e);
                    self.backend.delete_redelivery(client_id, serial).await?;
                }
            }
        }
        Ok(records)
    }

    /// Remember the wire id a record went out with
    pub async fn assign_packet_id(&self, client_id: &str, serial: u64, packet_id: u16) -> Result<()> {
        self.update(client_id, serial, |record| record.packet_id = packet_id)
            .await
    }

    /// Flip a record from PUBLISH to PUBREL-pending after PUBREC
    pub async fn mark_pubrel(&self, client_id: &str, serial: u64) -> Result<()> {
        self.update(client_id, serial, |record| {
            record.packet_type = PersistedPacketType::PubRel as u8
        })
        .await
    }

    async fn update<F>(&self, client_id: &str, serial: u64, mutate: F) -> Result<()>
    where
        F: FnOnce(&mut StoredRedeliveryRecord),
    {
        match self.backend.get_redelivery(client_id, serial).await? {
            Some(mut record) => {
                mutate(&mut record);
                self.backend.put_redelivery(&record).await
            }
            None => {
                debug!("No redelivery record {} for {}", serial, client_id);
                Ok(())
            }
        }
    }

    /// Retire the record currently on the wire as `packet_id`.
    /// Returns the retired serial.
    pub async fn retire(&self, client_id: &str, packet_id: u16) -> Result<Option<u64>> {
        let records = self.backend.list_redelivery(client_id).await?;
        match records.iter().find(|r| r.packet_id == packet_id) {
            Some(record) => {
                self.backend
                    .delete_redelivery(client_id, record.serial)
                    .await?;
                Ok(Some(record.serial))
            }
            None => Ok(None),
        }
    }

    /// Retire a record by serial
    pub async fn retire_serial(&self, client_id: &str, serial: u64) -> Result<()> {
        self.backend.delete_redelivery(client_id, serial).await
    }

    /// Drop a client's whole backlog and any inbound QoS 2 messages it still
    /// holds (clean start). Returns the number of backlog records removed.
    ///
    /// Serials keep increasing afterwards. Callers must not run this while a
    /// resend for the same client is in progress.
    pub async fn clear_all(&self, client_id: &str) -> Result<usize> {
        let removed = self.backend.clear_redelivery(client_id).await?;
        let released = self.backend.clear_awaiting_release(client_id).await?;
        if removed > 0 || released > 0 {
            debug!(
                "Cleared {} redelivery records and {} awaiting-release messages for {}",
                removed, released, client_id
            );
        }
        Ok(removed)
    }

    /// Hold an inbound QoS 2 message until PUBREL
    pub async fn hold_for_release(
        &self,
        client_id: &str,
        packet_id: u16,
        message: &Message,
    ) -> Result<()> {
        self.backend
            .put_awaiting_release(&StoredAwaitingRelease::new(client_id, packet_id, message))
            .await
    }

    /// PUBREL processed; the id may be reused by the publisher
    pub async fn release(&self, client_id: &str, packet_id: u16) -> Result<()> {
        self.backend.delete_awaiting_release(client_id, packet_id).await
    }

    /// Inbound QoS 2 messages still waiting for PUBREL.
    ///
    /// Unreadable entries are deleted; the publisher's PUBREL for them gets
    /// PUBCOMP and routes nothing.
    pub async fn load_awaiting_release(&self, client_id: &str) -> Result<Vec<(u16, Message)>> {
        let stored = self.backend.list_awaiting_release(client_id).await?;
        let mut held = Vec::with_capacity(stored.len());
        for entry in stored {
            match entry.to_message() {
                Ok(message) => held.push((entry.packet_id, message)),
                Err(e) => {
                    error!("Discarding {}", e);
                    self.backend
                        .delete_awaiting_release(client_id, entry.packet_id)
                        .await?;
                }
            }
        }
        Ok(held)
    }

    /// Number of records held for a client
    pub async fn pending_count(&self, client_id: &str) -> Result<usize> {
        Ok(self.backend.list_redelivery(client_id).await?.len())
    }
}
