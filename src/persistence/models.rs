//! Serializable data models for persistence.
//!
//! Storage-friendly forms of the runtime types, encoded with bincode.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use bincode::{Decode, Encode};
use bytes::Bytes;

use super::error::{PersistenceError, Result};
use crate::protocol::{Message, QoS};

/// What a redelivery record re-sends on resume
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PersistedPacketType {
    /// PUBLISH not yet acknowledged (or PUBREC not yet received)
    Publish = 0,
    /// PUBREC received, PUBREL sent, waiting for PUBCOMP
    PubRel = 1,
}

impl PersistedPacketType {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::Publish),
            1 => Some(Self::PubRel),
            _ => None,
        }
    }
}

/// Stored redelivery record, keyed by (client_id, serial)
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct StoredRedeliveryRecord {
    pub client_id: String,
    pub serial: u64,
    /// 0 until an id is assigned on the wire
    pub packet_id: u16,
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: u8,
    pub retain: bool,
    /// See `PersistedPacketType`
    pub packet_type: u8,
    /// Unix timestamp in seconds when the record was created
    pub stored_at_secs: u64,
}

impl StoredRedeliveryRecord {
    pub fn new(client_id: &str, serial: u64, message: &Message) -> Self {
        Self {
            client_id: client_id.to_string(),
            serial,
            packet_id: 0,
            topic: message.topic.to_string(),
            payload: message.payload.to_vec(),
            qos: message.qos as u8,
            retain: message.retain,
            packet_type: PersistedPacketType::Publish as u8,
            stored_at_secs: now_secs(),
        }
    }
}

/// A redelivery record in its runtime form
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedeliveryRecord {
    pub serial: u64,
    pub packet_id: Option<u16>,
    pub packet_type: PersistedPacketType,
    pub message: Message,
}

impl TryFrom<StoredRedeliveryRecord> for RedeliveryRecord {
    type Error = PersistenceError;

    fn try_from(stored: StoredRedeliveryRecord) -> Result<Self> {
        let corrupt = |reason: String| PersistenceError::CorruptRecord {
            client_id: stored.client_id.clone(),
            serial: stored.serial,
            reason,
        };
        let qos = QoS::from_u8(stored.qos)
            .ok_or_else(|| corrupt(format!("invalid QoS {}", stored.qos)))?;
        let packet_type = PersistedPacketType::from_u8(stored.packet_type)
            .ok_or_else(|| corrupt(format!("invalid packet type {}", stored.packet_type)))?;

        Ok(Self {
            serial: stored.serial,
            packet_id: (stored.packet_id != 0).then_some(stored.packet_id),
            packet_type,
            message: Message {
                topic: Arc::from(stored.topic),
                payload: Bytes::from(stored.payload),
                qos,
                retain: stored.retain,
            },
        })
    }
}

/// Inbound QoS 2 message held between PUBREC and PUBREL, keyed by
/// (client_id, packet_id)
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct StoredAwaitingRelease {
    pub client_id: String,
    pub packet_id: u16,
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: u8,
    pub retain: bool,
    /// Unix timestamp in seconds when PUBREC was sent
    pub received_at_secs: u64,
}

impl StoredAwaitingRelease {
    pub fn new(client_id: &str, packet_id: u16, message: &Message) -> Self {
        Self {
            client_id: client_id.to_string(),
            packet_id,
            topic: message.topic.to_string(),
            payload: message.payload.to_vec(),
            qos: message.qos as u8,
            retain: message.retain,
            received_at_secs: now_secs(),
        }
    }

    pub fn to_message(&self) -> Result<Message> {
        let qos = QoS::from_u8(self.qos).ok_or_else(|| PersistenceError::CorruptRelease {
            client_id: self.client_id.clone(),
            packet_id: self.packet_id,
            reason: format!("invalid QoS {}", self.qos),
        })?;
        Ok(Message::new(
            self.topic.as_str(),
            Bytes::from(self.payload.clone()),
            qos,
            self.retain,
        ))
    }
}

/// Stored retained message
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct StoredRetainedMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: u8,
    /// Unix timestamp in seconds when the message was stored
    pub timestamp_secs: u64,
}

impl From<&Message> for StoredRetainedMessage {
    fn from(message: &Message) -> Self {
        Self {
            topic: message.topic.to_string(),
            payload: message.payload.to_vec(),
            qos: message.qos as u8,
            timestamp_secs: now_secs(),
        }
    }
}

impl StoredRetainedMessage {
    pub fn to_message(&self) -> Result<Message> {
        let qos = QoS::from_u8(self.qos).ok_or_else(|| PersistenceError::CorruptRetained {
            topic: self.topic.clone(),
            reason: format!("invalid QoS {}", self.qos),
        })?;
        Ok(Message::new(
            self.topic.as_str(),
            Bytes::from(self.payload.clone()),
            qos,
            true,
        ))
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
