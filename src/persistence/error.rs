//! Persistence error types.

use std::fmt;

/// Errors raised by storage backends and the redelivery store.
#[derive(Debug)]
pub enum PersistenceError {
    /// Backend rejected the operation
    Storage(String),
    /// A record could not be bincode-encoded
    Encode(String),
    /// Stored bytes are not a bincode record
    Decode(String),
    /// Redelivery record decoded but holds values no writer produces
    CorruptRecord {
        client_id: String,
        serial: u64,
        reason: String,
    },
    /// Inbound QoS 2 message awaiting PUBREL is unreadable
    CorruptRelease {
        client_id: String,
        packet_id: u16,
        reason: String,
    },
    /// Retained message decoded but holds values no writer produces
    CorruptRetained { topic: String, reason: String },
}

impl fmt::Display for PersistenceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Storage(e) => write!(f, "storage error: {}", e),
            Self::Encode(e) => write!(f, "record encoding failed: {}", e),
            Self::Decode(e) => write!(f, "record decoding failed: {}", e),
            Self::CorruptRecord {
                client_id,
                serial,
                reason,
            } => write!(f, "redelivery record {}/{} is corrupt: {}", client_id, serial, reason),
            Self::CorruptRelease {
                client_id,
                packet_id,
                reason,
            } => write!(
                f,
                "awaiting-release message {}/{} is corrupt: {}",
                client_id, packet_id, reason
            ),
            Self::CorruptRetained { topic, reason } => {
                write!(f, "retained message on {} is corrupt: {}", topic, reason)
            }
        }
    }
}

impl std::error::Error for PersistenceError {}

impl From<fjall::Error> for PersistenceError {
    fn from(err: fjall::Error) -> Self {
        Self::Storage(err.to_string())
    }
}

impl From<bincode::error::EncodeError> for PersistenceError {
    fn from(err: bincode::error::EncodeError) -> Self {
        Self::Encode(err.to_string())
    }
}

impl From<bincode::error::DecodeError> for PersistenceError {
    fn from(err: bincode::error::DecodeError) -> Self {
        Self::Decode(err.to_string())
    }
}

/// Result type for persistence operations.
pub type Result<T> = std::result::Result<T, PersistenceError>;
