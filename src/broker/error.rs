//! Dispatch error types.

use std::fmt;
use std::sync::Arc;

use crate::hooks::HookError;
use crate::persistence::PersistenceError;
use crate::session::SessionError;
use crate::topic::TopicError;

/// Errors returned by the broker's public operations.
///
/// Per-recipient delivery failures are not errors: they are reported in
/// `PublishReport` and never abort delivery to other recipients.
#[derive(Debug)]
pub enum DispatchError {
    /// Publish topic rejected before any state changed
    InvalidTopic(TopicError),
    /// Subscription filter rejected before any state changed
    InvalidFilter(TopicError),
    /// Authorization hook denied the operation
    NotAuthorized { client_id: Arc<str>, topic: String },
    /// No session task for this client
    NoSession(Arc<str>),
    /// Session task error (unknown packet id, closed, ...)
    Session(SessionError),
    /// Storage failure
    Persistence(PersistenceError),
    /// Authorization hook failed
    Hook(HookError),
}

impl fmt::Display for DispatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidTopic(e) => write!(f, "{}", e),
            Self::InvalidFilter(e) => write!(f, "{}", e),
            Self::NotAuthorized { client_id, topic } => {
                write!(f, "{} not authorized for {}", client_id, topic)
            }
            Self::NoSession(client_id) => write!(f, "no session for {}", client_id),
            Self::Session(e) => write!(f, "session error: {}", e),
            Self::Persistence(e) => write!(f, "persistence error: {}", e),
            Self::Hook(e) => write!(f, "hook error: {}", e),
        }
    }
}

impl std::error::Error for DispatchError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::InvalidTopic(e) | Self::InvalidFilter(e) => Some(e),
            Self::Session(e) => Some(e),
            Self::Persistence(e) => Some(e),
            Self::Hook(e) => Some(e),
            _ => None,
        }
    }
}

impl From<SessionError> for DispatchError {
    fn from(err: SessionError) -> Self {
        Self::Session(err)
    }
}

impl From<PersistenceError> for DispatchError {
    fn from(err: PersistenceError) -> Self {
        Self::Persistence(err)
    }
}

impl From<HookError> for DispatchError {
    fn from(err: HookError) -> Self {
        Self::Hook(err)
    }
}
