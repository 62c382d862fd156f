//! Hooks Module
//!
//! Authorization boundary and event callbacks. The broker core never
//! evaluates access rules itself; it asks `Hooks` and, for publishes,
//! remembers the answer per client in an `AuthorizationCache`.

mod cache;

pub use cache::AuthorizationCache;

use std::fmt;

use async_trait::async_trait;

use crate::protocol::QoS;

#[cfg(test)]
mod tests;

/// Hook error types
#[derive(Debug)]
pub enum HookError {
    /// Internal error
    Internal(String),
    /// Authorization denied
    AuthorizationDenied,
}

impl fmt::Display for HookError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HookError::Internal(msg) => write!(f, "Internal error: {}", msg),
            HookError::AuthorizationDenied => write!(f, "Authorization denied"),
        }
    }
}

impl std::error::Error for HookError {}

/// Hook result type
pub type HookResult<T> = Result<T, HookError>;

/// Broker hooks trait
///
/// Implement this trait to customize authorization and event handling.
/// All methods have default implementations that allow everything.
#[async_trait]
pub trait Hooks: Send + Sync {
    /// Called before a client's publish is routed
    ///
    /// # Returns
    /// * `Ok(true)` - Publish allowed
    /// * `Ok(false)` - Publish denied
    /// * `Err(_)` - Internal error occurred
    async fn on_publish_check(
        &self,
        _client_id: &str,
        _topic: &str,
        _qos: QoS,
        _retain: bool,
    ) -> HookResult<bool> {
        Ok(true)
    }

    /// Called before a filter is inserted into the subscription trie
    async fn on_subscribe_check(&self, _client_id: &str, _filter: &str, _qos: QoS) -> HookResult<bool> {
        Ok(true)
    }

    /// Called after a session task has been attached to a transport
    async fn on_session_started(&self, _client_id: &str, _session_present: bool) {}

    /// Called after a session ends
    ///
    /// `clean` is true when the session state was discarded.
    async fn on_session_ended(&self, _client_id: &str, _clean: bool) {}

    /// Called after a message has been routed
    async fn on_message_published(&self, _topic: &str, _payload: &[u8], _qos: QoS, _recipients: usize) {}
}

/// Default hooks implementation that allows everything
#[derive(Default)]
pub struct DefaultHooks;

#[async_trait]
impl Hooks for DefaultHooks {}

/// Implement Hooks for Arc<T> where T: Hooks
#[async_trait]
impl<T: Hooks + ?Sized> Hooks for std::sync::Arc<T> {
    async fn on_publish_check(
        &self,
        client_id: &str,
        topic: &str,
        qos: QoS,
        retain: bool,
    ) -> HookResult<bool> {
        (**self).on_publish_check(client_id, topic, qos, retain).await
    }

    async fn on_subscribe_check(&self, client_id: &str, filter: &str, qos: QoS) -> HookResult<bool> {
        (**self).on_subscribe_check(client_id, filter, qos).await
    }

    async fn on_session_started(&self, client_id: &str, session_present: bool) {
        (**self).on_session_started(client_id, session_present).await;
    }

    async fn on_session_ended(&self, client_id: &str, clean: bool) {
        (**self).on_session_ended(client_id, clean).await;
    }

    async fn on_message_published(&self, topic: &str, payload: &[u8], qos: QoS, recipients: usize) {
        (**self)
            .on_message_published(topic, payload, qos, recipients)
            .await;
    }
}

/// Composite hooks that chains multiple hook implementations
///
/// Checks pass only if every hook returns `Ok(true)`; events reach all
/// hooks in order.
#[derive(Default)]
pub struct CompositeHooks {
    hooks: Vec<Box<dyn Hooks>>,
}

impl CompositeHooks {
    pub fn new() -> Self {
        Self { hooks: Vec::new() }
    }

    pub fn add<H: Hooks + 'static>(&mut self, hooks: H) {
        self.hooks.push(Box::new(hooks));
    }

    /// Add a hooks implementation and return self for chaining
    pub fn with<H: Hooks + 'static>(mut self, hooks: H) -> Self {
        self.add(hooks);
        self
    }
}

#[async_trait]
impl Hooks for CompositeHooks {
    async fn on_publish_check(
        &self,
        client_id: &str,
        topic: &str,
        qos: QoS,
        retain: bool,
    ) -> HookResult<bool> {
        for hooks in &self.hooks {
            if !hooks.on_publish_check(client_id, topic, qos, retain).await? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    async fn on_subscribe_check(&self, client_id: &str, filter: &str, qos: QoS) -> HookResult<bool> {
        for hooks in &self.hooks {
            if !hooks.on_subscribe_check(client_id, filter, qos).await? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    async fn on_session_started(&self, client_id: &str, session_present: bool) {
        for hooks in &self.hooks {
            hooks.on_session_started(client_id, session_present).await;
        }
    }

    async fn on_session_ended(&self, client_id: &str, clean: bool) {
        for hooks in &self.hooks {
            hooks.on_session_ended(client_id, clean).await;
        }
    }

    async fn on_message_published(&self, topic: &str, payload: &[u8], qos: QoS, recipients: usize) {
        for hooks in &self.hooks {
            hooks
                .on_message_published(topic, payload, qos, recipients)
                .await;
        }
    }
}
