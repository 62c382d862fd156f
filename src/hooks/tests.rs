//! Hooks module tests

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use super::*;

#[tokio::test]
async fn test_default_hooks_allow_all() {
    let hooks = DefaultHooks;

    let result = hooks
        .on_publish_check("client1", "test/topic", QoS::AtMostOnce, false)
        .await
        .unwrap();
    assert!(result, "DefaultHooks should allow publish");

    let result = hooks
        .on_subscribe_check("client1", "test/#", QoS::AtLeastOnce)
        .await
        .unwrap();
    assert!(result, "DefaultHooks should allow subscribe");
}

struct DenyPrefix(&'static str);

#[async_trait]
impl Hooks for DenyPrefix {
    async fn on_publish_check(
        &self,
        _client_id: &str,
        topic: &str,
        _qos: QoS,
        _retain: bool,
    ) -> HookResult<bool> {
        Ok(!topic.starts_with(self.0))
    }

    async fn on_subscribe_check(&self, _client_id: &str, filter: &str, _qos: QoS) -> HookResult<bool> {
        Ok(!filter.starts_with(self.0))
    }
}

struct FailingHooks;

#[async_trait]
impl Hooks for FailingHooks {
    async fn on_publish_check(
        &self,
        _client_id: &str,
        _topic: &str,
        _qos: QoS,
        _retain: bool,
    ) -> HookResult<bool> {
        Err(HookError::Internal("backend unavailable".into()))
    }
}

#[derive(Default)]
struct CountingHooks {
    started: AtomicUsize,
    ended: AtomicUsize,
    published: AtomicUsize,
}

#[async_trait]
impl Hooks for CountingHooks {
    async fn on_session_started(&self, _client_id: &str, _session_present: bool) {
        self.started.fetch_add(1, Ordering::SeqCst);
    }

    async fn on_session_ended(&self, _client_id: &str, _clean: bool) {
        self.ended.fetch_add(1, Ordering::SeqCst);
    }

    async fn on_message_published(&self, _topic: &str, _payload: &[u8], _qos: QoS, recipients: usize) {
        self.published.fetch_add(recipients, Ordering::SeqCst);
    }
}

#[tokio::test]
async fn test_composite_requires_all_to_allow() {
    let hooks = CompositeHooks::new()
        .with(DefaultHooks)
        .with(DenyPrefix("secret/"));

    assert!(hooks
        .on_publish_check("c", "public/a", QoS::AtMostOnce, false)
        .await
        .unwrap());
    assert!(!hooks
        .on_publish_check("c", "secret/a", QoS::AtMostOnce, false)
        .await
        .unwrap());
    assert!(!hooks
        .on_subscribe_check("c", "secret/#", QoS::AtMostOnce)
        .await
        .unwrap());
}

#[tokio::test]
async fn test_composite_propagates_errors() {
    let hooks = CompositeHooks::new().with(FailingHooks);
    let err = hooks
        .on_publish_check("c", "t", QoS::AtMostOnce, false)
        .await
        .unwrap_err();
    assert!(matches!(err, HookError::Internal(_)));
}

#[tokio::test]
async fn test_events_reach_every_hook_through_arc() {
    let counter = Arc::new(CountingHooks::default());
    let hooks = CompositeHooks::new()
        .with(counter.clone())
        .with(counter.clone());

    hooks.on_session_started("c", false).await;
    hooks.on_session_ended("c", true).await;
    hooks.on_message_published("t", b"p", QoS::AtMostOnce, 3).await;

    assert_eq!(counter.started.load(Ordering::SeqCst), 2);
    assert_eq!(counter.ended.load(Ordering::SeqCst), 2);
    assert_eq!(counter.published.load(Ordering::SeqCst), 6);
}

#[test]
fn test_authorization_cache_evict() {
    let cache = AuthorizationCache::new();
    cache.insert("a", "t/1", QoS::AtMostOnce, false, true);
    cache.insert("a", "t/2", QoS::AtMostOnce, false, false);
    cache.insert("b", "t/1", QoS::AtMostOnce, false, true);

    assert_eq!(cache.get("a", "t/1", QoS::AtMostOnce, false), Some(true));
    assert_eq!(cache.get("a", "t/2", QoS::AtMostOnce, false), Some(false));
    assert_eq!(cache.get("a", "t/3", QoS::AtMostOnce, false), None);

    cache.evict("a");
    assert_eq!(cache.get("a", "t/1", QoS::AtMostOnce, false), None);
    assert_eq!(cache.get("b", "t/1", QoS::AtMostOnce, false), Some(true));
    assert_eq!(cache.len(), 1);
}

#[test]
fn test_authorization_cache_keys_on_qos_and_retain() {
    let cache = AuthorizationCache::new();
    cache.insert("a", "t", QoS::AtLeastOnce, false, true);

    assert_eq!(cache.get("a", "t", QoS::AtLeastOnce, false), Some(true));
    assert_eq!(cache.get("a", "t", QoS::AtLeastOnce, true), None);
    assert_eq!(cache.get("a", "t", QoS::ExactlyOnce, false), None);

    cache.insert("a", "t", QoS::AtLeastOnce, true, false);
    assert_eq!(cache.get("a", "t", QoS::AtLeastOnce, true), Some(false));
    assert_eq!(cache.get("a", "t", QoS::AtLeastOnce, false), Some(true));
    assert_eq!(cache.topic_count("a"), 1);
}

#[test]
fn test_authorization_cache_bounded_per_client() {
    let cache = AuthorizationCache::with_max_topics(3);
    for n in 0..10 {
        cache.insert("a", &format!("t/{}", n), QoS::AtMostOnce, false, true);
    }

    assert_eq!(cache.topic_count("a"), 3);
    assert_eq!(cache.get("a", "t/0", QoS::AtMostOnce, false), None);
    assert_eq!(cache.get("a", "t/9", QoS::AtMostOnce, false), Some(true));

    let disabled = AuthorizationCache::with_max_topics(0);
    disabled.insert("a", "t", QoS::AtMostOnce, false, true);
    assert!(disabled.is_empty());
}
