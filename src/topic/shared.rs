//! Shared subscription target selection
//!
//! Each publish reaches exactly one member of every matching `$share` group.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use rand::Rng;
use serde::Deserialize;

use super::{MatchedSubscription, SharedGroupKey};

/// How a member of a shared group is picked
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SharedStrategy {
    /// Rotate through members in client ID order
    #[default]
    RoundRobin,
    /// Uniformly random member
    Random,
}

/// The group had no members left at selection time
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SelectError {
    NoTargetAvailable { group: Arc<str> },
}

impl fmt::Display for SelectError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SelectError::NoTargetAvailable { group } => {
                write!(f, "no target available in share group {}", group)
            }
        }
    }
}

impl std::error::Error for SelectError {}

pub struct SharedSubscriptionSelector {
    strategy: SharedStrategy,
    /// Round-robin position per (group, filter)
    counters: DashMap<SharedGroupKey, AtomicUsize>,
}

impl SharedSubscriptionSelector {
    pub fn new(strategy: SharedStrategy) -> Self {
        Self {
            strategy,
            counters: DashMap::new(),
        }
    }

    pub fn strategy(&self) -> SharedStrategy {
        self.strategy
    }

    /// Pick exactly one of `candidates` for this publish
    pub fn select_target(
        &self,
        key: &SharedGroupKey,
        candidates: &[MatchedSubscription],
    ) -> Result<MatchedSubscription, SelectError> {
        if candidates.is_empty() {
            return Err(SelectError::NoTargetAvailable {
                group: key.group.clone(),
            });
        }

        let idx = match self.strategy {
            SharedStrategy::RoundRobin => {
                let counter = self
                    .counters
                    .entry(key.clone())
                    .or_insert_with(|| AtomicUsize::new(0));
                counter.fetch_add(1, Ordering::Relaxed) % candidates.len()
            }
            SharedStrategy::Random => rand::thread_rng().gen_range(0..candidates.len()),
        };
        Ok(candidates[idx].clone())
    }

    /// Drop the round-robin position of a group that no longer exists
    pub fn forget(&self, key: &SharedGroupKey) {
        self.counters.remove(key);
    }
}

impl Default for SharedSubscriptionSelector {
    fn default() -> Self {
        Self::new(SharedStrategy::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{QoS, SubscriptionOptions};
    use crate::topic::ClientSubscription;
    use std::collections::HashMap;

    fn key() -> SharedGroupKey {
        SharedGroupKey {
            group: Arc::from("g1"),
            filter: Arc::from("metrics"),
        }
    }

    fn candidates(names: &[&str]) -> Vec<MatchedSubscription> {
        names
            .iter()
            .map(|n| MatchedSubscription {
                subscription: ClientSubscription::new(*n, SubscriptionOptions::with_qos(QoS::AtLeastOnce)),
                filter: Arc::from("metrics"),
            })
            .collect()
    }

    fn distribution(selector: &SharedSubscriptionSelector, rounds: usize) -> HashMap<String, usize> {
        let members = candidates(&["a", "b", "c"]);
        let mut counts = HashMap::new();
        for _ in 0..rounds {
            let target = selector.select_target(&key(), &members).unwrap();
            *counts.entry(target.subscription.client_id.to_string()).or_default() += 1;
        }
        counts
    }

    #[test]
    fn test_round_robin_is_even() {
        let selector = SharedSubscriptionSelector::new(SharedStrategy::RoundRobin);
        let counts = distribution(&selector, 30);
        assert_eq!(counts.len(), 3);
        assert!(counts.values().all(|&c| c == 10));
    }

    #[test]
    fn test_random_reaches_every_member() {
        let selector = SharedSubscriptionSelector::new(SharedStrategy::Random);
        let counts = distribution(&selector, 600);
        assert_eq!(counts.len(), 3);
        assert_eq!(counts.values().sum::<usize>(), 600);
    }

    #[test]
    fn test_empty_group_has_no_target() {
        let selector = SharedSubscriptionSelector::default();
        let err = selector.select_target(&key(), &[]).unwrap_err();
        assert_eq!(
            err,
            SelectError::NoTargetAvailable {
                group: Arc::from("g1")
            }
        );
    }

    #[test]
    fn test_groups_rotate_independently() {
        let selector = SharedSubscriptionSelector::new(SharedStrategy::RoundRobin);
        let members = candidates(&["a", "b"]);
        let other = SharedGroupKey {
            group: Arc::from("g2"),
            filter: Arc::from("metrics"),
        };

        let first = selector.select_target(&key(), &members).unwrap();
        let other_first = selector.select_target(&other, &members).unwrap();
        assert_eq!(first.subscription.client_id, other_first.subscription.client_id);
    }
}
