//! Topic matching and subscription management
//!
//! Implements topic name/filter parsing, a concurrent subscription trie and
//! the selector that picks one member of a shared-subscription group.
//!
//! Performance notes:
//! - The trie locks per node, so lookups for unrelated subtrees never contend
//! - Uses compact_str for memory-efficient topic level storage
//! - Uses SmallVec for typical topic depths

mod shared;
mod trie;
pub mod validation;

pub use shared::{SelectError, SharedStrategy, SharedSubscriptionSelector};
pub use trie::{CompactionError, CompactionStats, SubscriptionTrie};
pub use validation::{
    parse_filter, parse_filter_with_max_levels, parse_topic, parse_topic_with_max_levels,
    segment_matches, topic_matches_filter, TopicError, TopicFilter, TopicLevel,
};

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::protocol::{QoS, SubscriptionOptions};

/// A subscriber record stored at a trie node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientSubscription {
    /// Client ID
    pub client_id: Arc<str>,
    /// Granted subscription QoS
    pub qos: QoS,
    /// Share group name for `$share/{group}/{filter}` subscriptions
    pub share_group: Option<Arc<str>>,
    /// Remaining subscription options (no_local, retain_as_published, ...)
    pub options: SubscriptionOptions,
}

impl ClientSubscription {
    pub fn new(client_id: impl Into<Arc<str>>, options: SubscriptionOptions) -> Self {
        Self {
            client_id: client_id.into(),
            qos: options.qos,
            share_group: None,
            options,
        }
    }
}

/// Identifies a shared subscription: the group name plus the filter it shares
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SharedGroupKey {
    pub group: Arc<str>,
    pub filter: Arc<str>,
}

/// A subscriber record together with the filter that matched
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchedSubscription {
    pub subscription: ClientSubscription,
    pub filter: Arc<str>,
}

/// Result of a trie lookup.
///
/// Shared matches are kept apart so the caller can pick one member per
/// group before fanning out.
#[derive(Debug, Default)]
pub struct TrieMatches {
    /// Non-shared subscriptions
    pub direct: Vec<MatchedSubscription>,
    /// Shared subscriptions grouped by (group, filter), members sorted by client ID
    pub shared: BTreeMap<SharedGroupKey, Vec<MatchedSubscription>>,
}

impl TrieMatches {
    pub fn is_empty(&self) -> bool {
        self.direct.is_empty() && self.shared.is_empty()
    }

    /// Total number of matched records, shared members included
    pub fn len(&self) -> usize {
        self.direct.len() + self.shared.values().map(Vec::len).sum::<usize>()
    }
}
