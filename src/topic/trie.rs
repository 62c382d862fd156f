//! Concurrent subscription trie
//!
//! A trie (prefix tree) over topic levels supporting `+` and `#` wildcards and
//! shared-subscription groups. Every node carries its own lock, so a lookup of
//! topic A never waits on a subscribe under an unrelated topic B.
//!
//! Locking rules:
//! - `put`, `get` and `delete` hold at most one node lock at a time
//! - a node is fully built before it is linked into its parent
//! - `delete` never unlinks nodes; empty nodes are swept by
//!   `clear_empty_nodes`, which only ever *tries* to lock children
//! - a swept node is flagged `removed` under its write lock; `put` re-checks
//!   the flag under the same lock and restarts from the root when it is set

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use ahash::AHashMap;
use compact_str::CompactString;
use parking_lot::RwLock;
use smallvec::SmallVec;
use tracing::{debug, trace};

use super::validation::{TopicFilter, TopicLevel};
use super::{ClientSubscription, MatchedSubscription, SharedGroupKey, TrieMatches};

/// The empty-node sweep could not examine every node.
///
/// Never fatal: the nodes it could reach were compacted and the sweep is
/// simply retried on the next schedule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompactionError {
    /// Some nodes were locked by concurrent operations and were skipped
    Inconsistent { removed: usize, contended: usize },
}

impl fmt::Display for CompactionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompactionError::Inconsistent { removed, contended } => write!(
                f,
                "empty node sweep incomplete: {} nodes removed, {} nodes contended",
                removed, contended
            ),
        }
    }
}

impl std::error::Error for CompactionError {}

/// Outcome of a completed sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompactionStats {
    /// Nodes visited
    pub visited: usize,
    /// Nodes unlinked
    pub removed: usize,
    /// Nodes skipped because their lock was held
    pub contended: usize,
}

/// Node in the subscription trie
struct TrieNode {
    /// Filter leading to this node, e.g. `sport/+/result`
    filter: Arc<str>,
    /// Set once the node has been unlinked by the sweep
    removed: AtomicBool,
    inner: RwLock<NodeInner>,
}

#[derive(Default)]
struct NodeInner {
    /// Children indexed by literal topic level
    children: AHashMap<CompactString, Arc<TrieNode>>,
    /// Single-level wildcard (+) child
    single_wildcard: Option<Arc<TrieNode>>,
    /// Multi-level wildcard (#) child, always a leaf
    multi_wildcard: Option<Arc<TrieNode>>,
    /// Non-shared subscribers keyed by client ID
    subscribers: AHashMap<Arc<str>, ClientSubscription>,
    /// Shared subscribers: group -> client ID -> record
    shared: AHashMap<Arc<str>, AHashMap<Arc<str>, ClientSubscription>>,
}

impl NodeInner {
    fn child(&self, level: &TopicLevel) -> Option<&Arc<TrieNode>> {
        match level {
            TopicLevel::Normal(s) => self.children.get(s.as_str()),
            TopicLevel::SingleWildcard => self.single_wildcard.as_ref(),
            TopicLevel::MultiWildcard => self.multi_wildcard.as_ref(),
        }
    }

    fn child_or_insert_with<F>(&mut self, level: &TopicLevel, create: F) -> &Arc<TrieNode>
    where
        F: FnOnce() -> Arc<TrieNode>,
    {
        match level {
            TopicLevel::Normal(s) => self.children.entry(s.clone()).or_insert_with(create),
            TopicLevel::SingleWildcard => self.single_wildcard.get_or_insert_with(create),
            TopicLevel::MultiWildcard => self.multi_wildcard.get_or_insert_with(create),
        }
    }

    fn has_subscribers(&self) -> bool {
        !self.subscribers.is_empty() || self.shared.values().any(|members| !members.is_empty())
    }

    fn has_children(&self) -> bool {
        !self.children.is_empty() || self.single_wildcard.is_some() || self.multi_wildcard.is_some()
    }

    fn is_empty(&self) -> bool {
        !self.has_subscribers() && !self.has_children()
    }

    fn child_nodes(&self) -> SmallVec<[Arc<TrieNode>; 8]> {
        self.children
            .values()
            .chain(self.single_wildcard.iter())
            .chain(self.multi_wildcard.iter())
            .cloned()
            .collect()
    }
}

impl TrieNode {
    fn root() -> Self {
        Self {
            filter: Arc::from(""),
            removed: AtomicBool::new(false),
            inner: RwLock::new(NodeInner::default()),
        }
    }

    fn child_of(parent: &TrieNode, level: &TopicLevel, parent_is_root: bool) -> Self {
        let level = match level {
            TopicLevel::Normal(s) => s.as_str(),
            TopicLevel::SingleWildcard => "+",
            TopicLevel::MultiWildcard => "#",
        };
        let filter = if parent_is_root {
            Arc::from(level)
        } else {
            Arc::from(format!("{}/{}", parent.filter, level))
        };
        Self {
            filter,
            removed: AtomicBool::new(false),
            inner: RwLock::new(NodeInner::default()),
        }
    }

    fn is_removed(&self) -> bool {
        self.removed.load(Ordering::Acquire)
    }
}

/// Thread-safe subscription trie
pub struct SubscriptionTrie {
    root: Arc<TrieNode>,
}

impl SubscriptionTrie {
    pub fn new() -> Self {
        Self {
            root: Arc::new(TrieNode::root()),
        }
    }

    /// Insert or replace a subscriber record at the filter's node.
    ///
    /// A second subscribe from the same client at the same node (and, for
    /// shared filters, the same group) replaces the first. Returns true when
    /// a record was replaced.
    pub fn put(&self, filter: &TopicFilter, mut subscription: ClientSubscription) -> bool {
        subscription.share_group = filter.share_group.clone();

        'retry: loop {
            let mut node = self.root.clone();
            for (i, level) in filter.levels.iter().enumerate() {
                match Self::child_or_insert(&node, level, i == 0) {
                    Some(child) => node = child,
                    None => {
                        trace!("Trie node for {} swept during put, retrying", filter.filter);
                        continue 'retry;
                    }
                }
            }

            let mut inner = node.inner.write();
            if node.is_removed() {
                continue 'retry;
            }
            let client_id = subscription.client_id.clone();
            let replaced = match filter.share_group {
                Some(ref group) => inner
                    .shared
                    .entry(group.clone())
                    .or_default()
                    .insert(client_id, subscription)
                    .is_some(),
                None => inner.subscribers.insert(client_id, subscription).is_some(),
            };
            return replaced;
        }
    }

    /// Find or link the child for `level`. Returns None if `node` was swept.
    fn child_or_insert(
        node: &Arc<TrieNode>,
        level: &TopicLevel,
        parent_is_root: bool,
    ) -> Option<Arc<TrieNode>> {
        {
            let inner = node.inner.read();
            if node.is_removed() {
                return None;
            }
            if let Some(child) = inner.child(level) {
                return Some(child.clone());
            }
        }

        let mut inner = node.inner.write();
        if node.is_removed() {
            return None;
        }
        let child = inner.child_or_insert_with(level, || {
            Arc::new(TrieNode::child_of(node, level, parent_is_root))
        });
        Some(child.clone())
    }

    /// Find all subscriptions matching a (validated) topic name
    pub fn get(&self, topic: &str) -> TrieMatches {
        // $-topics don't match filters starting with + or #
        let is_system_topic = topic.starts_with('$');
        let levels: SmallVec<[&str; 8]> = topic.split('/').collect();

        let mut matches = TrieMatches::default();
        Self::matches_recursive(&self.root, &levels, 0, is_system_topic, &mut matches);
        for members in matches.shared.values_mut() {
            members.sort_by(|a, b| a.subscription.client_id.cmp(&b.subscription.client_id));
        }
        matches
    }

    fn matches_recursive(
        node: &Arc<TrieNode>,
        levels: &[&str],
        index: usize,
        is_system_topic: bool,
        matches: &mut TrieMatches,
    ) {
        let skip_wildcards = is_system_topic && index == 0;

        let (multi, single, exact) = {
            let inner = node.inner.read();
            if index >= levels.len() {
                Self::collect(node, &inner, matches);
            }
            let multi = if skip_wildcards {
                None
            } else {
                inner.multi_wildcard.clone()
            };
            let (single, exact) = match levels.get(index) {
                Some(level) => (
                    if skip_wildcards {
                        None
                    } else {
                        inner.single_wildcard.clone()
                    },
                    inner.children.get(*level).cloned(),
                ),
                None => (None, None),
            };
            (multi, single, exact)
        };

        // `#` matches the remaining levels, including none at all
        if let Some(multi) = multi {
            let inner = multi.inner.read();
            Self::collect(&multi, &inner, matches);
        }

        if let Some(single) = single {
            Self::matches_recursive(&single, levels, index + 1, is_system_topic, matches);
        }

        if let Some(exact) = exact {
            Self::matches_recursive(&exact, levels, index + 1, is_system_topic, matches);
        }
    }

    fn collect(node: &TrieNode, inner: &NodeInner, matches: &mut TrieMatches) {
        for sub in inner.subscribers.values() {
            matches.direct.push(MatchedSubscription {
                subscription: sub.clone(),
                filter: node.filter.clone(),
            });
        }
        for (group, members) in &inner.shared {
            if members.is_empty() {
                continue;
            }
            let key = SharedGroupKey {
                group: group.clone(),
                filter: node.filter.clone(),
            };
            let entry = matches.shared.entry(key).or_default();
            for sub in members.values() {
                entry.push(MatchedSubscription {
                    subscription: sub.clone(),
                    filter: node.filter.clone(),
                });
            }
        }
    }

    /// Remove the subscriber records at the filter's node that satisfy
    /// `predicate`. Returns whether anything was removed.
    ///
    /// Emptied nodes stay linked until the next sweep.
    pub fn delete<F>(&self, filter: &TopicFilter, mut predicate: F) -> bool
    where
        F: FnMut(&ClientSubscription) -> bool,
    {
        let mut node = self.root.clone();
        for level in &filter.levels {
            let next = {
                let inner = node.inner.read();
                match inner.child(level) {
                    Some(child) => child.clone(),
                    None => return false,
                }
            };
            node = next;
        }

        let mut inner = node.inner.write();
        match filter.share_group {
            Some(ref group) => {
                let Some(members) = inner.shared.get_mut(group) else {
                    return false;
                };
                let before = members.len();
                members.retain(|_, sub| !predicate(sub));
                let removed = members.len() != before;
                if members.is_empty() {
                    inner.shared.remove(group);
                }
                removed
            }
            None => {
                let before = inner.subscribers.len();
                inner.subscribers.retain(|_, sub| !predicate(sub));
                inner.subscribers.len() != before
            }
        }
    }

    /// Number of members currently in the shared group of `filter`
    pub fn shared_group_len(&self, filter: &TopicFilter) -> usize {
        let Some(ref group) = filter.share_group else {
            return 0;
        };
        let mut node = self.root.clone();
        for level in &filter.levels {
            let next = match node.inner.read().child(level) {
                Some(child) => child.clone(),
                None => return 0,
            };
            node = next;
        }
        let inner = node.inner.read();
        inner.shared.get(group).map_or(0, |members| members.len())
    }

    /// Sweep the whole trie and unlink nodes with no subscribers and no
    /// children, bottom-up.
    ///
    /// Best-effort: nodes locked by concurrent operations are skipped and
    /// reported through `CompactionError::Inconsistent`.
    pub fn clear_empty_nodes(&self) -> Result<CompactionStats, CompactionError> {
        let mut stats = CompactionStats::default();
        Self::sweep(&self.root, &mut stats);
        debug!(
            "Trie sweep visited {} nodes, removed {}, contended {}",
            stats.visited, stats.removed, stats.contended
        );
        if stats.contended > 0 {
            Err(CompactionError::Inconsistent {
                removed: stats.removed,
                contended: stats.contended,
            })
        } else {
            Ok(stats)
        }
    }

    fn sweep(node: &Arc<TrieNode>, stats: &mut CompactionStats) {
        let children = node.inner.read().child_nodes();
        for child in &children {
            Self::sweep(child, stats);
        }
        stats.visited += 1;

        let Some(mut inner) = node.inner.try_write() else {
            stats.contended += 1;
            return;
        };
        if node.is_removed() {
            return;
        }

        inner
            .children
            .retain(|_, child| !Self::try_unlink(child, stats));
        if let Some(ref child) = inner.single_wildcard {
            if Self::try_unlink(child, stats) {
                inner.single_wildcard = None;
            }
        }
        if let Some(ref child) = inner.multi_wildcard {
            if Self::try_unlink(child, stats) {
                inner.multi_wildcard = None;
            }
        }
    }

    /// Flag an empty child as removed. The caller holds the parent's write lock.
    fn try_unlink(child: &Arc<TrieNode>, stats: &mut CompactionStats) -> bool {
        match child.inner.try_write() {
            Some(inner) => {
                if inner.is_empty() {
                    child.removed.store(true, Ordering::Release);
                    stats.removed += 1;
                    true
                } else {
                    false
                }
            }
            None => {
                stats.contended += 1;
                false
            }
        }
    }

    /// Number of nodes below the root
    pub fn node_count(&self) -> usize {
        fn count(node: &Arc<TrieNode>) -> usize {
            let children = node.inner.read().child_nodes();
            children.len() + children.iter().map(count).sum::<usize>()
        }
        count(&self.root)
    }

    /// Number of stored subscriber records: (direct, shared)
    pub fn subscription_count(&self) -> (usize, usize) {
        fn count(node: &Arc<TrieNode>, totals: &mut (usize, usize)) {
            let children = {
                let inner = node.inner.read();
                totals.0 += inner.subscribers.len();
                totals.1 += inner.shared.values().map(|m| m.len()).sum::<usize>();
                inner.child_nodes()
            };
            for child in &children {
                count(child, totals);
            }
        }
        let mut totals = (0, 0);
        count(&self.root, &mut totals);
        totals
    }

    /// Snapshot of every filter that currently holds at least one record,
    /// with its record count
    pub fn filters(&self) -> BTreeMap<Arc<str>, usize> {
        fn walk(node: &Arc<TrieNode>, out: &mut BTreeMap<Arc<str>, usize>) {
            let children = {
                let inner = node.inner.read();
                if inner.has_subscribers() {
                    let n = inner.subscribers.len()
                        + inner.shared.values().map(|m| m.len()).sum::<usize>();
                    out.insert(node.filter.clone(), n);
                }
                inner.child_nodes()
            };
            for child in &children {
                walk(child, out);
            }
        }
        let mut out = BTreeMap::new();
        walk(&self.root, &mut out);
        out
    }
}

impl Default for SubscriptionTrie {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{QoS, SubscriptionOptions};
    use crate::topic::validation::{parse_filter, topic_matches_filter};
    use proptest::prelude::*;

    fn sub(client: &str, qos: QoS) -> ClientSubscription {
        ClientSubscription::new(client, SubscriptionOptions::with_qos(qos))
    }

    fn put(trie: &SubscriptionTrie, filter: &str, client: &str) {
        trie.put(&parse_filter(filter).unwrap(), sub(client, QoS::AtLeastOnce));
    }

    fn direct_clients(trie: &SubscriptionTrie, topic: &str) -> Vec<String> {
        let mut clients: Vec<String> = trie
            .get(topic)
            .direct
            .iter()
            .map(|m| m.subscription.client_id.to_string())
            .collect();
        clients.sort();
        clients
    }

    #[test]
    fn test_exact_match() {
        let trie = SubscriptionTrie::new();
        put(&trie, "test/topic", "a");

        assert_eq!(direct_clients(&trie, "test/topic"), vec!["a"]);
        assert!(direct_clients(&trie, "test/other").is_empty());
    }

    #[test]
    fn test_single_wildcard() {
        let trie = SubscriptionTrie::new();
        put(&trie, "test/+", "a");
        put(&trie, "+/topic", "b");
        put(&trie, "+/+", "c");

        assert_eq!(direct_clients(&trie, "test/topic"), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_single_wildcard_stops_at_one_level() {
        let trie = SubscriptionTrie::new();
        put(&trie, "sport/+/result", "A");

        assert_eq!(direct_clients(&trie, "sport/tennis/result"), vec!["A"]);
        assert!(direct_clients(&trie, "sport/tennis/scores/result").is_empty());
    }

    #[test]
    fn test_multi_wildcard() {
        let trie = SubscriptionTrie::new();
        put(&trie, "#", "a");
        put(&trie, "test/#", "b");

        assert_eq!(direct_clients(&trie, "test/topic/deep"), vec!["a", "b"]);
        // `#` also matches the parent level itself
        assert_eq!(direct_clients(&trie, "test"), vec!["a", "b"]);
        assert_eq!(direct_clients(&trie, "other"), vec!["a"]);
    }

    #[test]
    fn test_matched_filter_reported() {
        let trie = SubscriptionTrie::new();
        put(&trie, "sport/+/result", "a");
        put(&trie, "/lead/#", "b");

        let matches = trie.get("sport/tennis/result");
        assert_eq!(&*matches.direct[0].filter, "sport/+/result");

        let matches = trie.get("/lead/x");
        assert_eq!(&*matches.direct[0].filter, "/lead/#");
    }

    #[test]
    fn test_system_topics() {
        let trie = SubscriptionTrie::new();
        put(&trie, "#", "a");
        put(&trie, "+/test", "b");
        put(&trie, "$SYS/#", "c");

        assert_eq!(direct_clients(&trie, "$SYS/test"), vec!["c"]);
    }

    #[test]
    fn test_put_is_idempotent() {
        let trie = SubscriptionTrie::new();
        let filter = parse_filter("a/b").unwrap();
        assert!(!trie.put(&filter, sub("a", QoS::AtMostOnce)));
        assert!(trie.put(&filter, sub("a", QoS::ExactlyOnce)));

        let matches = trie.get("a/b");
        assert_eq!(matches.direct.len(), 1);
        assert_eq!(matches.direct[0].subscription.qos, QoS::ExactlyOnce);
        assert_eq!(trie.subscription_count(), (1, 0));
    }

    #[test]
    fn test_shared_groups_kept_apart() {
        let trie = SubscriptionTrie::new();
        put(&trie, "$share/g1/metrics", "b");
        put(&trie, "$share/g1/metrics", "a");
        put(&trie, "$share/g2/metrics", "c");
        put(&trie, "metrics", "d");

        let matches = trie.get("metrics");
        assert_eq!(matches.direct.len(), 1);
        assert_eq!(matches.shared.len(), 2);

        let g1 = SharedGroupKey {
            group: Arc::from("g1"),
            filter: Arc::from("metrics"),
        };
        let members: Vec<&str> = matches.shared[&g1]
            .iter()
            .map(|m| &*m.subscription.client_id)
            .collect();
        assert_eq!(members, vec!["a", "b"]);
        assert_eq!(
            matches.shared[&g1][0].subscription.share_group.as_deref(),
            Some("g1")
        );
    }

    #[test]
    fn test_delete_then_get() {
        let trie = SubscriptionTrie::new();
        put(&trie, "a/+", "x");
        put(&trie, "a/+", "y");

        let filter = parse_filter("a/+").unwrap();
        assert!(trie.delete(&filter, |s| &*s.client_id == "x"));
        assert!(!trie.delete(&filter, |s| &*s.client_id == "x"));
        assert_eq!(direct_clients(&trie, "a/b"), vec!["y"]);

        assert!(!trie.delete(&parse_filter("not/there").unwrap(), |_| true));
    }

    #[test]
    fn test_delete_shared_only_touches_group() {
        let trie = SubscriptionTrie::new();
        put(&trie, "$share/g/t", "x");
        put(&trie, "t", "x");

        assert!(trie.delete(&parse_filter("$share/g/t").unwrap(), |s| &*s.client_id == "x"));
        let matches = trie.get("t");
        assert_eq!(matches.direct.len(), 1);
        assert!(matches.shared.is_empty());
    }

    #[test]
    fn test_clear_empty_nodes() {
        let trie = SubscriptionTrie::new();
        put(&trie, "a/b/c", "x");
        put(&trie, "a/+/#", "y");
        put(&trie, "a/d", "z");
        assert_eq!(trie.node_count(), 6);

        trie.delete(&parse_filter("a/b/c").unwrap(), |_| true);
        trie.delete(&parse_filter("a/+/#").unwrap(), |_| true);
        // Deleting never unlinks
        assert_eq!(trie.node_count(), 6);

        let stats = trie.clear_empty_nodes().unwrap();
        assert_eq!(stats.removed, 4);
        assert_eq!(trie.node_count(), 2);
        assert_eq!(direct_clients(&trie, "a/d"), vec!["z"]);

        // Swept paths can be subscribed again
        put(&trie, "a/b/c", "x");
        assert_eq!(direct_clients(&trie, "a/b/c"), vec!["x"]);
    }

    #[test]
    fn test_clear_empty_nodes_reports_contention() {
        let trie = SubscriptionTrie::new();
        put(&trie, "a/b", "x");
        trie.delete(&parse_filter("a/b").unwrap(), |_| true);

        let a = trie.root.inner.read().children.get("a").cloned().unwrap();
        let b = a.inner.read().children.get("b").cloned().unwrap();
        let guard = b.inner.read();

        let err = trie.clear_empty_nodes().unwrap_err();
        assert!(matches!(err, CompactionError::Inconsistent { contended, .. } if contended > 0));
        drop(guard);

        assert_eq!(trie.clear_empty_nodes().unwrap().removed, 2);
        assert_eq!(trie.node_count(), 0);
    }

    #[test]
    fn test_put_after_concurrent_sweep_restarts() {
        let trie = SubscriptionTrie::new();
        put(&trie, "a/b", "x");
        trie.delete(&parse_filter("a/b").unwrap(), |_| true);

        // Hold a reference to the soon-to-be-swept node, as a put in progress would
        let a = trie.root.inner.read().children.get("a").cloned().unwrap();
        trie.clear_empty_nodes().unwrap();
        assert!(a.is_removed());
        assert!(SubscriptionTrie::child_or_insert(&a, &TopicLevel::Normal("b".into()), false).is_none());

        put(&trie, "a/b", "x");
        assert_eq!(direct_clients(&trie, "a/b"), vec!["x"]);
    }

    #[test]
    fn test_concurrent_put_get_delete_and_sweep() {
        let trie = Arc::new(SubscriptionTrie::new());
        let mut handles = Vec::new();

        for t in 0..4 {
            let trie = trie.clone();
            handles.push(std::thread::spawn(move || {
                let client = format!("client-{}", t);
                for i in 0..500 {
                    let filter = parse_filter(&format!("load/{}/+", i % 10)).unwrap();
                    trie.put(&filter, sub(&client, QoS::AtLeastOnce));
                    let _ = trie.get(&format!("load/{}/x", i % 10));
                    if i % 3 == 0 {
                        trie.delete(&filter, |s| *s.client_id == *client);
                    }
                }
            }));
        }
        {
            let trie = trie.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..200 {
                    let _ = trie.clear_empty_nodes();
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        // Re-subscribing every filter must be visible no matter what the sweep did
        for i in 0..10 {
            put(&trie, &format!("load/{}/+", i), "final");
            assert!(direct_clients(&trie, &format!("load/{}/x", i)).contains(&"final".to_string()));
        }
    }

    fn level() -> impl Strategy<Value = String> {
        prop_oneof![Just("a".to_string()), Just("b".to_string()), Just("c".to_string())]
    }

    fn filter_strategy() -> impl Strategy<Value = String> {
        (
            prop::collection::vec(
                prop_oneof![3 => level(), 1 => Just("+".to_string())],
                1..4,
            ),
            any::<bool>(),
        )
            .prop_map(|(mut levels, hash)| {
                if hash {
                    levels.push("#".to_string());
                }
                levels.join("/")
            })
    }

    fn topic_strategy() -> impl Strategy<Value = String> {
        prop::collection::vec(level(), 1..5).prop_map(|levels| levels.join("/"))
    }

    proptest! {
        #[test]
        fn prop_trie_agrees_with_matcher(
            filters in prop::collection::vec(filter_strategy(), 1..8),
            topic in topic_strategy(),
        ) {
            let trie = SubscriptionTrie::new();
            for (i, filter) in filters.iter().enumerate() {
                trie.put(&parse_filter(filter).unwrap(), sub(&format!("c{}", i), QoS::AtMostOnce));
            }

            let mut got: Vec<String> = trie
                .get(&topic)
                .direct
                .iter()
                .map(|m| m.subscription.client_id.to_string())
                .collect();
            got.sort();

            let mut expected: Vec<String> = filters
                .iter()
                .enumerate()
                .filter(|(_, f)| topic_matches_filter(&topic, f))
                .map(|(i, _)| format!("c{}", i))
                .collect();
            expected.sort();

            prop_assert_eq!(got, expected);
        }
    }
}
