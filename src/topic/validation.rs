//! Topic name and filter parsing
//!
//! Based on MQTT specification sections on topic names and topic filters.
//!
//! Key rules:
//! - Topic names MUST NOT contain wildcards (+ or #)
//! - Topic filters MAY contain wildcards
//! - Multi-level wildcard (#) must occupy the last level
//! - Single-level wildcard (+) must occupy an entire level
//! - Filter levels may only be empty as the leading level ("/a/b")
//! - Topics starting with $ are system topics and have special matching rules

use std::fmt;
use std::sync::Arc;

use compact_str::CompactString;
use smallvec::SmallVec;

/// Prefix of a shared subscription filter
pub const SHARE_PREFIX: &str = "$share/";

/// Errors raised while parsing topic names and filters.
///
/// Both are raised before any state is touched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopicError {
    /// Malformed subscription filter
    InvalidFilter(&'static str),
    /// Malformed publish topic
    InvalidTopic(&'static str),
}

impl fmt::Display for TopicError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TopicError::InvalidFilter(msg) => write!(f, "invalid topic filter: {}", msg),
            TopicError::InvalidTopic(msg) => write!(f, "invalid topic name: {}", msg),
        }
    }
}

impl std::error::Error for TopicError {}

/// Represents a level in a topic filter
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TopicLevel {
    /// Literal topic level
    Normal(CompactString),
    /// Single-level wildcard (+)
    SingleWildcard,
    /// Multi-level wildcard (#)
    MultiWildcard,
}

impl TopicLevel {
    fn from_level(level: &str) -> Self {
        match level {
            "+" => TopicLevel::SingleWildcard,
            "#" => TopicLevel::MultiWildcard,
            s => TopicLevel::Normal(CompactString::new(s)),
        }
    }
}

/// A parsed subscription filter.
///
/// For shared subscriptions the `$share/{group}/` prefix is stripped from
/// `filter` and the group is kept separately.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicFilter {
    /// Share group name for `$share/{group}/{filter}`
    pub share_group: Option<Arc<str>>,
    /// The filter as stored in the trie (share prefix removed)
    pub filter: Arc<str>,
    /// Parsed levels of `filter`
    pub levels: SmallVec<[TopicLevel; 8]>,
}

impl TopicFilter {
    pub fn is_shared(&self) -> bool {
        self.share_group.is_some()
    }

    /// Whether the filter contains a wildcard level
    pub fn has_wildcards(&self) -> bool {
        self.levels
            .iter()
            .any(|l| !matches!(l, TopicLevel::Normal(_)))
    }
}

/// Split `$share/{group}/{filter}` into its parts
pub fn split_shared(filter: &str) -> Result<Option<(&str, &str)>, TopicError> {
    let Some(rest) = filter.strip_prefix(SHARE_PREFIX) else {
        return Ok(None);
    };
    let Some(slash_pos) = rest.find('/') else {
        return Err(TopicError::InvalidFilter("invalid shared subscription format"));
    };
    let group = &rest[..slash_pos];
    let actual = &rest[slash_pos + 1..];
    if group.is_empty() {
        return Err(TopicError::InvalidFilter(
            "shared subscription group name cannot be empty",
        ));
    }
    if group.contains('+') || group.contains('#') {
        return Err(TopicError::InvalidFilter(
            "shared subscription group name cannot contain wildcards",
        ));
    }
    if actual.is_empty() {
        return Err(TopicError::InvalidFilter(
            "shared subscription filter cannot be empty",
        ));
    }
    Ok(Some((group, actual)))
}

/// Parse a topic filter (used in SUBSCRIBE/UNSUBSCRIBE)
pub fn parse_filter(filter: &str) -> Result<TopicFilter, TopicError> {
    parse_filter_with_max_levels(filter, 0)
}

/// Parse a topic filter with configurable max levels (0 = unlimited)
pub fn parse_filter_with_max_levels(
    filter: &str,
    max_topic_levels: usize,
) -> Result<TopicFilter, TopicError> {
    if filter.is_empty() {
        return Err(TopicError::InvalidFilter("topic filter cannot be empty"));
    }

    if filter.len() > 65535 {
        return Err(TopicError::InvalidFilter("topic filter exceeds maximum length"));
    }

    if filter.contains('\0') {
        return Err(TopicError::InvalidFilter(
            "topic filter cannot contain null character",
        ));
    }

    let (share_group, actual_filter) = match split_shared(filter)? {
        Some((group, actual)) => (Some(Arc::<str>::from(group)), actual),
        None => (None, filter),
    };

    let raw: SmallVec<[&str; 8]> = actual_filter.split('/').collect();

    if max_topic_levels > 0 && raw.len() > max_topic_levels {
        return Err(TopicError::InvalidFilter(
            "topic filter exceeds maximum allowed levels",
        ));
    }

    let last = raw.len() - 1;
    let mut levels = SmallVec::with_capacity(raw.len());
    for (i, level) in raw.iter().enumerate() {
        if level.is_empty() && i != 0 {
            return Err(TopicError::InvalidFilter("topic filter level cannot be empty"));
        }
        if level.contains('#') {
            if *level != "#" {
                return Err(TopicError::InvalidFilter(
                    "multi-level wildcard must occupy entire level",
                ));
            }
            if i != last {
                return Err(TopicError::InvalidFilter(
                    "multi-level wildcard must be last level",
                ));
            }
        }
        if level.contains('+') && *level != "+" {
            return Err(TopicError::InvalidFilter(
                "single-level wildcard must occupy entire level",
            ));
        }
        levels.push(TopicLevel::from_level(level));
    }

    Ok(TopicFilter {
        share_group,
        filter: Arc::from(actual_filter),
        levels,
    })
}

/// Parse a topic name (used in PUBLISH) into its levels
pub fn parse_topic(topic: &str) -> Result<SmallVec<[&str; 8]>, TopicError> {
    parse_topic_with_max_levels(topic, 0)
}

/// Parse a topic name with configurable max levels (0 = unlimited)
///
/// Topic names:
/// - Must be at least 1 character
/// - Must not exceed 65535 bytes
/// - Must not contain null character
/// - Must not contain wildcards (+ or #)
pub fn parse_topic_with_max_levels(
    topic: &str,
    max_topic_levels: usize,
) -> Result<SmallVec<[&str; 8]>, TopicError> {
    if topic.is_empty() {
        return Err(TopicError::InvalidTopic("topic name cannot be empty"));
    }

    if topic.len() > 65535 {
        return Err(TopicError::InvalidTopic("topic name exceeds maximum length"));
    }

    if topic.contains('\0') {
        return Err(TopicError::InvalidTopic(
            "topic name cannot contain null character",
        ));
    }

    if topic.contains('+') || topic.contains('#') {
        return Err(TopicError::InvalidTopic("topic name cannot contain wildcards"));
    }

    let levels: SmallVec<[&str; 8]> = topic.split('/').collect();
    if max_topic_levels > 0 && levels.len() > max_topic_levels {
        return Err(TopicError::InvalidTopic(
            "topic exceeds maximum allowed levels",
        ));
    }

    Ok(levels)
}

/// Check a single filter level against a single topic level.
///
/// `#` matches here as well; the caller stops comparing after it because it
/// swallows every remaining level.
pub fn segment_matches(filter_level: &TopicLevel, topic_level: &str) -> bool {
    match filter_level {
        TopicLevel::Normal(s) => s.as_str() == topic_level,
        TopicLevel::SingleWildcard | TopicLevel::MultiWildcard => true,
    }
}

/// Check if a topic filter matches a topic name
///
/// Matching rules:
/// - / is the level separator
/// - + matches exactly one level
/// - # matches zero or more levels (must be last)
/// - $-topics don't match filters starting with + or #
pub fn topic_matches_filter(topic: &str, filter: &str) -> bool {
    if topic.starts_with('$') && (filter.starts_with('+') || filter.starts_with('#')) {
        return false;
    }

    let topic_levels: SmallVec<[&str; 8]> = topic.split('/').collect();
    let filter_levels: SmallVec<[TopicLevel; 8]> =
        filter.split('/').map(TopicLevel::from_level).collect();

    let mut ti = 0;
    for filter_level in &filter_levels {
        if *filter_level == TopicLevel::MultiWildcard {
            return true;
        }
        match topic_levels.get(ti) {
            Some(level) if segment_matches(filter_level, level) => ti += 1,
            _ => return false,
        }
    }

    ti == topic_levels.len()
}
