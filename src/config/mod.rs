//! Configuration Module
//!
//! Provides TOML-based configuration for TrellisMQ with support for:
//! - Session limits (in-flight window, queue sizes, retry interval)
//! - Subscription trie maintenance and shared subscription strategy
//! - MQTT feature flags
//! - Persistence backend selection
//! - Cluster identity for retained message propagation
//! - Environment variable overrides (TRELLISMQ__* prefix)

use std::path::Path;
use std::time::Duration;

use config::{Environment, File, FileFormat};
use regex::Regex;
use serde::Deserialize;

pub use persistence::{BackendType, PersistenceConfig};

use crate::topic::SharedStrategy;

mod persistence;

/// Substitute environment variables in a string.
/// Supports `${VAR}` and `${VAR:-default}` syntax.
fn substitute_env_vars(content: &str) -> String {
    let Ok(re) = Regex::new(r"\$\{([^}:]+)(?::-([^}]*))?\}") else {
        return content.to_string();
    };
    re.replace_all(content, |caps: &regex::Captures| {
        let var_name = &caps[1];
        let default = caps.get(2).map(|m| m.as_str()).unwrap_or("");
        std::env::var(var_name).unwrap_or_else(|_| default.to_string())
    })
    .to_string()
}

#[cfg(test)]
mod tests;

/// Configuration error types
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
    /// Config crate error
    Config(config::ConfigError),
    /// Validation error
    Validation(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "IO error: {}", e),
            ConfigError::Parse(e) => write!(f, "Parse error: {}", e),
            ConfigError::Config(e) => write!(f, "Config error: {}", e),
            ConfigError::Validation(msg) => write!(f, "Validation error: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

impl From<config::ConfigError> for ConfigError {
    fn from(e: config::ConfigError) -> Self {
        ConfigError::Config(e)
    }
}

/// Root configuration structure
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Logging configuration
    pub log: LogConfig,
    /// Per-client session limits
    pub session: SessionConfig,
    /// Subscription trie settings
    pub subscriptions: SubscriptionsConfig,
    /// MQTT feature configuration
    pub mqtt: MqttConfig,
    /// Persistence configuration
    pub persistence: PersistenceConfig,
    /// Cluster identity
    pub cluster: ClusterConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level: error, warn, info, debug, trace
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Per-client session configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Maximum in-flight messages per client (QoS 1/2)
    #[serde(default = "default_max_inflight")]
    pub max_inflight: usize,
    /// Maximum messages queued behind a full window
    #[serde(default = "default_max_queued_messages")]
    pub max_queued_messages: usize,
    /// Maximum inbound QoS 2 messages awaiting PUBREL (0 = unbounded)
    #[serde(default = "default_max_awaiting_rel")]
    pub max_awaiting_rel: usize,
    /// Maximum stored QoS 1/2 messages per client (0 = unbounded)
    #[serde(default = "default_max_stored_messages")]
    pub max_stored_messages: usize,
    /// Resend interval for unacknowledged messages (e.g. "30s"; "0s" disables)
    #[serde(default = "default_retry_interval", with = "humantime_serde")]
    pub retry_interval: Duration,
    /// Session task command mailbox size
    #[serde(default = "default_command_channel_capacity")]
    pub command_channel_capacity: usize,
    /// Distinct topics whose publish authorization is cached per client
    #[serde(default = "default_auth_cache_topics")]
    pub auth_cache_topics: usize,
}

fn default_max_inflight() -> usize {
    32
}
fn default_max_queued_messages() -> usize {
    1000
}
fn default_max_awaiting_rel() -> usize {
    100
}
fn default_max_stored_messages() -> usize {
    10_000
}
fn default_retry_interval() -> Duration {
    Duration::from_secs(30)
}
fn default_command_channel_capacity() -> usize {
    1024
}
fn default_auth_cache_topics() -> usize {
    1024
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_inflight: default_max_inflight(),
            max_queued_messages: default_max_queued_messages(),
            max_awaiting_rel: default_max_awaiting_rel(),
            max_stored_messages: default_max_stored_messages(),
            retry_interval: default_retry_interval(),
            command_channel_capacity: default_command_channel_capacity(),
            auth_cache_topics: default_auth_cache_topics(),
        }
    }
}

/// Subscription trie configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SubscriptionsConfig {
    /// How often empty trie nodes are swept (e.g. "60s")
    #[serde(default = "default_compaction_interval", with = "humantime_serde")]
    pub compaction_interval: Duration,
    /// Shared subscription member selection: round_robin or random
    pub shared_strategy: SharedStrategy,
    /// Maximum topic levels in names and filters (0 = unlimited)
    pub max_topic_levels: usize,
}

fn default_compaction_interval() -> Duration {
    Duration::from_secs(60)
}

impl Default for SubscriptionsConfig {
    fn default() -> Self {
        Self {
            compaction_interval: default_compaction_interval(),
            shared_strategy: SharedStrategy::RoundRobin,
            max_topic_levels: 0,
        }
    }
}

/// MQTT feature configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    /// Maximum QoS level (0, 1, or 2)
    #[serde(default = "default_max_qos")]
    pub max_qos: u8,
    /// Whether retained messages are available
    #[serde(default = "default_true")]
    pub retain_available: bool,
    /// Whether wildcard subscriptions are available
    #[serde(default = "default_true")]
    pub wildcard_subscriptions: bool,
    /// Whether shared subscriptions are available
    #[serde(default = "default_true")]
    pub shared_subscriptions: bool,
}

fn default_max_qos() -> u8 {
    2
}
fn default_true() -> bool {
    true
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            max_qos: default_max_qos(),
            retain_available: true,
            wildcard_subscriptions: true,
            shared_subscriptions: true,
        }
    }
}

/// Cluster identity
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Identifies this node on the message bus
    #[serde(default = "default_service_id")]
    pub service_id: String,
    /// Bus topic carrying retained message updates
    #[serde(default = "default_retained_topic")]
    pub retained_topic: String,
}

fn default_service_id() -> String {
    "trellismq-1".to_string()
}
fn default_retained_topic() -> String {
    "trellismq.retained".to_string()
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            service_id: default_service_id(),
            retained_topic: default_retained_topic(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file with environment variable overrides.
    ///
    /// Supports two forms of environment variable usage:
    /// 1. In-file substitution: `${VAR}` or `${VAR:-default}` syntax in the TOML file
    /// 2. Override via env vars: `TRELLISMQ__` prefix with double underscores for nesting:
    ///    - `TRELLISMQ__SESSION__MAX_INFLIGHT=64` overrides `session.max_inflight`
    ///    - `TRELLISMQ__PERSISTENCE__BACKEND=memory` overrides `persistence.backend`
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder()
            .set_default("log.level", "info")?
            .set_default("session.max_inflight", 32)?
            .set_default("session.max_queued_messages", 1000)?
            .set_default("session.max_awaiting_rel", 100)?
            .set_default("session.retry_interval", "30s")?
            .set_default("session.command_channel_capacity", 1024)?
            .set_default("subscriptions.compaction_interval", "60s")?
            .set_default("subscriptions.shared_strategy", "round_robin")?
            .set_default("subscriptions.max_topic_levels", 0)?
            .set_default("mqtt.max_qos", 2)?
            .set_default("mqtt.retain_available", true)?
            .set_default("mqtt.wildcard_subscriptions", true)?
            .set_default("mqtt.shared_subscriptions", true)?
            .set_default("cluster.service_id", default_service_id())?
            .set_default("cluster.retained_topic", default_retained_topic())?;

        // Load from file with env var substitution
        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(content) => {
                let substituted = substitute_env_vars(&content);
                builder = builder.add_source(File::from_str(&substituted, FileFormat::Toml));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // File doesn't exist, use defaults
            }
            Err(e) => return Err(ConfigError::Io(e)),
        }

        // Double underscore separates nested keys, single underscore preserved in field names
        let cfg = builder
            .add_source(
                Environment::with_prefix("TRELLISMQ")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = cfg.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration with environment variable overrides only (no file).
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(Path::new(""))
    }

    /// Parse configuration from a string (for testing, no env var support)
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.mqtt.max_qos > 2 {
            return Err(ConfigError::Validation(
                "max_qos must be 0, 1, or 2".to_string(),
            ));
        }

        if self.session.max_inflight == 0 || self.session.max_inflight > u16::MAX as usize {
            return Err(ConfigError::Validation(
                "session.max_inflight must be between 1 and 65535".to_string(),
            ));
        }

        if self.subscriptions.compaction_interval.is_zero() {
            return Err(ConfigError::Validation(
                "subscriptions.compaction_interval must be greater than zero".to_string(),
            ));
        }

        if self.cluster.service_id.is_empty() {
            return Err(ConfigError::Validation(
                "cluster.service_id must not be empty".to_string(),
            ));
        }

        if self.persistence.enabled
            && self.persistence.backend == BackendType::Fjall
            && self.persistence.path.as_os_str().is_empty()
        {
            return Err(ConfigError::Validation(
                "persistence.path is required for the fjall backend".to_string(),
            ));
        }

        Ok(())
    }
}
