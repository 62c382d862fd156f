//! Config module tests

use super::*;

#[test]
fn test_substitute_env_vars_simple() {
    std::env::set_var("TRELLIS_TEST_VAR_SIMPLE", "hello");
    let result = substitute_env_vars("value = \"${TRELLIS_TEST_VAR_SIMPLE}\"");
    assert_eq!(result, "value = \"hello\"");
    std::env::remove_var("TRELLIS_TEST_VAR_SIMPLE");
}

#[test]
fn test_substitute_env_vars_with_default() {
    std::env::remove_var("TRELLIS_TEST_VAR_UNSET");
    let result = substitute_env_vars("value = \"${TRELLIS_TEST_VAR_UNSET:-fallback}\"");
    assert_eq!(result, "value = \"fallback\"");

    std::env::set_var("TRELLIS_TEST_VAR_SET", "env_value");
    let result = substitute_env_vars("value = \"${TRELLIS_TEST_VAR_SET:-fallback}\"");
    assert_eq!(result, "value = \"env_value\"");
    std::env::remove_var("TRELLIS_TEST_VAR_SET");
}

#[test]
fn test_substitute_env_vars_missing_no_default() {
    std::env::remove_var("TRELLIS_TEST_VAR_MISSING");
    let result = substitute_env_vars("value = \"${TRELLIS_TEST_VAR_MISSING}\"");
    assert_eq!(result, "value = \"\"");
}

#[test]
fn test_default_config() {
    let config = Config::default();
    assert_eq!(config.log.level, "info");
    assert_eq!(config.session.max_inflight, 32);
    assert_eq!(config.session.max_queued_messages, 1000);
    assert_eq!(config.session.max_stored_messages, 10_000);
    assert_eq!(config.session.auth_cache_topics, 1024);
    assert_eq!(config.session.retry_interval, Duration::from_secs(30));
    assert_eq!(config.subscriptions.compaction_interval, Duration::from_secs(60));
    assert_eq!(config.subscriptions.shared_strategy, SharedStrategy::RoundRobin);
    assert_eq!(config.mqtt.max_qos, 2);
    assert!(config.persistence.enabled);
    assert_eq!(config.persistence.backend, BackendType::Fjall);
    assert!(config.validate().is_ok());
}

#[test]
fn test_parse_full_config() {
    let config = Config::parse(
        r#"
[log]
level = "debug"

[session]
max_inflight = 8
max_queued_messages = 50
max_stored_messages = 200
retry_interval = "5s"

[subscriptions]
compaction_interval = "2m"
shared_strategy = "random"
max_topic_levels = 16

[mqtt]
max_qos = 1
retain_available = false

[persistence]
enabled = true
backend = "memory"
flush_interval = "250ms"

[cluster]
service_id = "node-b"
"#,
    )
    .unwrap();

    assert_eq!(config.log.level, "debug");
    assert_eq!(config.session.max_inflight, 8);
    assert_eq!(config.session.max_queued_messages, 50);
    // Unset fields keep their defaults
    assert_eq!(config.session.max_awaiting_rel, 100);
    assert_eq!(config.session.max_stored_messages, 200);
    assert_eq!(config.session.retry_interval, Duration::from_secs(5));
    assert_eq!(config.subscriptions.compaction_interval, Duration::from_secs(120));
    assert_eq!(config.subscriptions.shared_strategy, SharedStrategy::Random);
    assert_eq!(config.subscriptions.max_topic_levels, 16);
    assert_eq!(config.mqtt.max_qos, 1);
    assert!(!config.mqtt.retain_available);
    assert_eq!(config.persistence.backend, BackendType::Memory);
    assert_eq!(config.persistence.flush_interval, Duration::from_millis(250));
    assert_eq!(config.cluster.service_id, "node-b");
    assert_eq!(config.cluster.retained_topic, "trellismq.retained");
}

#[test]
fn test_validation_errors() {
    assert!(matches!(
        Config::parse("[mqtt]\nmax_qos = 3"),
        Err(ConfigError::Validation(_))
    ));
    assert!(matches!(
        Config::parse("[session]\nmax_inflight = 0"),
        Err(ConfigError::Validation(_))
    ));
    assert!(matches!(
        Config::parse("[subscriptions]\ncompaction_interval = \"0s\""),
        Err(ConfigError::Validation(_))
    ));
    assert!(matches!(
        Config::parse("[cluster]\nservice_id = \"\""),
        Err(ConfigError::Validation(_))
    ));
}

#[test]
fn test_parse_error() {
    assert!(matches!(
        Config::parse("[session\nmax_inflight = 1"),
        Err(ConfigError::Parse(_))
    ));
    assert!(matches!(
        Config::parse("[subscriptions]\nshared_strategy = \"sticky\""),
        Err(ConfigError::Parse(_))
    ));
}

#[test]
fn test_disabled_persistence_uses_memory() {
    let config = Config::parse("[persistence]\nenabled = false").unwrap();
    assert_eq!(config.persistence.effective_backend(), BackendType::Memory);
}

#[test]
fn test_load_config_with_env_substitution() {
    let temp_dir = tempfile::tempdir().unwrap();
    let config_path = temp_dir.path().join("trellismq.toml");

    std::env::set_var("TRELLIS_TEST_SERVICE", "node-env");
    std::fs::write(
        &config_path,
        r#"
[session]
max_inflight = ${TRELLIS_TEST_INFLIGHT:-16}

[cluster]
service_id = "${TRELLIS_TEST_SERVICE}"
"#,
    )
    .unwrap();

    let config = Config::load(&config_path).unwrap();
    assert_eq!(config.session.max_inflight, 16);
    assert_eq!(config.cluster.service_id, "node-env");
    assert_eq!(config.session.retry_interval, Duration::from_secs(30));

    std::env::remove_var("TRELLIS_TEST_SERVICE");
}

#[test]
fn test_load_missing_file_uses_defaults() {
    let temp_dir = tempfile::tempdir().unwrap();
    let config = Config::load(temp_dir.path().join("absent.toml")).unwrap();
    assert_eq!(config.session.max_inflight, 32);
    assert_eq!(config.cluster.service_id, "trellismq-1");
}
