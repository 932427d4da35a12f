use std::io::Write;

use strand_core::config::AppConfig;
use strand_core::error::StrandError;
use strand_graph::{FanOut, RepairLoop, RunLogger};

#[test]
fn test_load_full_config_from_file() {
    let toml_content = r#"
[graph]
event_capacity = 64
trace = true

[repair]
max_retries = 4
heuristic_repair = false

[fan_out]
max_parallelism = 8

[model]
provider = "anthropic"
model_id = "claude-sonnet-4-20250514"
api_key = "sk-test-key"
max_tokens = 4096
temperature = 0.5

[[fallback_models]]
provider = "replay"
model_id = "offline"
base_url = "replies.txt"

[retry]
max_retries = 5
initial_backoff_ms = 10
max_backoff_ms = 100

[log]
log_dir = "/tmp/strand-logs"
level = 3
"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).unwrap();
    let config = AppConfig::load(tmp.path()).expect("load config");

    assert_eq!(config.graph.event_capacity, 64);
    assert!(config.graph.trace);
    assert_eq!(config.repair.max_retries, 4);
    assert!(!config.repair.heuristic_repair);
    assert_eq!(config.fan_out.max_parallelism, 8);

    let model = config.model.as_ref().unwrap();
    assert_eq!(model.provider, "anthropic");
    assert_eq!(model.api_key.as_deref(), Some("sk-test-key"));
    assert_eq!(model.max_tokens, 4096);
    assert_eq!(config.fallback_models.len(), 1);
    assert_eq!(config.fallback_models[0].base_url.as_deref(), Some("replies.txt"));

    assert_eq!(config.retry.max_retries, 5);
    assert_eq!(config.retry.max_backoff_ms, 100);

    let log = config.log.as_ref().unwrap();
    assert!(log.enabled);
    assert_eq!(log.level, 3);
}

#[test]
fn test_env_var_expansion_in_config() {
    std::env::set_var("STRAND_TEST_CONFIG_KEY", "sk-from-env");
    let toml_content = r#"
[model]
model_id = "m"
api_key = "${STRAND_TEST_CONFIG_KEY}"
"#;
    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).unwrap();
    let config = AppConfig::load(tmp.path()).unwrap();
    let model = config.model.unwrap();
    assert_eq!(model.api_key.as_deref(), Some("sk-from-env"));
    assert_eq!(model.provider, "anthropic");
}

#[test]
fn test_minimal_config_uses_defaults() {
    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(b"").unwrap();
    let config = AppConfig::load(tmp.path()).unwrap();

    assert_eq!(config.graph.event_capacity, 1024);
    assert!(!config.graph.trace);
    assert_eq!(config.repair.max_retries, 2);
    assert!(config.repair.heuristic_repair);
    assert_eq!(config.fan_out.max_parallelism, 4);
    assert!(config.model.is_none());
    assert!(config.log_dir().is_none());
}

#[test]
fn test_missing_file_is_config_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let err = AppConfig::load(&dir.path().join("absent.toml")).unwrap_err();
    assert!(matches!(err, StrandError::ConfigNotFound(_)));
}

#[test]
fn test_sections_drive_components() {
    let dir = tempfile::tempdir().unwrap();
    let toml_content = format!(
        r#"
[repair]
max_retries = 1

[fan_out]
max_parallelism = 0

[log]
log_dir = "{}"
"#,
        dir.path().display()
    );
    let config = AppConfig::from_toml(&toml_content).unwrap();

    assert_eq!(RepairLoop::from_config(&config.repair).max_attempts(), 2);
    // Zero would never make progress.
    assert_eq!(FanOut::from_config(&config.fan_out).max_parallelism(), 1);

    let logger = RunLogger::from_config(&config).expect("logging enabled");
    assert_eq!(logger.log_dir(), dir.path());
}

#[test]
fn test_config_round_trips_through_toml() {
    let config = AppConfig::from_toml("[model]\nmodel_id = \"m\"\n[fan_out]\nmax_parallelism = 2\n").unwrap();
    let rendered = toml::to_string_pretty(&config).unwrap();
    let reparsed = AppConfig::from_toml(&rendered).unwrap();
    assert_eq!(reparsed.fan_out.max_parallelism, 2);
    assert_eq!(reparsed.model.unwrap().model_id, "m");
}
