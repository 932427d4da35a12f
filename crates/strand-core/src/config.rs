use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, StrandError};

/// Top-level Strand configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub graph: GraphConfig,
    #[serde(default)]
    pub repair: RepairConfig,
    #[serde(default)]
    pub fan_out: FanOutConfig,
    #[serde(default)]
    pub model: Option<ModelConfig>,
    #[serde(default)]
    pub fallback_models: Vec<ModelConfig>,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub log: Option<LogConfig>,
}

/// Execution loop settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphConfig {
    /// Capacity of the run-scoped event bus.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
    /// Record a step trace for every run.
    #[serde(default)]
    pub trace: bool,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            event_capacity: default_event_capacity(),
            trace: false,
        }
    }
}

fn default_event_capacity() -> usize { 1024 }

/// Structured-output repair loop settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepairConfig {
    /// Re-prompts after the first try (2 retries = 3 total tries).
    #[serde(default = "default_repair_retries")]
    pub max_retries: u32,
    /// Strip code fences and balance braces before giving up on a response.
    #[serde(default = "default_heuristic_repair")]
    pub heuristic_repair: bool,
}

impl Default for RepairConfig {
    fn default() -> Self {
        Self {
            max_retries: default_repair_retries(),
            heuristic_repair: default_heuristic_repair(),
        }
    }
}

fn default_repair_retries() -> u32 { 2 }
fn default_heuristic_repair() -> bool { true }

/// Bounded fan-out inside nodes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FanOutConfig {
    #[serde(default = "default_max_parallelism")]
    pub max_parallelism: usize,
}

impl Default for FanOutConfig {
    fn default() -> Self {
        Self {
            max_parallelism: default_max_parallelism(),
        }
    }
}

fn default_max_parallelism() -> usize { 4 }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    pub model_id: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
}

impl ModelConfig {
    pub fn new(provider: impl Into<String>, model_id: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            model_id: model_id.into(),
            api_key: None,
            base_url: None,
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
        }
    }
}

fn default_provider() -> String { "anthropic".to_string() }
fn default_max_tokens() -> u32 { 8192 }
fn default_temperature() -> f32 { 0.0 }

/// Retry configuration for LLM requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
        }
    }
}

fn default_max_retries() -> u32 { 3 }
fn default_initial_backoff() -> u64 { 1000 }
fn default_max_backoff() -> u64 { 30000 }

/// JSONL run logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Enable run logging (default: true when section is present).
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// Directory for log files. Default: ./strand-logs
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    /// 1 = run summary only, 2 = per-node, 3 = everything including agent deltas.
    #[serde(default = "default_log_level")]
    pub level: u8,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            log_dir: default_log_dir(),
            level: default_log_level(),
        }
    }
}

fn default_log_enabled() -> bool { true }
fn default_log_dir() -> String { "strand-logs".to_string() }
fn default_log_level() -> u8 { 2 }

impl AppConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| StrandError::ConfigNotFound(path.display().to_string()))?;
        Self::from_toml(&content)
    }

    /// Parse config from TOML text, with env var expansion.
    pub fn from_toml(content: &str) -> Result<Self> {
        let expanded = expand_env_vars(content);
        toml::from_str(&expanded).map_err(|e| StrandError::Config(e.to_string()))
    }

    /// Resolve the log directory (expand ~), if logging is enabled.
    pub fn log_dir(&self) -> Option<PathBuf> {
        let log = self.log.as_ref().filter(|l| l.enabled)?;
        if let Some(rest) = log.log_dir.strip_prefix("~/") {
            if let Some(home) = std::env::var_os("HOME") {
                return Some(PathBuf::from(home).join(rest));
            }
        }
        Some(PathBuf::from(&log.log_dir))
    }
}

/// Expand `${ENV_VAR}` patterns in a string.
pub fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                // Keep original if env var not set
                Err(_) => result.push_str(&format!("${{{}}}", var_name)),
            }
        } else {
            result.push(c);
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_uses_defaults() {
        let config = AppConfig::from_toml("").unwrap();
        assert_eq!(config.repair.max_retries, 2);
        assert!(config.repair.heuristic_repair);
        assert_eq!(config.fan_out.max_parallelism, 4);
        assert_eq!(config.graph.event_capacity, 1024);
        assert!(!config.graph.trace);
        assert!(config.model.is_none());
        assert!(config.log_dir().is_none());
    }

    #[test]
    fn env_vars_are_expanded() {
        std::env::set_var("STRAND_TEST_MODEL_KEY", "sk-expanded");
        let config = AppConfig::from_toml(
            r#"
[model]
provider = "openai"
model_id = "gpt-4o-mini"
api_key = "${STRAND_TEST_MODEL_KEY}"
"#,
        )
        .unwrap();
        let model = config.model.unwrap();
        assert_eq!(model.api_key.as_deref(), Some("sk-expanded"));
        assert_eq!(model.max_tokens, 8192);
    }

    #[test]
    fn unset_env_var_is_kept() {
        assert_eq!(
            expand_env_vars("key = \"${STRAND_SURELY_UNSET_VAR}\""),
            "key = \"${STRAND_SURELY_UNSET_VAR}\""
        );
    }

    #[test]
    fn disabled_log_has_no_dir() {
        let config = AppConfig::from_toml("[log]\nenabled = false\n").unwrap();
        assert!(config.log_dir().is_none());
    }

    #[test]
    fn invalid_toml_is_config_error() {
        let err = AppConfig::from_toml("[repair]\nmax_retries = \"many\"").unwrap_err();
        assert!(matches!(err, StrandError::Config(_)));
    }
}
