//! Application configuration
//!
//! Loaded once at start-up: an optional TOML file named by `RECRUIT_CONFIG`,
//! then environment overrides, then validation. Immutable afterwards.

use crate::{OrchestratorError, Result};
use recruit_llm::LlmConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Environment variable naming the TOML config file
pub const CONFIG_PATH_VAR: &str = "RECRUIT_CONFIG";

/// Settings for the standalone recruitment task server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// LLM endpoint, call gate and retry policy
    pub llm: LlmConfig,

    /// Worker pool size
    pub workers: usize,

    /// Whole-task wall-clock budget in seconds; 0 disables it
    pub task_timeout_secs: u64,

    pub host: String,
    pub port: u16,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            llm: LlmConfig::default(),
            workers: 8,
            task_timeout_secs: 1800,
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

impl AppConfig {
    /// Load from `RECRUIT_CONFIG` (if set) and the process environment.
    pub fn load() -> Result<Self> {
        let mut config = match std::env::var(CONFIG_PATH_VAR) {
            Ok(path) if !path.trim().is_empty() => Self::from_file(path.trim())?,
            _ => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            OrchestratorError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_toml(&content)
    }

    /// Parse TOML text; missing keys keep their defaults
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| OrchestratorError::Config(e.to_string()))
    }

    /// Apply environment-style overrides read through `lookup`
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        if let Some(value) = get("LLM_BASE_URL") {
            self.llm.base_url = value;
        }
        if let Some(value) = get("LLM_API_KEY") {
            self.llm.api_key = value;
        }
        if let Some(value) = get("LLM_MODEL") {
            self.llm.model = value;
        }
        if let Some(value) = get("LLM_TEMPERATURE") {
            self.llm.temperature = parse("LLM_TEMPERATURE", &value)?;
        }
        if let Some(value) = get("LLM_TIMEOUT") {
            self.llm.timeout_secs = parse("LLM_TIMEOUT", &value)?;
        }
        if let Some(value) = get("LLM_MAX_CONCURRENCY") {
            self.llm.max_concurrency = parse("LLM_MAX_CONCURRENCY", &value)?;
        }
        if let Some(value) = get("LLM_RATE_LIMIT") {
            self.llm.requests_per_minute = parse("LLM_RATE_LIMIT", &value)?;
        }
        if let Some(value) = get("LLM_ACQUIRE_TIMEOUT") {
            self.llm.acquire_timeout_secs = parse("LLM_ACQUIRE_TIMEOUT", &value)?;
        }
        if let Some(value) = get("LLM_MAX_RETRIES") {
            self.llm.retry.max_retries = parse("LLM_MAX_RETRIES", &value)?;
        }
        if let Some(value) = get("TASK_WORKERS") {
            self.workers = parse("TASK_WORKERS", &value)?;
        }
        if let Some(value) = get("TASK_TIMEOUT") {
            self.task_timeout_secs = parse("TASK_TIMEOUT", &value)?;
        }
        if let Some(value) = get("HOST") {
            self.host = value;
        }
        if let Some(value) = get("PORT") {
            self.port = parse("PORT", &value)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        self.llm
            .validate()
            .map_err(|e| OrchestratorError::Config(e.to_string()))?;
        if self.workers == 0 {
            return Err(OrchestratorError::Config("workers must be > 0".to_string()));
        }
        if self.host.trim().is_empty() {
            return Err(OrchestratorError::Config("host must not be empty".to_string()));
        }
        Ok(())
    }

    /// Whole-task budget, `None` when disabled
    pub fn task_timeout(&self) -> Option<Duration> {
        (self.task_timeout_secs > 0).then(|| Duration::from_secs(self.task_timeout_secs))
    }

    /// `host:port` to bind
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn parse<T>(key: &str, value: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value
        .parse()
        .map_err(|e| OrchestratorError::Config(format!("{}='{}': {}", key, value, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.workers, 8);
        assert_eq!(config.task_timeout(), Some(Duration::from_secs(1800)));
        assert_eq!(config.llm.max_concurrency, 5);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml() {
        let config = AppConfig::from_toml(
            r#"
workers = 4
task_timeout_secs = 0

[llm]
model = "gpt-4o-mini"
requests_per_minute = 30

[llm.retry]
max_retries = 5
"#,
        )
        .unwrap();

        assert_eq!(config.workers, 4);
        assert_eq!(config.task_timeout(), None);
        assert_eq!(config.llm.model, "gpt-4o-mini");
        assert_eq!(config.llm.requests_per_minute, 30);
        assert_eq!(config.llm.retry.max_retries, 5);
        assert_eq!(config.llm.timeout_secs, 120);
        assert_eq!(config.port, 8080);
    }

    #[test]
    fn test_env_overrides() {
        let mut config = AppConfig::default();
        config
            .apply_overrides(env(&[
                ("LLM_API_KEY", "sk-live"),
                ("LLM_MAX_CONCURRENCY", "2"),
                ("LLM_RATE_LIMIT", "20"),
                ("TASK_WORKERS", "16"),
                ("PORT", " 9000 "),
                ("LLM_MODEL", "   "),
            ]))
            .unwrap();

        assert_eq!(config.llm.api_key, "sk-live");
        assert_eq!(config.llm.max_concurrency, 2);
        assert_eq!(config.llm.requests_per_minute, 20);
        assert_eq!(config.workers, 16);
        assert_eq!(config.bind_address(), "0.0.0.0:9000");
        assert_eq!(config.llm.model, "deepseek-chat");
    }

    #[test]
    fn test_bad_override_is_config_error() {
        let mut config = AppConfig::default();
        let err = config
            .apply_overrides(env(&[("LLM_TIMEOUT", "soon")]))
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::Config(_)));
        assert!(err.to_string().contains("LLM_TIMEOUT"));
    }

    #[test]
    fn test_huge_timeouts_are_accepted() {
        let mut config = AppConfig::default();
        config
            .apply_overrides(env(&[
                ("TASK_TIMEOUT", "18446744073709551615"),
                ("LLM_ACQUIRE_TIMEOUT", "18446744073709551615"),
            ]))
            .unwrap();

        assert!(config.validate().is_ok());
        assert_eq!(config.task_timeout(), Some(Duration::from_secs(u64::MAX)));
    }

    #[test]
    fn test_validate_rejects_zero_workers() {
        let config = AppConfig {
            workers: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = AppConfig {
            llm: LlmConfig {
                max_concurrency: 0,
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
