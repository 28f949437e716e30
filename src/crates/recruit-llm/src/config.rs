//! Configuration for the LLM endpoint and its call budget.

use crate::error::{LlmError, Result};
use crate::retry::RetryConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Connection, gating and retry settings for [`crate::LlmClient`].
///
/// Read once at start-up; the client never mutates it afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// Base URL of an OpenAI-compatible API.
    ///
    /// Examples:
    /// - Deepseek: "https://api.deepseek.com"
    /// - OpenAI: "https://api.openai.com/v1"
    pub base_url: String,

    /// API key sent as a bearer token. Empty means unconfigured.
    pub api_key: String,

    /// Model name/identifier.
    pub model: String,

    /// Default sampling temperature.
    pub temperature: f32,

    /// Per-call timeout in seconds.
    pub timeout_secs: u64,

    /// Maximum number of in-flight calls.
    pub max_concurrency: usize,

    /// Maximum number of calls started per minute.
    pub requests_per_minute: u32,

    /// How long a call may wait for a concurrency slot and rate token.
    pub acquire_timeout_secs: u64,

    /// Retry strategy for transient failures.
    pub retry: RetryConfig,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.deepseek.com".to_string(),
            api_key: String::new(),
            model: "deepseek-chat".to_string(),
            temperature: 0.7,
            timeout_secs: 120,
            max_concurrency: 5,
            requests_per_minute: 60,
            acquire_timeout_secs: 300,
            retry: RetryConfig::default(),
        }
    }
}

impl LlmConfig {
    /// Create a configuration for the given endpoint, keeping every other default.
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            model: model.into(),
            ..Default::default()
        }
    }

    /// Set the per-call timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_secs = timeout.as_secs();
        self
    }

    /// Set the concurrency limit.
    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = max;
        self
    }

    /// Set the requests-per-minute ceiling.
    pub fn with_requests_per_minute(mut self, rpm: u32) -> Self {
        self.requests_per_minute = rpm;
        self
    }

    /// Set the gate wait budget.
    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout_secs = timeout.as_secs();
        self
    }

    /// Set the retry strategy.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_secs)
    }

    /// Whether an API key is present.
    pub fn has_api_key(&self) -> bool {
        !self.api_key.trim().is_empty()
    }

    /// Validate the configuration.
    ///
    /// A missing API key is not an error here: the server starts and reports
    /// itself unconfigured through the status endpoint.
    pub fn validate(&self) -> Result<()> {
        if self.base_url.trim().is_empty() {
            return Err(LlmError::Config("base_url must not be empty".to_string()));
        }
        if !self.base_url.starts_with("http://") && !self.base_url.starts_with("https://") {
            return Err(LlmError::Config(format!(
                "base_url must be an http(s) URL, got '{}'",
                self.base_url
            )));
        }
        if self.model.trim().is_empty() {
            return Err(LlmError::Config("model must not be empty".to_string()));
        }
        if !(0.0..=2.0).contains(&self.temperature) {
            return Err(LlmError::Config(format!(
                "temperature must be within [0, 2], got {}",
                self.temperature
            )));
        }
        if self.timeout_secs == 0 {
            return Err(LlmError::Config("timeout_secs must be > 0".to_string()));
        }
        if self.max_concurrency == 0 {
            return Err(LlmError::Config("max_concurrency must be > 0".to_string()));
        }
        if self.requests_per_minute == 0 {
            return Err(LlmError::Config("requests_per_minute must be > 0".to_string()));
        }
        if self.retry.backoff_multiplier < 1.0 {
            return Err(LlmError::Config(
                "retry.backoff_multiplier must be >= 1.0".to_string(),
            ));
        }
        Ok(())
    }
}
