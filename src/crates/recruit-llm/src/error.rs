//! Error types for LLM invocation.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type for LLM operations.
pub type Result<T> = std::result::Result<T, LlmError>;

/// Errors that can occur when calling the LLM endpoint.
///
/// Every failure that leaves [`crate::LlmClient`] is one of these variants;
/// callers use [`LlmError::kind`] to record a stable classification.
#[derive(Debug, Clone, Error)]
pub enum LlmError {
    /// The call did not complete within the per-call timeout.
    #[error("Request timeout: {0}")]
    Timeout(String),

    /// The provider answered 429.
    #[error("Rate limit exceeded: {0}")]
    RateLimited(String),

    /// Connection reset, DNS failure, 5xx and other transport-level problems.
    #[error("Transport error: {0}")]
    Transport(String),

    /// The provider answered, but not with something usable.
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// API key rejected (401/403) or missing.
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// No concurrency slot or rate token became available within the wait budget.
    #[error("Timed out waiting for LLM capacity after {waited_ms}ms")]
    RateLimitTimeout { waited_ms: u64 },

    /// Invalid client configuration.
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Stable classification of an [`LlmError`].
///
/// The serialized names are part of the status payload and must not change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LlmErrorKind {
    LlmTimeout,
    LlmRateLimited,
    LlmTransportError,
    LlmInvalidResponse,
    LlmAuthError,
    RateLimitTimeout,
    ConfigError,
}

impl std::fmt::Display for LlmErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            LlmErrorKind::LlmTimeout => "LlmTimeout",
            LlmErrorKind::LlmRateLimited => "LlmRateLimited",
            LlmErrorKind::LlmTransportError => "LlmTransportError",
            LlmErrorKind::LlmInvalidResponse => "LlmInvalidResponse",
            LlmErrorKind::LlmAuthError => "LlmAuthError",
            LlmErrorKind::RateLimitTimeout => "RateLimitTimeout",
            LlmErrorKind::ConfigError => "ConfigError",
        };
        f.write_str(name)
    }
}

impl LlmError {
    /// Classification of this error.
    pub fn kind(&self) -> LlmErrorKind {
        match self {
            LlmError::Timeout(_) => LlmErrorKind::LlmTimeout,
            LlmError::RateLimited(_) => LlmErrorKind::LlmRateLimited,
            LlmError::Transport(_) => LlmErrorKind::LlmTransportError,
            LlmError::InvalidResponse(_) => LlmErrorKind::LlmInvalidResponse,
            LlmError::Auth(_) => LlmErrorKind::LlmAuthError,
            LlmError::RateLimitTimeout { .. } => LlmErrorKind::RateLimitTimeout,
            LlmError::Config(_) => LlmErrorKind::ConfigError,
        }
    }

    /// Check if this error is retryable.
    ///
    /// Only transient provider-side conditions qualify. Waiting on the local
    /// gate already consumed its own budget, so it is not retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LlmError::Timeout(_) | LlmError::RateLimited(_) | LlmError::Transport(_)
        )
    }
}

impl From<reqwest::Error> for LlmError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            LlmError::Timeout(err.to_string())
        } else if err.is_decode() {
            LlmError::InvalidResponse(err.to_string())
        } else {
            LlmError::Transport(err.to_string())
        }
    }
}

impl From<serde_json::Error> for LlmError {
    fn from(err: serde_json::Error) -> Self {
        LlmError::InvalidResponse(err.to_string())
    }
}
