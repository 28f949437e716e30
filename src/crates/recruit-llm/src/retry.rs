//! Backoff policy for transient LLM failures
//!
//! Exponential backoff with jitter. The delay computation is a pure function
//! so it can be tested deterministically; [`retry_with_backoff`] is the only
//! part that sleeps.

use crate::error::{LlmError, Result};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Upper bound of the random jitter, as a fraction of the base delay.
pub const MAX_JITTER_FRACTION: f64 = 0.25;

/// How often and how patiently a failed call is repeated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Extra calls after the first one
    pub max_retries: u32,

    /// Delay before the first retry, in ms
    pub initial_backoff_ms: u64,

    /// Ceiling for any single delay before jitter, in ms
    pub max_backoff_ms: u64,

    /// Growth factor per retry
    pub backoff_multiplier: f64,

    /// Stretch each delay by up to [`MAX_JITTER_FRACTION`]
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff_ms: 1000,
            max_backoff_ms: 30_000,
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Default::default()
        }
    }

    pub fn with_initial_backoff(mut self, ms: u64) -> Self {
        self.initial_backoff_ms = ms;
        self
    }

    pub fn with_max_backoff(mut self, ms: u64) -> Self {
        self.max_backoff_ms = ms;
        self
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Delay before retry `attempt` (0-based), with random jitter when enabled.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let jitter_fraction = if self.jitter {
            MAX_JITTER_FRACTION * rand::random::<f64>()
        } else {
            0.0
        };

        backoff_delay(
            attempt,
            Duration::from_millis(self.initial_backoff_ms),
            Duration::from_millis(self.max_backoff_ms),
            self.backoff_multiplier,
            jitter_fraction,
        )
    }
}

/// Delay to wait before retry `attempt` (0-based).
///
/// `initial * multiplier^attempt`, capped at `max`, then stretched by
/// `jitter_fraction` (clamped to `[0, MAX_JITTER_FRACTION]`). No I/O, no
/// randomness: callers supply the jitter.
pub fn backoff_delay(
    attempt: u32,
    initial: Duration,
    max: Duration,
    multiplier: f64,
    jitter_fraction: f64,
) -> Duration {
    let exponent = attempt.min(i32::MAX as u32) as i32;
    let base_ms = initial.as_millis() as f64 * multiplier.max(1.0).powi(exponent);
    let capped_ms = base_ms.min(max.as_millis() as f64);

    let jitter = jitter_fraction.clamp(0.0, MAX_JITTER_FRACTION);
    let total_ms = capped_ms + capped_ms * jitter;

    Duration::from_millis(total_ms as u64)
}

/// Run `f` until it succeeds, fails permanently, or runs out of retries.
///
/// `f` is called once plus at most `config.max_retries` more times, sleeping
/// [`RetryConfig::backoff_delay`] between calls. The last error comes back
/// unchanged so its classification survives.
pub async fn retry_with_backoff<F, Fut, T>(
    config: &RetryConfig,
    operation_name: &str,
    mut f: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt: u32 = 0;
    loop {
        let err = match f().await {
            Ok(value) => {
                if attempt > 0 {
                    info!(operation = operation_name, retries = attempt, "Recovered after retry");
                }
                return Ok(value);
            }
            Err(err) => err,
        };

        if !should_retry(&err, attempt, config) {
            let exhausted = err.is_retryable();
            error!(
                operation = operation_name,
                retries = attempt,
                kind = %err.kind(),
                error = %err,
                exhausted,
                "Giving up"
            );
            return Err(err);
        }

        let delay = config.backoff_delay(attempt);
        warn!(
            operation = operation_name,
            attempt = attempt + 1,
            of = config.max_retries,
            kind = %err.kind(),
            delay_ms = delay.as_millis() as u64,
            "Transient failure, backing off"
        );
        debug!(operation = operation_name, error = %err, "Transient failure detail");
        tokio::time::sleep(delay).await;
        attempt += 1;
    }
}

/// Whether a failure on zero-based `attempt` earns another try.
pub fn should_retry(error: &LlmError, attempt: u32, config: &RetryConfig) -> bool {
    error.is_retryable() && attempt < config.max_retries
}
