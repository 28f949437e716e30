//! Process-wide admission control for LLM calls.
//!
//! A [`RateLimitedGate`] combines a counting semaphore (in-flight calls) with
//! a token bucket (calls started per minute). One instance is shared by every
//! [`crate::LlmClient`] in the process.

use crate::error::{LlmError, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tracing::{debug, warn};

/// Absorbs float drift in the refill arithmetic.
const TOKEN_EPSILON: f64 = 1e-9;

/// Shortest wait between refill checks.
const MIN_TOKEN_WAIT: Duration = Duration::from_millis(1);

/// Stand-in for an unbounded deadline, about thirty years out.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// `start + budget`, saturating to a far-future instant instead of panicking
/// when the sum does not fit.
pub fn deadline_after(start: Instant, budget: Duration) -> Instant {
    start
        .checked_add(budget)
        .or_else(|| start.checked_add(FAR_FUTURE))
        .unwrap_or(start)
}

/// Token bucket refilled continuously.
#[derive(Debug)]
struct TokenBucket {
    tokens: f64,
    capacity: f64,
    /// Tokens added per second
    refill_rate: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// Bucket for `per_minute` calls, starting full.
    fn per_minute(per_minute: u32) -> Self {
        let capacity = f64::from(per_minute.max(1));
        Self {
            tokens: capacity,
            capacity,
            refill_rate: capacity / 60.0,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.capacity);
        self.last_refill = now;
    }

    /// Take one token, or return how long until one is available.
    fn try_take(&mut self, now: Instant) -> std::result::Result<(), Duration> {
        self.refill(now);
        if self.tokens + TOKEN_EPSILON >= 1.0 {
            self.tokens = (self.tokens - 1.0).max(0.0);
            Ok(())
        } else {
            let missing = 1.0 - self.tokens;
            Err(Duration::from_secs_f64(missing / self.refill_rate).max(MIN_TOKEN_WAIT))
        }
    }

    fn available(&mut self, now: Instant) -> u32 {
        self.refill(now);
        (self.tokens + TOKEN_EPSILON).floor() as u32
    }
}

/// Snapshot of the gate counters for status reporting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateStatus {
    pub max_concurrency: usize,
    pub available_permits: usize,
    pub requests_per_minute: u32,
    pub available_tokens: u32,
}

/// Bounds concurrent LLM calls and the rate at which they start.
#[derive(Debug)]
pub struct RateLimitedGate {
    semaphore: Arc<Semaphore>,
    bucket: Mutex<TokenBucket>,
    max_concurrency: usize,
    requests_per_minute: u32,
    acquire_timeout: Duration,
}

impl RateLimitedGate {
    /// Create a gate.
    ///
    /// `max_concurrency` and `requests_per_minute` are clamped to at least 1.
    pub fn new(max_concurrency: usize, requests_per_minute: u32, acquire_timeout: Duration) -> Self {
        let max_concurrency = max_concurrency.max(1);
        let requests_per_minute = requests_per_minute.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrency)),
            bucket: Mutex::new(TokenBucket::per_minute(requests_per_minute)),
            max_concurrency,
            requests_per_minute,
            acquire_timeout,
        }
    }

    /// Wait for a permit using the configured budget.
    pub async fn acquire(&self) -> Result<GatePermit> {
        self.acquire_within(self.acquire_timeout).await
    }

    /// Wait at most `budget` for both a concurrency slot and a rate token.
    ///
    /// The slot is taken first; if no token arrives in time the slot is given
    /// back and `RateLimitTimeout` is returned.
    pub async fn acquire_within(&self, budget: Duration) -> Result<GatePermit> {
        let started = Instant::now();
        let deadline = deadline_after(started, budget);

        let slot = match tokio::time::timeout_at(deadline, self.semaphore.clone().acquire_owned())
            .await
        {
            Ok(Ok(slot)) => slot,
            Ok(Err(_)) => return Err(LlmError::Config("rate gate is closed".to_string())),
            Err(_) => {
                let waited_ms = started.elapsed().as_millis() as u64;
                warn!(waited_ms, "Timed out waiting for an LLM concurrency slot");
                return Err(LlmError::RateLimitTimeout { waited_ms });
            }
        };

        loop {
            let now = Instant::now();
            let wait = match self.bucket.lock().try_take(now) {
                Ok(()) => break,
                Err(wait) => wait,
            };

            if now.checked_add(wait).map_or(true, |ready| ready > deadline) {
                let waited_ms = started.elapsed().as_millis() as u64;
                warn!(
                    waited_ms,
                    rpm = self.requests_per_minute,
                    "Rate budget exhausted before a token became available"
                );
                return Err(LlmError::RateLimitTimeout { waited_ms });
            }

            debug!(wait_ms = wait.as_millis() as u64, "Waiting for rate token");
            tokio::time::sleep(wait).await;
        }

        debug!(
            waited_ms = started.elapsed().as_millis() as u64,
            available = self.semaphore.available_permits(),
            "Acquired LLM permit"
        );

        Ok(GatePermit { _slot: slot })
    }

    /// Number of free concurrency slots.
    pub fn available_permits(&self) -> usize {
        self.semaphore.available_permits()
    }

    pub fn status(&self) -> GateStatus {
        GateStatus {
            max_concurrency: self.max_concurrency,
            available_permits: self.semaphore.available_permits(),
            requests_per_minute: self.requests_per_minute,
            available_tokens: self.bucket.lock().available(Instant::now()),
        }
    }
}

/// One unit of admitted LLM call capacity.
///
/// The concurrency slot is returned when the permit is dropped, so every exit
/// path (including cancellation of the owning future) releases it. Rate tokens
/// are consumed on acquisition and never returned.
#[derive(Debug)]
#[must_use = "dropping the permit releases the slot immediately"]
pub struct GatePermit {
    _slot: OwnedSemaphorePermit,
}

impl GatePermit {
    /// Release the permit explicitly.
    pub fn release(self) {
        drop(self);
    }
}
