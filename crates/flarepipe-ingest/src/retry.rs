//! Bounded retry with exponential backoff
//!
//! An operation is attempted at most `max_attempts` times. Before attempt
//! `k >= 2` the policy sleeps `base_delay * 2^(k-2)`; nothing is slept after
//! the final attempt. Fatal errors stop immediately.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::{AttemptError, FetchError};

/// Classify an HTTP status code
///
/// 2xx is success, 429 and the transient 5xx codes are retryable, anything
/// else is fatal for the request.
pub fn check_status(status: u16) -> Result<(), AttemptError> {
    match status {
        200..=299 => Ok(()),
        429 | 500 | 502 | 503 | 504 => Err(AttemptError::Retryable(format!("HTTP {status}"))),
        _ => Err(AttemptError::Fatal(format!("HTTP {status}"))),
    }
}

/// Outcome of one attempt, as reported in logs
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    Success,
    Retryable(String),
    Fatal(String),
}

/// Observation of a single attempt
///
/// Built per attempt and consumed by logging; never stored.
#[derive(Debug, Clone)]
pub struct FetchAttempt<'a> {
    pub source: &'a str,
    pub attempt: u32,
    pub max_attempts: u32,
    pub outcome: AttemptOutcome,
    pub elapsed: Duration,
}

impl FetchAttempt<'_> {
    fn log(&self) {
        let elapsed_ms = self.elapsed.as_millis() as u64;
        match &self.outcome {
            AttemptOutcome::Success => debug!(
                source = self.source,
                attempt = self.attempt,
                elapsed_ms,
                "Attempt succeeded"
            ),
            AttemptOutcome::Retryable(error) => warn!(
                source = self.source,
                attempt = self.attempt,
                max_attempts = self.max_attempts,
                elapsed_ms,
                error = %error,
                "Attempt failed"
            ),
            AttemptOutcome::Fatal(error) => warn!(
                source = self.source,
                attempt = self.attempt,
                elapsed_ms,
                error = %error,
                "Attempt failed with non-retryable error"
            ),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(2))
    }
}

impl RetryPolicy {
    /// Create a policy; `max_attempts` is clamped to at least one
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn base_delay(&self) -> Duration {
        self.base_delay
    }

    /// Delay slept before attempt number `attempt` (1-based)
    pub fn delay_before(&self, attempt: u32) -> Duration {
        if attempt < 2 {
            return Duration::ZERO;
        }
        let factor = 2u32.saturating_pow(attempt - 2);
        self.base_delay.checked_mul(factor).unwrap_or(Duration::MAX)
    }

    /// Run `operation` until it succeeds, fails fatally, or attempts run out
    pub async fn execute<T, F, Fut>(&self, source: &str, mut operation: F) -> Result<T, FetchError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, AttemptError>>,
    {
        let mut last_error = String::new();

        for attempt in 1..=self.max_attempts {
            if attempt > 1 {
                let delay = self.delay_before(attempt);
                debug!(source, attempt, delay_ms = delay.as_millis() as u64, "Backing off");
                tokio::time::sleep(delay).await;
            }

            let started = Instant::now();
            let result = operation().await;
            let elapsed = started.elapsed();

            let outcome = match &result {
                Ok(_) => AttemptOutcome::Success,
                Err(AttemptError::Retryable(e)) => AttemptOutcome::Retryable(e.clone()),
                Err(AttemptError::Fatal(e)) => AttemptOutcome::Fatal(e.clone()),
            };
            FetchAttempt {
                source,
                attempt,
                max_attempts: self.max_attempts,
                outcome,
                elapsed,
            }
            .log();

            match result {
                Ok(value) => return Ok(value),
                Err(AttemptError::Fatal(error)) => return Err(FetchError::Fatal { attempt, error }),
                Err(AttemptError::Retryable(error)) => last_error = error,
            }
        }

        Err(FetchError::Exhausted {
            attempts: self.max_attempts,
            last_error,
        })
    }
}
