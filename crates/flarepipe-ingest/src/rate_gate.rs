//! Per-source minimum spacing between outbound requests
//!
//! Each gated source gets its own `governor` limiter with a one-cell burst,
//! so consecutive request starts to that source are at least its interval
//! apart. Sources never block each other; a zero interval means ungated.

use std::collections::HashMap;
use std::num::NonZeroU32;
use std::time::Duration;

use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use tracing::trace;

#[derive(Default)]
pub struct RateGate {
    intervals: HashMap<String, Duration>,
    limiters: HashMap<String, DefaultDirectRateLimiter>,
}

impl RateGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Require `interval` between consecutive requests to `source`
    pub fn with_interval(mut self, source: impl Into<String>, interval: Duration) -> Self {
        let source = source.into();
        match Quota::with_period(interval) {
            Some(quota) => {
                let limiter = RateLimiter::direct(quota.allow_burst(NonZeroU32::MIN));
                self.limiters.insert(source.clone(), limiter);
            },
            None => {
                self.limiters.remove(&source);
            },
        }
        self.intervals.insert(source, interval);
        self
    }

    /// Configured spacing for `source`; unknown sources are ungated
    pub fn interval(&self, source: &str) -> Duration {
        self.intervals.get(source).copied().unwrap_or(Duration::ZERO)
    }

    /// Wait for the source's turn and claim it
    pub async fn wait(&self, source: &str) {
        let Some(limiter) = self.limiters.get(source) else {
            return;
        };
        if limiter.check().is_ok() {
            return;
        }
        trace!(
            source,
            interval_ms = self.interval(source).as_millis() as u64,
            "Rate gate waiting"
        );
        limiter.until_ready().await;
    }
}

impl std::fmt::Debug for RateGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateGate")
            .field("intervals", &self.intervals)
            .finish_non_exhaustive()
    }
}
