//! Exponential backoff for change feed retries
//!
//! - First retry waits the minimum delay
//! - Each consecutive failure doubles the delay, capped at the maximum
//! - A successful response resets to the minimum
//! - Sleeping is cancellable; a stop request ends the wait at once

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use super::config::BackoffConfig;

/// Delay before retry number `attempt` (0-based), doubling from `min`
/// and never exceeding `max`.
pub fn delay_for_attempt(min: Duration, max: Duration, attempt: u32) -> Duration {
    let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
    min.checked_mul(factor).unwrap_or(max).min(max)
}

/// Retry state of one change feed.
#[derive(Debug, Clone)]
pub struct Backoff {
    min: Duration,
    max: Duration,
    attempts: u32,
}

impl Backoff {
    pub fn new(min: Duration, max: Duration) -> Self {
        Self {
            min,
            max: max.max(min),
            attempts: 0,
        }
    }

    pub fn from_config(config: &BackoffConfig) -> Self {
        Self::new(
            Duration::from_millis(config.min_delay_ms),
            Duration::from_millis(config.max_delay_ms),
        )
    }

    /// Consecutive failures since the last reset.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Delay the next `next_delay` call will return.
    pub fn current_delay(&self) -> Duration {
        delay_for_attempt(self.min, self.max, self.attempts)
    }

    /// Record a failure and return how long to wait before retrying.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current_delay();
        self.attempts = self.attempts.saturating_add(1);
        delay
    }

    /// Record a success.
    pub fn reset(&mut self) {
        self.attempts = 0;
    }

    /// Wait out `delay` unless `cancel` fires first. Returns false if
    /// cancelled.
    pub async fn sleep(delay: Duration, cancel: &CancellationToken) -> bool {
        tokio::select! {
            _ = cancel.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }
}
