//! Pacing for Telegram API calls.
//!
//! Batch downloads fetch many posts with the same user account; spacing the
//! requests out and backing off on flood waits keeps the account from being
//! limited.

use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Base delay of the exponential backoff.
pub const BACKOFF_BASE: Duration = Duration::from_secs(1);

/// Ceiling of the exponential backoff.
pub const BACKOFF_MAX: Duration = Duration::from_secs(300);

/// Delay before retry number `attempt` (0-based): `min(base * 2^attempt, max)`.
#[must_use]
pub fn backoff_delay(attempt: u32, base: Duration, max: Duration) -> Duration {
    let factor = 2_u32.checked_pow(attempt).unwrap_or(u32::MAX);
    base.checked_mul(factor).map_or(max, |delay| delay.min(max))
}

/// Rate limiter that enforces minimum intervals between operations.
#[derive(Debug)]
pub struct RateLimiter {
    /// Minimum duration between allowed operations.
    min_interval: Duration,

    /// Last time an operation was performed.
    last_operation: Mutex<Option<Instant>>,
}

impl RateLimiter {
    #[must_use]
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_operation: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn from_secs(secs: u64) -> Self {
        Self::new(Duration::from_secs(secs))
    }

    /// Waits until an operation is allowed, then marks the operation as performed.
    ///
    /// Returns the duration waited (0 if no wait was needed).
    pub async fn wait_and_acquire(&self) -> Duration {
        let mut last = self.last_operation.lock().await;

        let wait_duration = last.map_or(Duration::ZERO, |last_time| {
            self.min_interval.saturating_sub(last_time.elapsed())
        });

        if !wait_duration.is_zero() {
            debug!(
                "Rate limiter: waiting {:?} before next operation",
                wait_duration
            );
            tokio::time::sleep(wait_duration).await;
        }

        *last = Some(Instant::now());
        wait_duration
    }

    /// Returns the time remaining until the next operation is allowed.
    pub async fn time_until_allowed(&self) -> Duration {
        let last = self.last_operation.lock().await;
        last.map_or(Duration::ZERO, |last_time| {
            self.min_interval.saturating_sub(last_time.elapsed())
        })
    }

    /// Sleeps out a flood wait from Telegram and restarts the interval.
    pub async fn handle_flood_wait(&self, wait_seconds: u32) {
        warn!(
            "Received flood wait from Telegram: {} seconds",
            wait_seconds
        );
        tokio::time::sleep(Duration::from_secs(u64::from(wait_seconds))).await;

        let mut last = self.last_operation.lock().await;
        *last = Some(Instant::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_until_cap() {
        assert_eq!(backoff_delay(0, BACKOFF_BASE, BACKOFF_MAX), Duration::from_secs(1));
        assert_eq!(backoff_delay(3, BACKOFF_BASE, BACKOFF_MAX), Duration::from_secs(8));
        assert_eq!(backoff_delay(8, BACKOFF_BASE, BACKOFF_MAX), Duration::from_secs(256));
        assert_eq!(backoff_delay(9, BACKOFF_BASE, BACKOFF_MAX), BACKOFF_MAX);
        assert_eq!(backoff_delay(64, BACKOFF_BASE, BACKOFF_MAX), BACKOFF_MAX);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limiter_first_operation() {
        let limiter = RateLimiter::from_secs(3);
        let waited = limiter.wait_and_acquire().await;
        assert_eq!(waited, Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limiter_spaces_operations() {
        let limiter = RateLimiter::from_secs(3);
        limiter.wait_and_acquire().await;
        assert!(limiter.time_until_allowed().await > Duration::ZERO);

        let started = Instant::now();
        limiter.wait_and_acquire().await;
        assert!(started.elapsed() >= Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_flood_wait_restarts_interval() {
        let limiter = RateLimiter::from_secs(3);
        limiter.handle_flood_wait(10).await;
        assert_eq!(limiter.time_until_allowed().await, Duration::from_secs(3));
    }
}
