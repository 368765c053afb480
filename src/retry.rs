//! Backoff policy for transient backend failures.
//!
//! The orchestrator paces its retries through a [`Backoff`] it drives
//! explicitly: feed each failure in, get back how long to sleep before
//! the next attempt, or `None` when the error is not transient or the
//! attempt budget is spent. Whether an error is transient is decided by
//! the taxonomy itself ([`Error::is_retryable`]); rate-limit errors
//! carrying a retry-after hint wait for the hint instead of the computed
//! delay.
//!
//! The module is public so callers can pace their own operations with the
//! same policy.
//!
//! # Examples
//!
//! ```rust,no_run
//! use midstream::retry::RetryConfig;
//! use std::time::Duration;
//!
//! # async fn example() -> midstream::Result<u32> {
//! let config = RetryConfig::default()
//!     .attempts(5)
//!     .base_delay(Duration::from_millis(250));
//!
//! let mut backoff = config.start();
//! loop {
//!     match fetch().await {
//!         Ok(value) => return Ok(value),
//!         Err(err) => match backoff.next_delay(&err) {
//!             Some(delay) => tokio::time::sleep(delay).await,
//!             None => return Err(err),
//!         },
//!     }
//! }
//! # }
//! # async fn fetch() -> midstream::Result<u32> { Ok(1) }
//! ```

use crate::Error;
use std::time::Duration;

/// Backoff policy: how many attempts one operation gets, and how the
/// delays between them grow.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
    growth: f64,
    jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            growth: 2.0,
            jitter: 0.1,
        }
    }
}

impl RetryConfig {
    /// A policy that never retries (single attempt).
    pub fn disabled() -> Self {
        Self::default().attempts(1)
    }

    /// Total attempts allowed, first try included. At least 1.
    pub fn attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts.max(1);
        self
    }

    /// Delay before the first retry.
    pub fn base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    /// Ceiling on any single computed delay (jitter may land slightly
    /// around it).
    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Growth factor applied per retry; 2.0 doubles each time.
    pub fn growth(mut self, factor: f64) -> Self {
        self.growth = factor;
        self
    }

    /// Fractional jitter applied to each delay, clamped to [0, 1].
    pub fn jitter(mut self, fraction: f64) -> Self {
        self.jitter = fraction.clamp(0.0, 1.0);
        self
    }

    /// Begin tracking one operation's attempts.
    pub fn start(&self) -> Backoff<'_> {
        Backoff {
            config: self,
            failures: 0,
        }
    }

    /// Delay after the given number of prior failures, jittered.
    fn delay_after(&self, failures: u32) -> Duration {
        // 16 doublings of any sane base already clear every practical
        // max_delay; clamping keeps the float arithmetic finite.
        let exponent = failures.min(16) as i32;
        let nominal = self.base_delay.as_secs_f64() * self.growth.powi(exponent);
        let capped = nominal.min(self.max_delay.as_secs_f64());

        if self.jitter <= 0.0 {
            return Duration::from_secs_f64(capped.max(0.0));
        }
        // Uniform spread inside ±jitter of the capped value, so
        // synchronized clients drift apart instead of stampeding.
        let spread = 1.0 + self.jitter * (2.0 * rand::random::<f64>() - 1.0);
        Duration::from_secs_f64((capped * spread).max(0.0))
    }
}

/// Attempt tracking for one operation.
#[derive(Debug)]
pub struct Backoff<'a> {
    config: &'a RetryConfig,
    failures: u32,
}

impl Backoff<'_> {
    /// Record a failure and decide whether to try again.
    ///
    /// Returns the sleep to take before the next attempt, or `None` when
    /// the error is not transient or the attempt budget is spent.
    pub fn next_delay(&mut self, error: &Error) -> Option<Duration> {
        self.failures += 1;
        if !error.is_retryable() || self.failures >= self.config.attempts {
            return None;
        }
        Some(
            error
                .retry_after()
                .unwrap_or_else(|| self.config.delay_after(self.failures - 1)),
        )
    }

    /// Failed attempts recorded so far.
    pub fn failures(&self) -> u32 {
        self.failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server_err() -> Error {
        Error::server("boom")
    }

    fn assert_close(delay: Duration, expected_ms: u64) {
        let diff = delay.as_millis() as i64 - expected_ms as i64;
        assert!(diff.abs() <= 1, "{:?} not within 1ms of {}ms", delay, expected_ms);
    }

    #[test]
    fn delays_grow_toward_the_cap() {
        let config = RetryConfig::default()
            .base_delay(Duration::from_millis(100))
            .max_delay(Duration::from_millis(350))
            .growth(2.0)
            .jitter(0.0);

        assert_close(config.delay_after(0), 100);
        assert_close(config.delay_after(1), 200);
        // 400ms nominal, capped.
        assert_close(config.delay_after(2), 350);
        assert_close(config.delay_after(12), 350);
    }

    #[test]
    fn jitter_stays_inside_the_band() {
        let config = RetryConfig::default()
            .base_delay(Duration::from_millis(100))
            .max_delay(Duration::from_secs(10))
            .growth(1.0)
            .jitter(0.5);

        for _ in 0..64 {
            let delay = config.delay_after(3);
            assert!(delay >= Duration::from_millis(49), "too short: {:?}", delay);
            assert!(delay <= Duration::from_millis(151), "too long: {:?}", delay);
        }
    }

    #[test]
    fn backoff_stops_after_attempt_budget() {
        let config = RetryConfig::default()
            .attempts(3)
            .base_delay(Duration::from_millis(1))
            .jitter(0.0);
        let mut backoff = config.start();

        assert!(backoff.next_delay(&server_err()).is_some());
        assert!(backoff.next_delay(&server_err()).is_some());
        // Third failure exhausts the three-attempt budget.
        assert!(backoff.next_delay(&server_err()).is_none());
        assert_eq!(backoff.failures(), 3);
    }

    #[test]
    fn non_retryable_errors_stop_immediately() {
        let config = RetryConfig::default().attempts(5);
        let mut backoff = config.start();
        assert!(backoff.next_delay(&Error::auth("bad key")).is_none());
        assert!(backoff.next_delay(&Error::config("nope")).is_none());
    }

    #[test]
    fn retry_after_hint_overrides_computed_delay() {
        let config = RetryConfig::default()
            .base_delay(Duration::from_secs(30))
            .jitter(0.0);
        let mut backoff = config.start();

        let delay = backoff
            .next_delay(&Error::rate_limit(
                "slow down",
                Some(Duration::from_millis(20)),
            ))
            .unwrap();
        assert_eq!(delay, Duration::from_millis(20));
    }

    #[test]
    fn disabled_policy_never_retries() {
        let config = RetryConfig::disabled();
        let mut backoff = config.start();
        assert!(backoff.next_delay(&server_err()).is_none());
        assert_eq!(backoff.failures(), 1);
    }

    #[test]
    fn attempts_clamp_to_at_least_one() {
        let config = RetryConfig::default().attempts(0);
        let mut backoff = config.start();
        assert!(backoff.next_delay(&server_err()).is_none());
    }
}
