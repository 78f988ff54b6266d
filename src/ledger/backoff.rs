//! Exponential backoff for ledger calls and secret watches

use std::time::Duration;
use tracing::{debug, warn};

/// Exponential backoff state tracker
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    base_interval_ms: u64,
    max_interval_ms: u64,
    current_attempt: u32,
    current_interval_ms: u64,
}

impl ExponentialBackoff {
    /// Create new backoff handler
    pub fn new(base_interval_ms: u64, max_interval_ms: u64) -> Self {
        ExponentialBackoff {
            base_interval_ms,
            max_interval_ms: max_interval_ms.max(base_interval_ms),
            current_attempt: 0,
            current_interval_ms: base_interval_ms,
        }
    }

    /// Record a failure and return the backoff duration
    pub fn on_failure(&mut self, error_message: &str) -> Duration {
        self.current_attempt += 1;

        // base * 2^(attempts - 1), capped
        let next_interval = self
            .base_interval_ms
            .saturating_mul(2_u64.saturating_pow(self.current_attempt.saturating_sub(1)));
        self.current_interval_ms = next_interval.min(self.max_interval_ms);

        warn!(
            attempt = self.current_attempt,
            interval_ms = self.current_interval_ms,
            error = error_message,
            "Ledger call failed, backing off"
        );

        Duration::from_millis(self.current_interval_ms)
    }

    /// Reset backoff on successful operation
    pub fn on_success(&mut self) {
        if self.current_attempt > 0 {
            debug!(
                attempts = self.current_attempt,
                "Recovered after {} attempts, resetting backoff", self.current_attempt
            );
        }
        self.current_attempt = 0;
        self.current_interval_ms = self.base_interval_ms;
    }

    /// Get current number of failed attempts
    pub fn attempts(&self) -> u32 {
        self.current_attempt
    }

    /// Get current interval
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.current_interval_ms)
    }

    /// Check if the attempt budget is spent
    pub fn should_give_up(&self, max_total_attempts: u32) -> bool {
        self.current_attempt >= max_total_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_backoff_sequence() {
        let mut backoff = ExponentialBackoff::new(100, 10_000);

        assert_eq!(backoff.on_failure("e1"), Duration::from_millis(100));
        assert_eq!(backoff.on_failure("e2"), Duration::from_millis(200));
        assert_eq!(backoff.on_failure("e3"), Duration::from_millis(400));
        assert_eq!(backoff.on_failure("e4"), Duration::from_millis(800));
    }

    #[test]
    fn test_backoff_max_interval() {
        let mut backoff = ExponentialBackoff::new(100, 1_000);
        for _ in 0..10 {
            backoff.on_failure("test");
        }
        assert_eq!(backoff.interval(), Duration::from_millis(1_000));
    }

    #[test]
    fn test_backoff_reset_and_give_up() {
        let mut backoff = ExponentialBackoff::new(50, 500);
        assert!(!backoff.should_give_up(2));

        backoff.on_failure("e1");
        assert!(!backoff.should_give_up(2));
        backoff.on_failure("e2");
        assert!(backoff.should_give_up(2));

        backoff.on_success();
        assert_eq!(backoff.attempts(), 0);
        assert_eq!(backoff.interval(), Duration::from_millis(50));
    }
}
