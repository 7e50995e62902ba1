//! Exponential backoff for automatic reconnection.
//!
//! The delay before reconnect attempt `n` (counting from zero) is
//!
//! ```text
//! delay[n] = min(initial * multiplier^n, max_delay)
//! ```
//!
//! With the defaults (initial = 1s, multiplier = 2, max = 60s) consecutive
//! failures wait 1, 2, 4, 8, 16, 32, 60, 60, ... seconds. The attempt counter
//! only goes back to zero through [`Backoff::reset`], which the session calls
//! on every successful CONNACK.
//!
//! ```ignore
//! let mut backoff = Backoff::default();
//! assert_eq!(backoff.next_sleep()?, Duration::from_secs(1));
//! assert_eq!(backoff.next_sleep()?, Duration::from_secs(2));
//! backoff.reset();
//! assert_eq!(backoff.next_sleep()?, Duration::from_secs(1));
//! ```

use std::time::Duration;

use thiserror::Error;

/// Error type for backoff exhaustion.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BackoffError {
    /// The configured attempt limit was reached.
    #[error("Maximum number of reconnect attempts exceeded: {0}")]
    MaxAttemptLimitError(u32),
}

/// Reconnect delay calculator.
///
/// Not synchronized on its own; the session keeps it under the connection lock.
#[derive(Debug, Clone)]
pub struct Backoff {
    /// Delay before the first retry.
    initial_delay: Duration,

    /// Cap for any single delay.
    max_delay: Duration,

    /// Growth factor applied per attempt.
    multiplier: f64,

    /// Number of delays handed out since the last reset.
    attempt: u32,

    /// Optional hard limit on attempts. `None` retries forever.
    max_attempts: Option<u32>,
}

impl Backoff {
    /// Creates a backoff with custom timing.
    ///
    /// A `multiplier` below 1.0 is clamped to 1.0 (constant delay).
    pub fn new(initial: Duration, max: Duration, multiplier: f64) -> Self {
        Self {
            initial_delay: initial,
            max_delay: max.max(initial),
            multiplier: multiplier.max(1.0),
            attempt: 0,
            max_attempts: None,
        }
    }

    /// Limits the number of attempts. `0` means unlimited.
    pub fn with_max_attempts(mut self, max: u32) -> Self {
        self.max_attempts = (max > 0).then_some(max);
        self
    }

    /// Delay for a given zero-based attempt, without advancing the counter.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.powi(attempt.min(i32::MAX as u32) as i32);
        let secs = self.initial_delay.as_secs_f64() * factor;

        // powi overflows to inf for large attempts; the cap covers it
        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            self.max_delay
        } else {
            Duration::from_secs_f64(secs)
        }
    }

    /// Returns the delay for the current attempt and advances the counter.
    pub fn next_sleep(&mut self) -> Result<Duration, BackoffError> {
        if let Some(limit) = self.max_attempts {
            if self.attempt >= limit {
                return Err(BackoffError::MaxAttemptLimitError(limit));
            }
        }

        let sleep = self.delay_for(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        Ok(sleep)
    }

    /// Starts over from the initial delay.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Delays handed out since the last reset.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn max_attempts(&self) -> Option<u32> {
        self.max_attempts
    }
}

impl Default for Backoff {
    /// 1s initial delay, doubling, capped at 60s, unlimited attempts.
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(60), 2.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_default_sequence() {
        let mut backoff = Backoff::default();
        let delays: Vec<u64> = (0..10)
            .map(|_| backoff.next_sleep().unwrap().as_secs())
            .collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 32, 60, 60, 60, 60]);
        assert_eq!(backoff.attempt(), 10);
    }

    #[test]
    fn test_backoff_reset() {
        let mut backoff = Backoff::default();
        backoff.next_sleep().unwrap();
        backoff.next_sleep().unwrap();
        assert_eq!(backoff.attempt(), 2);

        backoff.reset();
        assert_eq!(backoff.attempt(), 0);
        assert_eq!(backoff.next_sleep().unwrap(), Duration::from_secs(1));
    }

    #[test]
    fn test_backoff_delay_for_does_not_advance() {
        let backoff = Backoff::default();
        assert_eq!(backoff.delay_for(3), Duration::from_secs(8));
        assert_eq!(backoff.attempt(), 0);
    }

    #[test]
    fn test_backoff_huge_attempt_is_capped() {
        let backoff = Backoff::default();
        assert_eq!(backoff.delay_for(10_000), Duration::from_secs(60));
    }

    #[test]
    fn test_backoff_max_attempts_exceeded() {
        let mut backoff = Backoff::default().with_max_attempts(2);

        assert!(backoff.next_sleep().is_ok());
        assert!(backoff.next_sleep().is_ok());
        assert_eq!(
            backoff.next_sleep(),
            Err(BackoffError::MaxAttemptLimitError(2))
        );
    }

    #[test]
    fn test_backoff_zero_max_attempts_is_unlimited() {
        let mut backoff = Backoff::default().with_max_attempts(0);
        assert_eq!(backoff.max_attempts(), None);
        for _ in 0..100 {
            assert!(backoff.next_sleep().is_ok());
        }
    }

    #[test]
    fn test_backoff_invalid_multiplier_is_constant() {
        let mut backoff = Backoff::new(Duration::from_secs(3), Duration::from_secs(10), 0.5);
        assert_eq!(backoff.next_sleep().unwrap(), Duration::from_secs(3));
        assert_eq!(backoff.next_sleep().unwrap(), Duration::from_secs(3));
    }
}
