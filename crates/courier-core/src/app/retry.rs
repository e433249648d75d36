//! Retry policy: decides backoff delays between delivery attempts.

use rand::Rng;
use std::time::Duration;

/// Retry policy for transient delivery failures.
///
/// Exponential backoff with symmetric jitter. The attempt budget itself lives
/// in `RetryConfig::max_attempts`; this type only answers "how long to wait".
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Base delay for the first retry.
    pub base_delay: Duration,

    /// Backoff multiplier for exponential backoff.
    pub multiplier: f64,

    /// Fraction of the delay randomly added or removed (0.0 = none).
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(500),
            multiplier: 2.0,
            jitter: 0.2,
        }
    }
}

impl RetryPolicy {
    /// Delay before the next attempt, without jitter.
    ///
    /// # Arguments
    /// * `attempts` - Number of attempts already made (1-indexed).
    ///
    /// delay = base_delay * multiplier^(attempts - 1)
    ///
    /// Example with base_delay=500ms, multiplier=2.0:
    /// - after attempt 1: 500ms
    /// - after attempt 2: 1s
    /// - after attempt 3: 2s
    pub fn base_delay_for(&self, attempts: u32) -> Duration {
        let base_secs = self.base_delay.as_secs_f64();
        let exponent = attempts.saturating_sub(1).min(i32::MAX as u32) as i32;
        let delay_secs = base_secs * self.multiplier.powi(exponent);
        Duration::try_from_secs_f64(delay_secs).unwrap_or(Duration::MAX)
    }

    /// Delay before the next attempt, jitter applied.
    pub fn next_delay(&self, attempts: u32) -> Duration {
        let delay = self.base_delay_for(attempts);
        if self.jitter <= 0.0 || delay.is_zero() || delay == Duration::MAX {
            return delay;
        }
        let factor = 1.0 + rand::thread_rng().gen_range(-self.jitter..=self.jitter);
        Duration::try_from_secs_f64(delay.as_secs_f64() * factor.max(0.0)).unwrap_or(Duration::MAX)
    }
}
