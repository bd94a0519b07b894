use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Per-part retry policy: capped exponential backoff plus additive jitter.
///
/// `delay(attempt) = min(base_delay * 2^(attempt-1), max_delay) + U[0, max_jitter]`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(2000),
            max_delay: Duration::from_millis(10_000),
            max_jitter: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    /// No waiting between attempts. Useful in tests.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            max_jitter: Duration::ZERO,
        }
    }

    /// Backoff before the next attempt, excluding jitter. `attempt` is the
    /// 1-based number of the attempt that just failed.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let delay = self.base_delay.saturating_mul(1u32 << exponent);
        delay.min(self.max_delay)
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        let jitter_ms = self.max_jitter.as_millis() as u64;
        let jitter = if jitter_ms == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
        };
        self.backoff(attempt) + jitter
    }
}
