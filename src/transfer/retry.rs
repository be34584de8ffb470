//! Optimistic-concurrency retry policy

use std::time::Duration;

use rand::Rng;

/// Bounded retry with jittered exponential backoff
///
/// Attempt `n` (1-based) that lost a version race sleeps
/// `min(base * 2^(n-1), max)` plus up to 50% jitter, capped at `max`, before
/// attempt `n + 1`. Jitter keeps two transfers contending for the same rows
/// from retrying in lockstep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total compare-and-swap attempts, including the first
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 8,
            base_delay: Duration::from_millis(2),
            max_delay: Duration::from_millis(100),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay: max_delay.max(base_delay),
        }
    }

    /// Sleep before the attempt following `attempt`
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        let backoff = self
            .base_delay
            .checked_mul(1u32 << exp)
            .unwrap_or(self.max_delay)
            .min(self.max_delay);

        let half = backoff.as_micros() as u64 / 2;
        let jitter = if half == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=half)
        };
        (backoff + Duration::from_micros(jitter)).min(self.max_delay)
    }

    /// Sum of the longest possible sleeps over a full run of attempts
    pub fn worst_case(&self) -> Duration {
        (1..self.max_attempts)
            .map(|attempt| {
                self.base_delay
                    .checked_mul(1u32 << attempt.saturating_sub(1).min(31))
                    .unwrap_or(self.max_delay)
                    .min(self.max_delay)
            })
            .fold(Duration::ZERO, |acc, d| acc.saturating_add(d))
    }
}
