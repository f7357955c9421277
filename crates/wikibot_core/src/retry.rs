use std::time::Duration;

use rand::Rng;

pub const DEFAULT_MAX_ATTEMPTS: usize = 6;

/// Bounded exponential backoff: `min(base * 2^attempt, max) + jitter`.
///
/// Immutable once built; one policy is shared by every call a client makes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            max_jitter: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    /// A policy that retries `max_attempts` times without ever sleeping.
    pub fn immediate(max_attempts: usize) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            max_jitter: Duration::ZERO,
        }
    }

    /// Exactly one attempt.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    pub fn attempts(&self) -> usize {
        self.max_attempts.max(1)
    }

    /// Deterministic part of the delay after the (1-based) `attempt` failed.
    pub fn backoff(&self, attempt: usize) -> Duration {
        let exponent = u32::try_from(attempt).unwrap_or(u32::MAX).min(20);
        let scaled = self.base_delay.saturating_mul(2u32.saturating_pow(exponent));
        scaled.min(self.max_delay)
    }

    /// Full delay including random jitter.
    pub fn delay(&self, attempt: usize) -> Duration {
        let backoff = self.backoff(attempt);
        let jitter_ms = u64::try_from(self.max_jitter.as_millis()).unwrap_or(u64::MAX);
        if jitter_ms == 0 {
            return backoff;
        }
        let jitter = rand::rng().random_range(0..=jitter_ms);
        backoff.saturating_add(Duration::from_millis(jitter))
    }
}
