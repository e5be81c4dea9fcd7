//! Retry policy: decides backoff delays for transient submission failures.

use std::time::Duration;

use rand::Rng;

use crate::config::defaults;

/// Retry policy for scheduler submissions.
///
/// Only transient failures are retried. Local validation errors and stage
/// failures never reach this policy.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Base delay for the first retry.
    pub base_delay: Duration,

    /// Backoff multiplier for exponential backoff.
    pub multiplier: f64,

    /// Total attempts, the first one included.
    pub max_attempts: u32,

    /// Upper bound of the random extra delay, as a fraction of the delay.
    pub jitter: f64,
}

impl RetryPolicy {
    /// 5 attempts, 2s base, doubling, up to 10% jitter.
    pub fn default_v1() -> Self {
        Self {
            base_delay: Duration::from_secs(defaults::BACKOFF_BASE_SECS),
            multiplier: 2.0,
            max_attempts: defaults::MAX_SUBMIT_ATTEMPTS,
            jitter: 0.1,
        }
    }

    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            ..Self::default_v1()
        }
    }

    /// No waiting between attempts.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            jitter: 0.0,
            ..Self::new(max_attempts, Duration::ZERO)
        }
    }

    /// Delay before the next attempt, without jitter.
    ///
    /// `attempts` is the number of attempts already made (1-indexed):
    /// delay = base_delay * multiplier^(attempts - 1).
    ///
    /// With base_delay=2s, multiplier=2.0: 2s, 4s, 8s, 16s.
    pub fn next_delay(&self, attempts: u32) -> Duration {
        let base_secs = self.base_delay.as_secs_f64();
        let delay_secs = base_secs * self.multiplier.powi(attempts.saturating_sub(1) as i32);
        Duration::from_secs_f64(delay_secs)
    }

    /// `next_delay` plus a random share of at most `jitter` of it, so that
    /// many subjects hitting an unreachable controller do not retry in step.
    pub fn jittered_delay(&self, attempts: u32) -> Duration {
        let delay = self.next_delay(attempts);
        if self.jitter <= 0.0 || delay.is_zero() {
            return delay;
        }
        let extra = rand::thread_rng().gen_range(0.0..=self.jitter);
        delay.mul_f64(1.0 + extra)
    }

    pub fn should_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::default_v1()
    }
}
