//! Exponential backoff with jitter for transient failures.

use std::time::Duration;

use crate::util::rand_jitter_ms;

/// Local retry policy for hard failures (connection errors, timeouts).
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the first attempt, per strategy.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
    /// Maximum random jitter added to each delay (uniform [0, jitter]).
    pub jitter: Duration,
}

impl Default for RetryPolicy {
    /// 2 retries, 500ms base doubling up to 10s, 250ms jitter.
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(500),
            multiplier: 2.0,
            max_delay: Duration::from_secs(10),
            jitter: Duration::from_millis(250),
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    pub fn with_max_retries(mut self, max: u32) -> Self {
        self.max_retries = max;
        self
    }

    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    /// Delay before retry number `retry` (1-indexed), capped at `max_delay`.
    ///
    /// - Retry 1: base
    /// - Retry 2: base × multiplier
    /// - Retry n: base × multiplier^(n-1)
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(32) as i32;
        let scaled = self.base_delay.as_secs_f64() * self.multiplier.max(1.0).powi(exponent);
        let base = Duration::from_secs_f64(scaled.min(self.max_delay.as_secs_f64()));
        let jitter = Duration::from_millis(rand_jitter_ms(self.jitter.as_millis() as u64));
        std::cmp::min(base + jitter, self.max_delay)
    }
}
