//! Per-host token-bucket rate limiting.
//!
//! Each host gets a bucket holding at most `burst` tokens, refilled at
//! `rate_per_sec`. An attempt consumes one token. Acquisition either succeeds
//! immediately, waits up to a caller-supplied timeout for the next token, or
//! fails with [`AppError::RateLimitExceeded`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::Instant;

use crate::error::AppError;
use crate::util::deadline_after;

/// Refill rate and capacity for one bucket.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketConfig {
    /// Tokens added per second.
    pub rate_per_sec: f64,
    /// Maximum tokens held (and initial fill).
    pub burst: u32,
}

impl BucketConfig {
    pub fn new(rate_per_sec: f64, burst: u32) -> Self {
        Self {
            rate_per_sec: rate_per_sec.max(0.0),
            burst: burst.max(1),
        }
    }
}

impl Default for BucketConfig {
    /// 2 requests/second with a burst of 5.
    fn default() -> Self {
        Self::new(2.0, 5)
    }
}

/// Rate limits for all hosts: a default bucket plus per-host overrides.
#[derive(Debug, Clone, Default)]
pub struct RateLimitConfig {
    pub default: BucketConfig,
    pub per_host: HashMap<String, BucketConfig>,
}

impl RateLimitConfig {
    pub fn new(default: BucketConfig) -> Self {
        Self {
            default,
            per_host: HashMap::new(),
        }
    }

    /// Override the bucket for a single host.
    pub fn with_host(mut self, host: impl Into<String>, bucket: BucketConfig) -> Self {
        self.per_host.insert(host.into().to_ascii_lowercase(), bucket);
        self
    }

    pub fn for_host(&self, host: &str) -> BucketConfig {
        self.per_host.get(host).copied().unwrap_or(self.default)
    }
}

#[derive(Debug)]
struct BucketInner {
    tokens: f64,
    last_refill: Instant,
}

/// Token bucket for one host. Clones share the same bucket.
#[derive(Clone)]
pub struct TokenBucket {
    host: Arc<str>,
    config: BucketConfig,
    inner: Arc<Mutex<BucketInner>>,
}

impl TokenBucket {
    pub fn new(host: impl Into<String>, config: BucketConfig) -> Self {
        Self {
            host: Arc::from(host.into()),
            config,
            inner: Arc::new(Mutex::new(BucketInner {
                tokens: f64::from(config.burst),
                last_refill: Instant::now(),
            })),
        }
    }

    pub fn config(&self) -> BucketConfig {
        self.config
    }

    fn lock_inner(&self) -> std::sync::MutexGuard<'_, BucketInner> {
        self.inner.lock().unwrap_or_else(|poisoned| {
            tracing::warn!(host = %self.host, "Recovered from poisoned mutex");
            poisoned.into_inner()
        })
    }

    fn refill(&self, inner: &mut BucketInner) {
        let now = Instant::now();
        let elapsed = now.duration_since(inner.last_refill).as_secs_f64();
        inner.tokens =
            (inner.tokens + elapsed * self.config.rate_per_sec).min(f64::from(self.config.burst));
        inner.last_refill = now;
    }

    /// Takes a token if one is available right now; otherwise returns the
    /// time until the next token (or `None` if the bucket never refills).
    fn take_or_wait_time(&self) -> Result<(), Option<Duration>> {
        let mut inner = self.lock_inner();
        self.refill(&mut inner);

        if inner.tokens >= 1.0 {
            inner.tokens -= 1.0;
            return Ok(());
        }
        if self.config.rate_per_sec <= 0.0 {
            return Err(None);
        }
        let missing = 1.0 - inner.tokens;
        // A rate too small to express as a wait never yields a token.
        Err(Duration::try_from_secs_f64(missing / self.config.rate_per_sec).ok())
    }

    /// Non-blocking acquisition.
    pub fn try_acquire(&self) -> bool {
        self.take_or_wait_time().is_ok()
    }

    /// Waits up to `timeout` for a token.
    pub async fn acquire(&self, timeout: Duration) -> Result<(), AppError> {
        let deadline = deadline_after(timeout);

        loop {
            let wait = match self.take_or_wait_time() {
                Ok(()) => return Ok(()),
                Err(None) => return Err(AppError::RateLimitExceeded(self.host.to_string())),
                Err(Some(wait)) => wait,
            };

            if wait > deadline.saturating_duration_since(Instant::now()) {
                tracing::debug!(
                    host = %self.host,
                    wait_ms = wait.as_millis() as u64,
                    "Rate limit token not available within allowed wait"
                );
                return Err(AppError::RateLimitExceeded(self.host.to_string()));
            }

            tracing::trace!(host = %self.host, wait_ms = wait.as_millis() as u64, "Waiting for rate limit token");
            // The lock is not held while sleeping.
            tokio::time::sleep(wait).await;
        }
    }

    /// Tokens currently available (after refill).
    pub fn available(&self) -> f64 {
        let mut inner = self.lock_inner();
        self.refill(&mut inner);
        inner.tokens
    }
}
