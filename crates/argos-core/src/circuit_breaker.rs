//! Per-host circuit breaker.
//!
//! Stops sending traffic to a host that keeps failing until a cooldown has
//! passed, then lets exactly one probe through to test recovery.
//!
//! # Circuit States
//!
//! ```text
//! CLOSED --[N failures within window]--> OPEN --[cooldown]--> HALF_OPEN (one probe)
//!                                          ^                      |
//!                                          +------[failure]-------+
//!                                                                 |
//! CLOSED <------------------------[success]-----------------------+
//! ```
//!
//! Callers obtain a [`CircuitPermit`] before each attempt and settle it with
//! the outcome. A permit dropped without being settled (the attempt was
//! cancelled) releases the half-open probe slot without counting as a
//! failure.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::Instant;

use crate::error::AppError;

/// Current state of the circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Requests flow normally.
    Closed,
    /// Requests are rejected without I/O.
    Open,
    /// One probe request is allowed to test recovery.
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Configuration for circuit breaker behavior.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Failures within `failure_window` that open the circuit.
    pub failure_threshold: u32,

    /// Sliding window over which failures are counted.
    pub failure_window: Duration,

    /// Time to wait before transitioning from Open to Half-Open.
    pub cooldown: Duration,

    /// Cooldown growth factor applied when a half-open probe fails.
    pub cooldown_multiplier: f32,

    /// Extra growth factor when the opening error was a rate limit (429).
    pub rate_limit_backoff_multiplier: f32,

    /// Upper bound on the cooldown after repeated growth.
    pub max_cooldown: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            failure_window: Duration::from_secs(60),
            cooldown: Duration::from_secs(30),
            cooldown_multiplier: 2.0,
            rate_limit_backoff_multiplier: 2.0,
            max_cooldown: Duration::from_secs(300),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold.max(1);
        self
    }

    pub fn with_failure_window(mut self, window: Duration) -> Self {
        self.failure_window = window;
        self
    }

    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }

    pub fn with_max_cooldown(mut self, max: Duration) -> Self {
        self.max_cooldown = max;
        self
    }

    fn grow(&self, current: Duration, factor: f32) -> Duration {
        std::cmp::min(
            Duration::from_secs_f32(current.as_secs_f32() * factor.max(1.0)),
            self.max_cooldown,
        )
    }
}

#[derive(Debug)]
struct CircuitBreakerInner {
    state: CircuitState,
    failures: VecDeque<Instant>,
    opened_at: Option<Instant>,
    current_cooldown: Duration,
    probe_in_flight: bool,
    last_error_message: Option<String>,
}

impl CircuitBreakerInner {
    fn new(config: &CircuitBreakerConfig) -> Self {
        Self {
            state: CircuitState::Closed,
            failures: VecDeque::new(),
            opened_at: None,
            current_cooldown: config.cooldown,
            probe_in_flight: false,
            last_error_message: None,
        }
    }

    fn remaining_cooldown(&self) -> Duration {
        self.opened_at
            .map(|t| self.current_cooldown.saturating_sub(t.elapsed()))
            .unwrap_or(self.current_cooldown)
    }
}

/// Snapshot of breaker state for monitoring.
#[derive(Debug, Clone)]
pub struct CircuitBreakerStats {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub last_error: Option<String>,
    pub time_until_half_open: Option<Duration>,
    pub current_cooldown: Duration,
    pub probe_in_flight: bool,
}

/// Thread-safe circuit breaker for one host.
#[derive(Clone)]
pub struct CircuitBreaker {
    name: Arc<str>,
    config: CircuitBreakerConfig,
    inner: Arc<Mutex<CircuitBreakerInner>>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        let inner = CircuitBreakerInner::new(&config);
        Self {
            name: Arc::from(name.into()),
            config,
            inner: Arc::new(Mutex::new(inner)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Acquires the inner mutex lock, recovering from poison if necessary.
    fn lock_inner(&self) -> std::sync::MutexGuard<'_, CircuitBreakerInner> {
        self.inner.lock().unwrap_or_else(|poisoned| {
            tracing::warn!(circuit = %self.name, "Recovered from poisoned mutex");
            poisoned.into_inner()
        })
    }

    /// Returns the current state, handling lazy Open → HalfOpen transitions.
    pub fn state(&self) -> CircuitState {
        let mut inner = self.lock_inner();
        self.maybe_transition_to_half_open(&mut inner);
        inner.state
    }

    pub fn stats(&self) -> CircuitBreakerStats {
        let mut inner = self.lock_inner();
        self.maybe_transition_to_half_open(&mut inner);
        self.prune_window(&mut inner);

        let time_until_half_open =
            (inner.state == CircuitState::Open).then(|| inner.remaining_cooldown());

        CircuitBreakerStats {
            name: self.name.to_string(),
            state: inner.state,
            failure_count: inner.failures.len() as u32,
            last_error: inner.last_error_message.clone(),
            time_until_half_open,
            current_cooldown: inner.current_cooldown,
            probe_in_flight: inner.probe_in_flight,
        }
    }

    /// Asks the breaker for permission to make one attempt.
    ///
    /// - Closed: always granted
    /// - Open: `AppError::CircuitOpen` with the remaining cooldown
    /// - HalfOpen: granted to exactly one caller until that probe settles
    pub fn try_acquire(&self) -> Result<CircuitPermit, AppError> {
        let mut inner = self.lock_inner();
        self.maybe_transition_to_half_open(&mut inner);

        match inner.state {
            CircuitState::Closed => Ok(CircuitPermit::new(self.clone(), false)),
            CircuitState::Open => Err(AppError::CircuitOpen {
                host: self.name.to_string(),
                retry_after: inner.remaining_cooldown(),
            }),
            CircuitState::HalfOpen if inner.probe_in_flight => Err(AppError::CircuitOpen {
                host: self.name.to_string(),
                retry_after: Duration::ZERO,
            }),
            CircuitState::HalfOpen => {
                inner.probe_in_flight = true;
                tracing::debug!(circuit = %self.name, "Half-open probe granted");
                Ok(CircuitPermit::new(self.clone(), true))
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.lock_inner();

        match inner.state {
            CircuitState::HalfOpen => {
                tracing::info!(circuit = %self.name, "Circuit breaker closing after successful probe");
                inner.state = CircuitState::Closed;
                inner.failures.clear();
                inner.opened_at = None;
                inner.probe_in_flight = false;
                inner.last_error_message = None;
                inner.current_cooldown = self.config.cooldown;
            }
            CircuitState::Closed => {
                inner.failures.clear();
            }
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&self, error: &AppError) {
        let mut inner = self.lock_inner();
        let now = Instant::now();
        inner.last_error_message = Some(error.to_string());

        match inner.state {
            CircuitState::Closed => {
                inner.failures.push_back(now);
                self.prune_window(&mut inner);

                if inner.failures.len() as u32 >= self.config.failure_threshold {
                    if error.is_rate_limit() {
                        inner.current_cooldown = self
                            .config
                            .grow(inner.current_cooldown, self.config.rate_limit_backoff_multiplier);
                    }
                    tracing::warn!(
                        circuit = %self.name,
                        failures = inner.failures.len(),
                        cooldown_secs = inner.current_cooldown.as_secs_f32(),
                        error = %error,
                        "Circuit breaker opening"
                    );
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(now);
                }
            }
            CircuitState::HalfOpen => {
                let mut factor = self.config.cooldown_multiplier;
                if error.is_rate_limit() {
                    factor *= self.config.rate_limit_backoff_multiplier;
                }
                inner.current_cooldown = self.config.grow(inner.current_cooldown, factor);
                tracing::warn!(
                    circuit = %self.name,
                    cooldown_secs = inner.current_cooldown.as_secs_f32(),
                    error = %error,
                    "Circuit breaker probe failed, returning to open state"
                );
                inner.state = CircuitState::Open;
                inner.opened_at = Some(now);
                inner.probe_in_flight = false;
            }
            CircuitState::Open => {}
        }
    }

    pub fn reset(&self) {
        let mut inner = self.lock_inner();
        tracing::info!(circuit = %self.name, "Circuit breaker manually reset");
        *inner = CircuitBreakerInner::new(&self.config);
    }

    fn release_probe(&self) {
        let mut inner = self.lock_inner();
        if inner.probe_in_flight {
            tracing::debug!(circuit = %self.name, "Half-open probe released without outcome");
            inner.probe_in_flight = false;
        }
    }

    fn prune_window(&self, inner: &mut CircuitBreakerInner) {
        let window = self.config.failure_window;
        while let Some(oldest) = inner.failures.front() {
            if oldest.elapsed() > window {
                inner.failures.pop_front();
            } else {
                break;
            }
        }
    }

    fn maybe_transition_to_half_open(&self, inner: &mut CircuitBreakerInner) {
        if inner.state == CircuitState::Open
            && let Some(opened_at) = inner.opened_at
            && opened_at.elapsed() >= inner.current_cooldown
        {
            tracing::info!(
                circuit = %self.name,
                "Circuit breaker transitioning to half-open state"
            );
            inner.state = CircuitState::HalfOpen;
            inner.probe_in_flight = false;
        }
    }
}

/// Permission to make one attempt against a host.
///
/// Settle with [`success`](Self::success), [`failure`](Self::failure) or
/// [`release`](Self::release). Dropping an unsettled probe permit frees the
/// half-open slot.
#[must_use = "a permit should be settled with the attempt outcome"]
pub struct CircuitPermit {
    breaker: CircuitBreaker,
    is_probe: bool,
    settled: bool,
}

impl CircuitPermit {
    fn new(breaker: CircuitBreaker, is_probe: bool) -> Self {
        Self {
            breaker,
            is_probe,
            settled: false,
        }
    }

    /// True when this permit is the single half-open probe.
    pub fn is_probe(&self) -> bool {
        self.is_probe
    }

    pub fn success(mut self) {
        self.settled = true;
        self.breaker.record_success();
    }

    pub fn failure(mut self, error: &AppError) {
        self.settled = true;
        self.breaker.record_failure(error);
    }

    /// Settles without affecting failure counts.
    pub fn release(mut self) {
        self.settled = true;
        if self.is_probe {
            self.breaker.release_probe();
        }
    }
}

impl Drop for CircuitPermit {
    fn drop(&mut self) {
        if !self.settled && self.is_probe {
            self.breaker.release_probe();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn net_err() -> AppError {
        AppError::NetworkError("test".into())
    }

    #[test]
    fn test_circuit_starts_closed() {
        let cb = CircuitBreaker::new("example.com", CircuitBreakerConfig::default());
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.try_acquire().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_circuit_opens_after_threshold_failures() {
        let config = CircuitBreakerConfig::default().with_failure_threshold(3);
        let cb = CircuitBreaker::new("example.com", config);

        for _ in 0..3 {
            cb.record_failure(&net_err());
        }

        assert_eq!(cb.state(), CircuitState::Open);
        let err = cb.try_acquire().err().unwrap();
        assert!(matches!(err, AppError::CircuitOpen { ref host, .. } if host == "example.com"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_outside_window_are_forgotten() {
        let config = CircuitBreakerConfig::default()
            .with_failure_threshold(3)
            .with_failure_window(Duration::from_secs(10));
        let cb = CircuitBreaker::new("example.com", config);

        cb.record_failure(&net_err());
        cb.record_failure(&net_err());
        tokio::time::advance(Duration::from_secs(11)).await;
        cb.record_failure(&net_err());

        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.stats().failure_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_failure_count() {
        let config = CircuitBreakerConfig::default().with_failure_threshold(5);
        let cb = CircuitBreaker::new("example.com", config);

        for _ in 0..4 {
            cb.record_failure(&net_err());
        }
        cb.record_success();
        for _ in 0..4 {
            cb.record_failure(&net_err());
        }

        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_circuit_transitions_to_half_open() {
        let config = CircuitBreakerConfig::default()
            .with_failure_threshold(1)
            .with_cooldown(Duration::from_secs(5));
        let cb = CircuitBreaker::new("example.com", config);

        cb.record_failure(&net_err());
        assert_eq!(cb.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(cb.state(), CircuitState::HalfOpen);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_allows_exactly_one_probe() {
        let config = CircuitBreakerConfig::default()
            .with_failure_threshold(1)
            .with_cooldown(Duration::from_secs(1));
        let cb = CircuitBreaker::new("example.com", config);

        cb.record_failure(&net_err());
        tokio::time::advance(Duration::from_secs(2)).await;

        let probe = cb.try_acquire().unwrap();
        assert!(probe.is_probe());
        assert!(matches!(
            cb.try_acquire(),
            Err(AppError::CircuitOpen { .. })
        ));

        probe.success();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(!cb.try_acquire().unwrap().is_probe());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_probe_reopens_with_longer_cooldown() {
        let config = CircuitBreakerConfig::default()
            .with_failure_threshold(1)
            .with_cooldown(Duration::from_secs(10))
            .with_max_cooldown(Duration::from_secs(15));
        let cb = CircuitBreaker::new("example.com", config);

        cb.record_failure(&net_err());
        tokio::time::advance(Duration::from_secs(11)).await;

        let probe = cb.try_acquire().unwrap();
        probe.failure(&net_err());

        let stats = cb.stats();
        assert_eq!(stats.state, CircuitState::Open);
        assert_eq!(stats.current_cooldown, Duration::from_secs(15));
        assert!(!stats.probe_in_flight);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_probe_frees_slot() {
        let config = CircuitBreakerConfig::default()
            .with_failure_threshold(1)
            .with_cooldown(Duration::from_secs(1));
        let cb = CircuitBreaker::new("example.com", config);

        cb.record_failure(&net_err());
        tokio::time::advance(Duration::from_secs(2)).await;

        {
            let _probe = cb.try_acquire().unwrap();
        }

        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert!(cb.try_acquire().unwrap().is_probe());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_extends_cooldown() {
        let config = CircuitBreakerConfig::default()
            .with_failure_threshold(1)
            .with_cooldown(Duration::from_secs(30));
        let cb = CircuitBreaker::new("example.com", config);

        cb.record_failure(&AppError::RateLimitExceeded("example.com".into()));

        let stats = cb.stats();
        assert_eq!(stats.state, CircuitState::Open);
        assert!(stats.time_until_half_open.unwrap() > Duration::from_secs(55));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_backoff_capped_at_max() {
        let config = CircuitBreakerConfig::default()
            .with_failure_threshold(1)
            .with_cooldown(Duration::from_secs(200))
            .with_max_cooldown(Duration::from_secs(300));
        let cb = CircuitBreaker::new("example.com", config);

        cb.record_failure(&AppError::RateLimitExceeded("example.com".into()));

        assert!(cb.stats().time_until_half_open.unwrap() <= Duration::from_secs(300));
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_reset() {
        let config = CircuitBreakerConfig::default().with_failure_threshold(1);
        let cb = CircuitBreaker::new("example.com", config);

        cb.record_failure(&net_err());
        assert_eq!(cb.state(), CircuitState::Open);

        cb.reset();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.stats().failure_count, 0);
    }
}
