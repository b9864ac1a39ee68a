//! The multi-strategy escalation engine.
//!
//! [`SuperCrawler`] walks an ordered strategy table for each request,
//! consulting the host's circuit breaker and token bucket before every
//! network attempt, classifying responses, retrying hard failures with
//! backoff, and escalating on soft blocks.
//!
//! # Attempt order
//!
//! If the [`StrategyCache`] remembers a strategy that last worked for the
//! URL, it goes first. The rest follow in escalation order, skipping the
//! cached one.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

use crate::block::{BlockDetector, DefaultBlockDetector, ResponseClass};
use crate::circuit_breaker::{CircuitBreakerStats, CircuitPermit};
use crate::error::AppError;
use crate::failure_log::{FailureRecord, FailureSink, TracingFailureSink};
use crate::fetch::{
    AttemptOutcome, FetchRequest, FetchResult, FetchStatus, RawResponse, StrategyAttempt,
};
use crate::host::{HostRegistry, HostState};
use crate::retry::RetryPolicy;
use crate::strategy::{Strategy, StrategyCache, StrategyDescriptor, StrategyTable};
use crate::traits::Fetcher;

/// Configuration for the crawler's escalation loop.
#[derive(Debug, Clone)]
pub struct CrawlerConfig {
    /// Strategies in the order they are tried.
    pub escalation_order: Vec<Strategy>,
    pub retry: RetryPolicy,
    /// Share of the remaining deadline a request may spend waiting for a
    /// rate-limit token.
    pub rate_limit_wait_fraction: f64,
    /// Absolute cap on a single rate-limit wait.
    pub max_rate_limit_wait: Duration,
}

impl Default for CrawlerConfig {
    fn default() -> Self {
        Self {
            escalation_order: Strategy::ALL.to_vec(),
            retry: RetryPolicy::default(),
            rate_limit_wait_fraction: 0.25,
            max_rate_limit_wait: Duration::from_secs(5),
        }
    }
}

impl CrawlerConfig {
    pub fn with_escalation_order(mut self, order: Vec<Strategy>) -> Self {
        self.escalation_order = order;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_max_rate_limit_wait(mut self, wait: Duration) -> Self {
        self.max_rate_limit_wait = wait;
        self
    }
}

/// Per-strategy counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StrategyStats {
    pub attempts: u64,
    pub successes: u64,
    pub soft_blocks: u64,
    pub failures: u64,
}

/// Snapshot of crawler health.
#[derive(Debug, Clone)]
pub struct CrawlerStats {
    pub strategies: BTreeMap<Strategy, StrategyStats>,
    pub total_attempts: u64,
    pub cached_urls: u64,
    pub circuits: Vec<CircuitBreakerStats>,
}

enum StrategyOutcome {
    Success(RawResponse),
    /// Try the next strategy.
    Escalate(AppError),
    /// End the fetch now.
    Stop(AppError),
}

/// Mutable bookkeeping for one fetch call.
struct FetchRun<'a> {
    request: &'a FetchRequest,
    started: Instant,
    deadline: Instant,
    attempts: u32,
    trace: Vec<StrategyAttempt>,
    last_body: Option<String>,
    last_status: Option<u16>,
    last_error: Option<AppError>,
    blocked: bool,
}

impl<'a> FetchRun<'a> {
    fn new(request: &'a FetchRequest) -> Self {
        let started = Instant::now();
        Self {
            request,
            started,
            deadline: started + request.timeout(),
            attempts: 0,
            trace: Vec::new(),
            last_body: None,
            last_status: None,
            last_error: None,
            blocked: false,
        }
    }

    /// Time left before the request deadline, or `None` once it has passed.
    fn remaining(&self) -> Option<Duration> {
        let left = self.deadline.saturating_duration_since(Instant::now());
        (!left.is_zero()).then_some(left)
    }

    fn push(
        &mut self,
        strategy: Strategy,
        outcome: AttemptOutcome,
        status_code: Option<u16>,
        detail: Option<String>,
        elapsed: Duration,
        body_len: usize,
    ) {
        if status_code.is_some() {
            self.last_status = status_code;
        }
        self.trace.push(StrategyAttempt {
            strategy,
            outcome,
            status_code,
            detail,
            elapsed,
            body_len,
        });
    }

    fn finish(self, status: FetchStatus, error: Option<AppError>) -> FetchResult {
        FetchResult {
            url: self.request.url().to_string(),
            status,
            strategy: None,
            status_code: self.last_status,
            body: None,
            elapsed: self.started.elapsed(),
            attempts: self.attempts,
            trace: self.trace,
            error,
        }
    }

    fn succeed(self, strategy: Strategy, response: RawResponse) -> FetchResult {
        FetchResult {
            url: self.request.url().to_string(),
            status: FetchStatus::Success,
            strategy: Some(strategy),
            status_code: Some(response.status),
            body: Some(response.body),
            elapsed: self.started.elapsed(),
            attempts: self.attempts,
            trace: self.trace,
            error: None,
        }
    }
}

/// Resilient multi-strategy fetcher.
#[derive(Clone)]
pub struct SuperCrawler {
    strategies: StrategyTable,
    config: Arc<CrawlerConfig>,
    hosts: HostRegistry,
    cache: StrategyCache,
    detector: Arc<dyn BlockDetector>,
    failure_sink: Arc<dyn FailureSink>,
    stats: Arc<Mutex<HashMap<Strategy, StrategyStats>>>,
}

impl SuperCrawler {
    pub fn new(strategies: StrategyTable, config: CrawlerConfig) -> Self {
        Self {
            strategies,
            config: Arc::new(config),
            hosts: HostRegistry::default(),
            cache: StrategyCache::default(),
            detector: Arc::new(DefaultBlockDetector::default()),
            failure_sink: Arc::new(TracingFailureSink),
            stats: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Share host state with other crawlers (or set custom limits).
    pub fn with_hosts(mut self, hosts: HostRegistry) -> Self {
        self.hosts = hosts;
        self
    }

    pub fn with_cache(mut self, cache: StrategyCache) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_block_detector(mut self, detector: Arc<dyn BlockDetector>) -> Self {
        self.detector = detector;
        self
    }

    pub fn with_failure_sink(mut self, sink: Arc<dyn FailureSink>) -> Self {
        self.failure_sink = sink;
        self
    }

    pub fn hosts(&self) -> &HostRegistry {
        &self.hosts
    }

    pub fn cache(&self) -> &StrategyCache {
        &self.cache
    }

    pub async fn stats(&self) -> CrawlerStats {
        let strategies: BTreeMap<_, _> = self
            .lock_stats()
            .iter()
            .map(|(k, v)| (*k, *v))
            .collect();
        CrawlerStats {
            total_attempts: strategies.values().map(|s| s.attempts).sum(),
            strategies,
            cached_urls: self.cache.len().await,
            circuits: self.hosts.circuit_stats(),
        }
    }

    fn lock_stats(&self) -> std::sync::MutexGuard<'_, HashMap<Strategy, StrategyStats>> {
        self.stats.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn bump(&self, strategy: Strategy, update: impl FnOnce(&mut StrategyStats)) {
        update(self.lock_stats().entry(strategy).or_default());
    }

    /// Attempt plan for a request: cached strategy first, then the rest in
    /// escalation order.
    async fn plan(&self, request: &FetchRequest) -> Vec<StrategyDescriptor> {
        let mut ordered: Vec<_> = self
            .strategies
            .ordered(&self.config.escalation_order)
            .into_iter()
            .filter(|d| request.allows(d.strategy))
            .collect();

        let cached = self.cache.get(request.url()).await.map(|e| e.strategy);
        if let Some(idx) = cached.and_then(|s| ordered.iter().position(|d| d.strategy == s))
            && idx > 0
        {
            let preferred = ordered.remove(idx);
            tracing::debug!(url = %request.url(), strategy = %preferred.strategy, "Trying cached strategy first");
            ordered.insert(0, preferred);
        }
        ordered
    }

    fn settle_failed(permit: CircuitPermit, error: &AppError) {
        // Only the half-open probe reports per attempt; closed-state failures
        // are counted once per fetch.
        if permit.is_probe() {
            permit.failure(error);
        } else {
            permit.release();
        }
    }

    async fn run_strategy(
        &self,
        run: &mut FetchRun<'_>,
        host: &HostState,
        descriptor: &StrategyDescriptor,
    ) -> StrategyOutcome {
        let strategy = descriptor.strategy;
        let cancel = run.request.cancel_token().clone();
        let max_retries = run
            .request
            .retry_budget()
            .unwrap_or(self.config.retry.max_retries);
        let mut retries = 0u32;

        loop {
            if cancel.is_cancelled() {
                return StrategyOutcome::Stop(AppError::Cancelled);
            }
            let Some(remaining) = run.remaining() else {
                return StrategyOutcome::Stop(AppError::Timeout(run.request.timeout()));
            };

            let permit = match host.circuit.try_acquire() {
                Ok(permit) => permit,
                Err(err) => {
                    run.push(
                        strategy,
                        AttemptOutcome::CircuitOpen,
                        None,
                        Some(err.to_string()),
                        Duration::ZERO,
                        0,
                    );
                    return StrategyOutcome::Stop(err);
                }
            };

            let max_wait = remaining
                .mul_f64(self.config.rate_limit_wait_fraction)
                .min(self.config.max_rate_limit_wait);
            let acquired = tokio::select! {
                biased;
                () = cancel.cancelled() => Err(AppError::Cancelled),
                r = host.bucket.acquire(max_wait) => r,
            };
            if let Err(err) = acquired {
                permit.release();
                if !matches!(err, AppError::Cancelled) {
                    run.push(
                        strategy,
                        AttemptOutcome::RateLimited,
                        None,
                        Some(err.to_string()),
                        Duration::ZERO,
                        0,
                    );
                }
                return StrategyOutcome::Stop(err);
            }

            let Some(remaining) = run.remaining() else {
                permit.release();
                return StrategyOutcome::Stop(AppError::Timeout(run.request.timeout()));
            };

            run.attempts += 1;
            self.bump(strategy, |s| s.attempts += 1);
            tracing::debug!(
                url = %run.request.url(),
                %strategy,
                attempt = run.attempts,
                probe = permit.is_probe(),
                "Attempting fetch"
            );

            let attempt_started = Instant::now();
            let result = tokio::select! {
                biased;
                () = cancel.cancelled() => None,
                r = tokio::time::timeout(
                    remaining,
                    descriptor.executor.execute(run.request.url(), remaining),
                ) => Some(r),
            };
            let elapsed = attempt_started.elapsed();

            let failure = match result {
                None => {
                    permit.release();
                    run.push(strategy, AttemptOutcome::Cancelled, None, None, elapsed, 0);
                    tracing::debug!(url = %run.request.url(), %strategy, "Fetch cancelled mid-attempt");
                    return StrategyOutcome::Stop(AppError::Cancelled);
                }
                Some(Err(_)) => {
                    let err = AppError::Timeout(run.request.timeout());
                    run.push(
                        strategy,
                        AttemptOutcome::HardFailure,
                        None,
                        Some("request deadline reached".into()),
                        elapsed,
                        0,
                    );
                    self.bump(strategy, |s| s.failures += 1);
                    Self::settle_failed(permit, &err);
                    return StrategyOutcome::Stop(err);
                }
                Some(Ok(Err(err))) => {
                    run.push(
                        strategy,
                        AttemptOutcome::HardFailure,
                        None,
                        Some(err.to_string()),
                        elapsed,
                        0,
                    );
                    err
                }
                Some(Ok(Ok(response))) => {
                    let status = response.status;
                    let body_len = response.body.len();
                    match self.detector.classify(status, &response.body) {
                        ResponseClass::Success => {
                            run.push(
                                strategy,
                                AttemptOutcome::Success,
                                Some(status),
                                None,
                                elapsed,
                                body_len,
                            );
                            permit.success();
                            self.bump(strategy, |s| s.successes += 1);
                            return StrategyOutcome::Success(response);
                        }
                        ResponseClass::Rejected => {
                            run.push(
                                strategy,
                                AttemptOutcome::Rejected,
                                Some(status),
                                None,
                                elapsed,
                                body_len,
                            );
                            // The host answered; it is healthy.
                            permit.success();
                            return StrategyOutcome::Stop(AppError::HttpError(format!(
                                "HTTP {status} for {}",
                                run.request.url()
                            )));
                        }
                        ResponseClass::SoftBlock { reason } => {
                            tracing::info!(
                                url = %run.request.url(),
                                %strategy,
                                status,
                                %reason,
                                "Soft block detected, escalating"
                            );
                            run.push(
                                strategy,
                                AttemptOutcome::SoftBlock,
                                Some(status),
                                Some(reason),
                                elapsed,
                                body_len,
                            );
                            run.blocked = true;
                            run.last_body = Some(response.body);
                            self.bump(strategy, |s| s.soft_blocks += 1);
                            let err = AppError::Blocked {
                                strategy,
                                status: Some(status),
                            };
                            Self::settle_failed(permit, &err);
                            return StrategyOutcome::Escalate(err);
                        }
                        ResponseClass::HardFailure { reason } => {
                            run.push(
                                strategy,
                                AttemptOutcome::HardFailure,
                                Some(status),
                                Some(reason.clone()),
                                elapsed,
                                body_len,
                            );
                            run.last_body = Some(response.body);
                            AppError::NetworkError(format!("{reason} from {}", run.request.host()))
                        }
                    }
                }
            };

            self.bump(strategy, |s| s.failures += 1);
            Self::settle_failed(permit, &failure);

            if failure.is_retryable() && retries < max_retries {
                retries += 1;
                let delay = self.config.retry.delay_for_retry(retries);
                if run.remaining().is_some_and(|left| left > delay) {
                    tracing::debug!(
                        url = %run.request.url(),
                        %strategy,
                        retry = retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %failure,
                        "Retrying after hard failure"
                    );
                    tokio::select! {
                        biased;
                        () = cancel.cancelled() => return StrategyOutcome::Stop(AppError::Cancelled),
                        () = tokio::time::sleep(delay) => {}
                    }
                    continue;
                }
            }

            return StrategyOutcome::Escalate(failure);
        }
    }

    /// Every strategy failed: count one failure against the host if the
    /// last error implicates it, and emit a failure record.
    fn exhausted(&self, mut run: FetchRun<'_>, host: &HostState) -> FetchResult {
        let error = run
            .last_error
            .take()
            .unwrap_or_else(|| AppError::Generic("all strategies exhausted".into()));
        Self::charge_host(host, &error);

        let status = if run.blocked {
            FetchStatus::Blocked
        } else {
            FetchStatus::Error
        };
        tracing::warn!(
            url = %run.request.url(),
            attempts = run.attempts,
            ?status,
            error = %error,
            "All strategies exhausted"
        );
        self.emit_failure(&run, &error);
        run.finish(status, Some(error))
    }

    fn stop(&self, run: FetchRun<'_>, host: &HostState, error: AppError) -> FetchResult {
        match error {
            // A failed half-open probe reopened the circuit mid-fetch.
            AppError::CircuitOpen { .. } if run.last_error.is_some() => self.exhausted(run, host),
            AppError::Timeout(_) => {
                Self::charge_host(host, &error);
                tracing::warn!(url = %run.request.url(), attempts = run.attempts, "Fetch timed out");
                self.emit_failure(&run, &error);
                run.finish(FetchStatus::Error, Some(error))
            }
            AppError::CircuitOpen { .. } => {
                tracing::info!(url = %run.request.url(), error = %error, "Failing fast, circuit open");
                run.finish(FetchStatus::Error, Some(error))
            }
            _ => {
                tracing::debug!(url = %run.request.url(), error = %error, "Fetch stopped");
                run.finish(FetchStatus::Error, Some(error))
            }
        }
    }

    fn charge_host(host: &HostState, error: &AppError) {
        if error.should_trip_circuit() {
            host.circuit.record_failure(error);
        }
    }

    fn emit_failure(&self, run: &FetchRun<'_>, error: &AppError) {
        self.failure_sink.record(FailureRecord::new(
            run.request.url(),
            run.request.host(),
            run.trace.clone(),
            run.last_body.as_deref(),
            &error.to_string(),
        ));
    }
}

impl Fetcher for SuperCrawler {
    async fn fetch(&self, request: &FetchRequest) -> FetchResult {
        let mut run = FetchRun::new(request);
        let host = self.hosts.get(request.host());
        let plan = self.plan(request).await;

        if plan.is_empty() {
            return run.finish(
                FetchStatus::Error,
                Some(AppError::ConfigError(format!(
                    "no strategies available for {}",
                    request.url()
                ))),
            );
        }

        for descriptor in &plan {
            match self.run_strategy(&mut run, &host, descriptor).await {
                StrategyOutcome::Success(response) => {
                    self.cache.record(request.url(), descriptor.strategy).await;
                    tracing::info!(
                        url = %request.url(),
                        strategy = %descriptor.strategy,
                        attempts = run.attempts,
                        "Fetch succeeded"
                    );
                    return run.succeed(descriptor.strategy, response);
                }
                StrategyOutcome::Escalate(err) => {
                    run.last_error = Some(err);
                }
                StrategyOutcome::Stop(err) => return self.stop(run, &host, err),
            }
        }

        self.exhausted(run, &host)
    }
}
