use std::time::Duration;

use crate::circuit_breaker::CircuitBreakerConfig;
use crate::crawler::CrawlerConfig;
use crate::error::AppError;
use crate::extraction::AiBudget;
use crate::host::HostRegistry;
use crate::orchestrator::OrchestratorConfig;
use crate::rate_limiter::RateLimitConfig;
use crate::strategy::{StrategyCache, StrategyCacheConfig};

/// Every tunable of the engine in one place.
#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    pub circuit: CircuitBreakerConfig,
    pub rate_limit: RateLimitConfig,
    pub cache: StrategyCacheConfig,
    pub crawler: CrawlerConfig,
    pub ai_budget: AiBudget,
    pub orchestrator: OrchestratorConfig,
}

impl EngineConfig {
    /// Defaults overridden by environment variables.
    ///
    /// - `ARGOS_SESSION_DEADLINE_SECS` (default 120)
    /// - `ARGOS_ADAPTER_TIMEOUT_SECS` (default 60)
    /// - `ARGOS_MAX_CONCURRENCY` (default 4)
    /// - `ARGOS_MAX_EXPANSIONS` (default 25)
    /// - `ARGOS_AI_BUDGET_USD` (default 0.10)
    /// - `ARGOS_CIRCUIT_FAILURE_THRESHOLD` (default 5)
    pub fn from_env() -> Result<Self, AppError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, AppError> {
        let mut config = Self::default();

        if let Some(secs) = parse_var::<u64>(&lookup, "ARGOS_SESSION_DEADLINE_SECS")? {
            config.orchestrator.session_deadline = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_var::<u64>(&lookup, "ARGOS_ADAPTER_TIMEOUT_SECS")? {
            config.orchestrator.adapter_timeout = Duration::from_secs(secs);
        }
        if let Some(n) = parse_var::<usize>(&lookup, "ARGOS_MAX_CONCURRENCY")? {
            config.orchestrator.max_concurrency = n;
        }
        if let Some(n) = parse_var::<usize>(&lookup, "ARGOS_MAX_EXPANSIONS")? {
            config.orchestrator.max_expansions = n;
        }
        if let Some(usd) = parse_var::<f64>(&lookup, "ARGOS_AI_BUDGET_USD")? {
            config.ai_budget.max_cost_usd = usd;
        }
        if let Some(n) = parse_var::<u32>(&lookup, "ARGOS_CIRCUIT_FAILURE_THRESHOLD")? {
            config.circuit.failure_threshold = n;
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> Result<(), AppError> {
        let invalid = |msg: &str| Err(AppError::ConfigError(msg.to_string()));

        if self.circuit.failure_threshold == 0 {
            return invalid("circuit failure threshold must be at least 1");
        }
        if self.orchestrator.max_concurrency == 0 {
            return invalid("max concurrency must be at least 1");
        }
        if self.orchestrator.session_deadline.is_zero() {
            return invalid("session deadline must be positive");
        }
        if self.orchestrator.adapter_timeout.is_zero() {
            return invalid("adapter timeout must be positive");
        }
        let longest = [
            self.orchestrator.session_deadline,
            self.orchestrator.adapter_timeout,
            self.orchestrator.resolver_timeout,
        ];
        if longest.iter().any(|d| *d > MAX_TIMEOUT) {
            return invalid("session deadline and timeouts must not exceed 24 hours");
        }
        if self.ai_budget.max_cost_usd.is_nan() || self.ai_budget.max_cost_usd < 0.0 {
            return invalid("AI budget must be a non-negative amount");
        }
        let fraction = self.crawler.rate_limit_wait_fraction;
        if !(fraction > 0.0 && fraction <= 1.0) {
            return invalid("rate-limit wait fraction must be in (0, 1]");
        }
        if self.crawler.escalation_order.is_empty() {
            return invalid("escalation order must name at least one strategy");
        }
        let mut order = self.crawler.escalation_order.clone();
        order.sort();
        order.dedup();
        if order.len() != self.crawler.escalation_order.len() {
            return invalid("escalation order lists a strategy twice");
        }
        if self.orchestrator.weights.total() == 0 {
            return invalid("field weights must not all be zero");
        }
        Ok(())
    }

    /// Host registry with this config's breaker and bucket settings.
    pub fn host_registry(&self) -> HostRegistry {
        HostRegistry::new(self.circuit.clone(), self.rate_limit.clone())
    }

    pub fn strategy_cache(&self) -> StrategyCache {
        StrategyCache::new(&self.cache)
    }
}

/// Upper bound for the session deadline and per-call timeouts.
const MAX_TIMEOUT: Duration = Duration::from_secs(24 * 60 * 60);

fn parse_var<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<T>, AppError> {
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| AppError::ConfigError(format!("Invalid {key} '{raw}'"))),
    }
}
