//! Access strategies, the escalation table, and the per-URL strategy cache.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::models::compute_hash;
use crate::traits::StrategyExecutor;

/// One method of retrieving a URL, ordered from cheapest to most browser-like.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// Plain HTTP client with a fixed user agent.
    PlainHttp,
    /// HTTP/2 client with browser-like headers.
    StealthHttp,
    /// Client that primes session cookies before requesting the target.
    ChallengeSolver,
    /// Headless Chromium with default settings.
    HeadlessChrome,
    /// Headless Chromium with automation markers hidden.
    HeadlessChromeStealth,
    /// Headless Chromium emulating a mobile device.
    HeadlessChromeMobile,
}

impl Strategy {
    /// Every strategy in escalation order.
    pub const ALL: [Strategy; 6] = [
        Strategy::PlainHttp,
        Strategy::StealthHttp,
        Strategy::ChallengeSolver,
        Strategy::HeadlessChrome,
        Strategy::HeadlessChromeStealth,
        Strategy::HeadlessChromeMobile,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::PlainHttp => "plain_http",
            Strategy::StealthHttp => "stealth_http",
            Strategy::ChallengeSolver => "challenge_solver",
            Strategy::HeadlessChrome => "headless_chrome",
            Strategy::HeadlessChromeStealth => "headless_chrome_stealth",
            Strategy::HeadlessChromeMobile => "headless_chrome_mobile",
        }
    }

    pub fn is_browser(&self) -> bool {
        matches!(
            self,
            Strategy::HeadlessChrome
                | Strategy::HeadlessChromeStealth
                | Strategy::HeadlessChromeMobile
        )
    }
}

impl std::fmt::Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A strategy paired with the code that performs it.
#[derive(Clone)]
pub struct StrategyDescriptor {
    pub strategy: Strategy,
    pub executor: Arc<dyn StrategyExecutor>,
}

impl StrategyDescriptor {
    pub fn new(strategy: Strategy, executor: Arc<dyn StrategyExecutor>) -> Self {
        Self { strategy, executor }
    }
}

impl std::fmt::Debug for StrategyDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StrategyDescriptor")
            .field("strategy", &self.strategy)
            .finish_non_exhaustive()
    }
}

/// Ordered list of available strategies.
///
/// Iteration always follows the escalation order given at construction,
/// regardless of insertion order.
#[derive(Clone, Debug, Default)]
pub struct StrategyTable {
    entries: Vec<StrategyDescriptor>,
}

impl StrategyTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an executor, replacing any previous one for the same strategy.
    pub fn with(mut self, strategy: Strategy, executor: Arc<dyn StrategyExecutor>) -> Self {
        self.entries.retain(|d| d.strategy != strategy);
        self.entries.push(StrategyDescriptor::new(strategy, executor));
        self
    }

    pub fn get(&self, strategy: Strategy) -> Option<&StrategyDescriptor> {
        self.entries.iter().find(|d| d.strategy == strategy)
    }

    /// Registered descriptors arranged by `order`, dropping strategies that
    /// are not registered.
    pub fn ordered(&self, order: &[Strategy]) -> Vec<StrategyDescriptor> {
        order
            .iter()
            .filter_map(|s| self.get(*s).cloned())
            .collect()
    }

    pub fn strategies(&self) -> Vec<Strategy> {
        let mut all: Vec<_> = self.entries.iter().map(|d| d.strategy).collect();
        all.sort();
        all
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Configuration for [`StrategyCache`].
#[derive(Debug, Clone)]
pub struct StrategyCacheConfig {
    pub ttl: Duration,
    pub max_entries: u64,
}

impl Default for StrategyCacheConfig {
    /// One hour TTL, 10 000 URLs.
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(3600),
            max_entries: 10_000,
        }
    }
}

/// Cached knowledge about a URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StrategyCacheEntry {
    pub strategy: Strategy,
    pub recorded_at: chrono::DateTime<chrono::Utc>,
}

/// URL hash → last strategy that succeeded, TTL-evicted.
///
/// Entries are advisory: they only reorder attempts, never block a fetch.
#[derive(Clone)]
pub struct StrategyCache {
    entries: moka::future::Cache<String, StrategyCacheEntry>,
}

impl StrategyCache {
    pub fn new(config: &StrategyCacheConfig) -> Self {
        Self {
            entries: moka::future::Cache::builder()
                .max_capacity(config.max_entries)
                .time_to_live(config.ttl)
                .build(),
        }
    }

    fn key(url: &str) -> String {
        compute_hash(url)
    }

    pub async fn get(&self, url: &str) -> Option<StrategyCacheEntry> {
        self.entries.get(&Self::key(url)).await
    }

    /// Record a successful strategy, replacing any stale entry.
    pub async fn record(&self, url: &str, strategy: Strategy) {
        let entry = StrategyCacheEntry {
            strategy,
            recorded_at: chrono::Utc::now(),
        };
        self.entries.insert(Self::key(url), entry).await;
    }

    pub async fn invalidate(&self, url: &str) {
        self.entries.invalidate(&Self::key(url)).await;
    }

    pub async fn len(&self) -> u64 {
        self.entries.run_pending_tasks().await;
        self.entries.entry_count()
    }
}

impl Default for StrategyCache {
    fn default() -> Self {
        Self::new(&StrategyCacheConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::MockExecutor;

    #[test]
    fn strategies_are_ordered_cheapest_first() {
        let mut shuffled = vec![
            Strategy::HeadlessChromeMobile,
            Strategy::PlainHttp,
            Strategy::ChallengeSolver,
            Strategy::StealthHttp,
        ];
        shuffled.sort();
        assert_eq!(
            shuffled,
            vec![
                Strategy::PlainHttp,
                Strategy::StealthHttp,
                Strategy::ChallengeSolver,
                Strategy::HeadlessChromeMobile,
            ]
        );
        assert!(Strategy::HeadlessChrome.is_browser());
        assert!(!Strategy::ChallengeSolver.is_browser());
    }

    #[test]
    fn strategy_serializes_snake_case() {
        let json = serde_json::to_string(&Strategy::HeadlessChromeStealth).unwrap();
        assert_eq!(json, "\"headless_chrome_stealth\"");
        assert_eq!(Strategy::StealthHttp.to_string(), "stealth_http");
    }

    #[test]
    fn table_orders_by_requested_order() {
        let table = StrategyTable::new()
            .with(Strategy::StealthHttp, Arc::new(MockExecutor::ok("a")))
            .with(Strategy::PlainHttp, Arc::new(MockExecutor::ok("b")));

        let ordered: Vec<_> = table
            .ordered(&[Strategy::PlainHttp, Strategy::ChallengeSolver, Strategy::StealthHttp])
            .into_iter()
            .map(|d| d.strategy)
            .collect();

        assert_eq!(ordered, vec![Strategy::PlainHttp, Strategy::StealthHttp]);
        assert_eq!(table.strategies(), vec![Strategy::PlainHttp, Strategy::StealthHttp]);
    }

    #[test]
    fn table_replaces_existing_strategy() {
        let table = StrategyTable::new()
            .with(Strategy::PlainHttp, Arc::new(MockExecutor::ok("a")))
            .with(Strategy::PlainHttp, Arc::new(MockExecutor::ok("b")));
        assert_eq!(table.strategies().len(), 1);
    }

    #[tokio::test]
    async fn cache_records_and_replaces() {
        let cache = StrategyCache::default();
        assert!(cache.get("https://example.com/a").await.is_none());

        cache.record("https://example.com/a", Strategy::StealthHttp).await;
        cache.record("https://example.com/a", Strategy::HeadlessChrome).await;

        let entry = cache.get("https://example.com/a").await.unwrap();
        assert_eq!(entry.strategy, Strategy::HeadlessChrome);
        assert!(cache.get("https://example.com/b").await.is_none());
        assert_eq!(cache.len().await, 1);

        cache.invalidate("https://example.com/a").await;
        assert!(cache.get("https://example.com/a").await.is_none());
    }

    #[tokio::test]
    async fn cache_entries_expire() {
        let cache = StrategyCache::new(&StrategyCacheConfig {
            ttl: Duration::from_millis(50),
            max_entries: 10,
        });
        cache.record("https://example.com", Strategy::PlainHttp).await;
        assert!(cache.get("https://example.com").await.is_some());

        // moka uses its own clock, so this needs real time to pass.
        std::thread::sleep(Duration::from_millis(120));
        assert!(cache.get("https://example.com").await.is_none());
    }
}
