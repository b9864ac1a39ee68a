//! Registry of per-host resilience state.
//!
//! A host's circuit breaker and token bucket are the only state shared by
//! concurrent fetches. The registry hands out one [`HostState`] per host and
//! every clone of it points at the same breaker and bucket.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use url::Url;

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStats};
use crate::rate_limiter::{RateLimitConfig, TokenBucket};

/// Circuit and bucket for one host.
#[derive(Clone)]
pub struct HostState {
    pub host: String,
    pub circuit: CircuitBreaker,
    pub bucket: TokenBucket,
}

/// Concurrency-safe map of host → [`HostState`].
#[derive(Clone)]
pub struct HostRegistry {
    circuit_config: CircuitBreakerConfig,
    rate_config: RateLimitConfig,
    hosts: Arc<Mutex<HashMap<String, HostState>>>,
}

impl HostRegistry {
    pub fn new(circuit_config: CircuitBreakerConfig, rate_config: RateLimitConfig) -> Self {
        Self {
            circuit_config,
            rate_config,
            hosts: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn lock_hosts(&self) -> std::sync::MutexGuard<'_, HashMap<String, HostState>> {
        self.hosts.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("Recovered from poisoned host registry mutex");
            poisoned.into_inner()
        })
    }

    /// Returns the shared state for `host`, creating it on first use.
    pub fn get(&self, host: &str) -> HostState {
        let key = host.to_ascii_lowercase();
        let mut hosts = self.lock_hosts();
        hosts
            .entry(key.clone())
            .or_insert_with(|| {
                tracing::debug!(host = %key, "Registering host state");
                HostState {
                    host: key.clone(),
                    circuit: CircuitBreaker::new(key.clone(), self.circuit_config.clone()),
                    bucket: TokenBucket::new(key.clone(), self.rate_config.for_host(&key)),
                }
            })
            .clone()
    }

    /// Breaker snapshots for every known host, sorted by host name.
    pub fn circuit_stats(&self) -> Vec<CircuitBreakerStats> {
        let hosts = self.lock_hosts();
        let mut stats: Vec<_> = hosts.values().map(|h| h.circuit.stats()).collect();
        stats.sort_by(|a, b| a.name.cmp(&b.name));
        stats
    }

    pub fn len(&self) -> usize {
        self.lock_hosts().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for HostRegistry {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default(), RateLimitConfig::default())
    }
}

/// Extract the lowercase host from a URL.
pub fn host_of(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    parsed.host_str().map(|h| h.to_ascii_lowercase())
}
