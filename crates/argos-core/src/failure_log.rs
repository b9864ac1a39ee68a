//! Failure records for offline parser repair.
//!
//! When a fetch ends without usable content the crawler emits a
//! [`FailureRecord`] through a [`FailureSink`]. Whatever consumes those
//! records runs outside the request path.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::fetch::StrategyAttempt;
use crate::models::compute_hash;

/// Everything an offline consumer needs to reproduce a failed fetch.
#[derive(Debug, Clone, Serialize)]
pub struct FailureRecord {
    pub url: String,
    pub host: String,
    pub trace: Vec<StrategyAttempt>,
    pub last_status: Option<u16>,
    /// SHA-256 of the last body seen, if any.
    pub content_hash: Option<String>,
    pub content_len: usize,
    pub error: String,
    pub recorded_at: DateTime<Utc>,
}

impl FailureRecord {
    pub fn new(
        url: &str,
        host: &str,
        trace: Vec<StrategyAttempt>,
        last_body: Option<&str>,
        error: &str,
    ) -> Self {
        let last_status = trace.iter().rev().find_map(|a| a.status_code);
        Self {
            url: url.to_string(),
            host: host.to_string(),
            trace,
            last_status,
            content_hash: last_body.map(compute_hash),
            content_len: last_body.map_or(0, str::len),
            error: error.to_string(),
            recorded_at: Utc::now(),
        }
    }
}

/// Receives failure records (decoupled from the crawler).
pub trait FailureSink: Send + Sync {
    fn record(&self, failure: FailureRecord) {
        let _ = failure;
    }
}

/// Sink that logs failure records with `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingFailureSink;

impl FailureSink for TracingFailureSink {
    fn record(&self, failure: FailureRecord) {
        let strategies: Vec<&str> = failure.trace.iter().map(|a| a.strategy.as_str()).collect();
        tracing::warn!(
            url = %failure.url,
            host = %failure.host,
            last_status = ?failure.last_status,
            content_hash = ?failure.content_hash,
            content_len = failure.content_len,
            strategies = ?strategies,
            error = %failure.error,
            "Fetch failed after exhausting strategies"
        );
    }
}
