//! Seams between the orchestrator and upstream sources.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{AppError, SourceError, SourceErrorKind};
use crate::fetch::{DEFAULT_FETCH_TIMEOUT, FetchRequest};
use crate::models::{CrossReference, Record, Subject};
use crate::util::deadline_after;

/// Free-form per-search options passed to every adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryOptions {
    /// Upper bound on records an adapter should return.
    pub max_results: usize,
    pub extra: BTreeMap<String, String>,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            max_results: 50,
            extra: BTreeMap::new(),
        }
    }
}

impl QueryOptions {
    pub fn with_max_results(mut self, max: usize) -> Self {
        self.max_results = max;
        self
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }
}

/// Deadline, cancellation scope and options for one adapter call.
#[derive(Debug, Clone)]
pub struct QueryContext {
    deadline: Instant,
    cancel: CancellationToken,
    options: QueryOptions,
}

impl QueryContext {
    pub fn new(deadline: Instant, cancel: CancellationToken, options: QueryOptions) -> Self {
        Self {
            deadline,
            cancel,
            options,
        }
    }

    /// A context expiring `timeout` from now, with its own cancellation scope.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self::new(
            deadline_after(timeout),
            CancellationToken::new(),
            QueryOptions::default(),
        )
    }

    /// A narrower context: expires at `timeout` from now or this context's
    /// deadline, whichever is first, and is cancelled with this one.
    pub fn child(&self, timeout: Duration) -> Self {
        Self {
            deadline: self.deadline.min(deadline_after(timeout)),
            cancel: self.cancel.child_token(),
            options: self.options.clone(),
        }
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    pub fn is_expired(&self) -> bool {
        self.remaining().is_zero()
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn options(&self) -> &QueryOptions {
        &self.options
    }

    /// Build a fetch bounded by this context's deadline and cancelled with it.
    pub fn fetch_request(&self, url: impl Into<String>) -> Result<FetchRequest, AppError> {
        if self.cancel.is_cancelled() {
            return Err(AppError::Cancelled);
        }
        let remaining = self.remaining();
        if remaining.is_zero() {
            return Err(AppError::Timeout(Duration::ZERO));
        }
        Ok(FetchRequest::new(url)?
            .with_timeout(remaining.min(DEFAULT_FETCH_TIMEOUT))
            .with_cancel(self.cancel.child_token()))
    }
}

/// What an adapter hands back: whatever it collected, plus structured errors.
#[derive(Debug, Clone, Default)]
pub struct AdapterOutput {
    pub records: Vec<Record>,
    pub errors: Vec<SourceError>,
    /// References that need a follow-up query to become full records.
    pub cross_references: Vec<CrossReference>,
}

impl AdapterOutput {
    pub fn from_records(records: Vec<Record>) -> Self {
        Self {
            records,
            ..Default::default()
        }
    }

    pub fn failed(error: SourceError) -> Self {
        Self {
            errors: vec![error],
            ..Default::default()
        }
    }

    pub fn with_error(mut self, error: SourceError) -> Self {
        self.errors.push(error);
        self
    }

    pub fn extend(&mut self, other: AdapterOutput) {
        self.records.extend(other.records);
        self.errors.extend(other.errors);
        self.cross_references.extend(other.cross_references);
    }

    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

/// One upstream source.
///
/// Implementations must not fail the call on partial failure: they return
/// whatever they have plus a list of [`SourceError`]s.
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn name(&self) -> &str;

    async fn query(&self, subject: &Subject, ctx: &QueryContext) -> AdapterOutput;

    /// Turn a cross-reference this adapter produced into full records.
    async fn expand(&self, reference: &CrossReference, ctx: &QueryContext) -> AdapterOutput {
        let _ = ctx;
        AdapterOutput::failed(SourceError::new(
            self.name(),
            SourceErrorKind::Other,
            format!("cannot expand {}", reference.identifier),
        ))
    }
}

/// Subject plus any records found while resolving it.
#[derive(Debug, Clone, Default)]
pub struct Resolution {
    pub subject: Subject,
    pub records: Vec<Record>,
}

/// Authoritative source that canonicalizes the user's query.
#[async_trait]
pub trait SubjectResolver: Send + Sync {
    fn name(&self) -> &str;

    async fn resolve(&self, query: &str, ctx: &QueryContext) -> Result<Resolution, AppError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn fetch_request_is_bounded_by_deadline() {
        let ctx = QueryContext::with_timeout(Duration::from_secs(5));
        let req = ctx.fetch_request("https://example.com").unwrap();
        assert_eq!(req.timeout(), Duration::from_secs(5));

        let long = QueryContext::with_timeout(Duration::from_secs(600));
        assert_eq!(
            long.fetch_request("https://example.com").unwrap().timeout(),
            DEFAULT_FETCH_TIMEOUT
        );
    }

    #[tokio::test(start_paused = true)]
    async fn fetch_request_fails_after_deadline() {
        let ctx = QueryContext::with_timeout(Duration::from_secs(1));
        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(ctx.is_expired());
        assert!(matches!(
            ctx.fetch_request("https://example.com"),
            Err(AppError::Timeout(_))
        ));
    }

    #[tokio::test]
    async fn cancelling_context_cancels_fetches() {
        let ctx = QueryContext::with_timeout(Duration::from_secs(5));
        let req = ctx.fetch_request("https://example.com").unwrap();
        ctx.cancel_token().cancel();

        assert!(req.cancel_token().is_cancelled());
        assert!(matches!(
            ctx.fetch_request("https://example.com"),
            Err(AppError::Cancelled)
        ));
    }

    #[test]
    fn output_helpers() {
        let mut out = AdapterOutput::from_records(vec![]);
        assert!(out.is_clean());
        out.extend(AdapterOutput::failed(SourceError::new(
            "x",
            SourceErrorKind::Parse,
            "bad",
        )));
        assert!(!out.is_clean());
    }
}
