//! Test utilities: mock implementations of the core traits.
//!
//! Handwritten mocks for dependency injection in unit tests. All mocks use
//! `Arc<Mutex<_>>` for interior mutability so clones share recorded calls.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::{AppError, SourceError};
use crate::extraction::{AiBudget, ProviderSpec, TargetSchema};
use crate::failure_log::{FailureRecord, FailureSink};
use crate::fetch::{FetchRequest, FetchResult, FetchStatus, RawResponse};
use crate::models::{CrossReference, Record, Subject};
use crate::source::{AdapterOutput, QueryContext, Resolution, SourceAdapter, SubjectResolver};
use crate::strategy::Strategy;
use crate::traits::{Cleaner, ExtractionProvider, Fetcher, StrategyExecutor};

/// A page long enough and clean enough to pass the default block detector.
pub fn good_page(text: &str) -> String {
    format!(
        "<html><head><title>{text}</title></head><body><main><h1>{text}</h1>{}</main></body></html>",
        "<p>Lorem ipsum dolor sit amet, consectetur adipiscing elit.</p>".repeat(5)
    )
}

// ---------------------------------------------------------------------------
// MockExecutor
// ---------------------------------------------------------------------------

/// Mock strategy executor.
///
/// Each call pops the first scripted response; the last `Ok` response
/// repeats once the queue is down to one.
#[derive(Clone)]
pub struct MockExecutor {
    responses: Arc<Mutex<Vec<Result<RawResponse, AppError>>>>,
    delay: Duration,
    calls: Arc<AtomicUsize>,
}

impl MockExecutor {
    pub fn ok(body: &str) -> Self {
        Self::status(200, body)
    }

    pub fn status(status: u16, body: &str) -> Self {
        Self::with_responses(vec![Ok(RawResponse::new(status, body))])
    }

    pub fn with_responses(responses: Vec<Result<RawResponse, AppError>>) -> Self {
        Self {
            responses: Arc::new(Mutex::new(responses)),
            delay: Duration::ZERO,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn next_response(&self) -> Result<RawResponse, AppError> {
        let mut responses = self.responses.lock().unwrap();
        if responses.len() > 1 {
            return responses.remove(0);
        }
        if let Some(Ok(last)) = responses.first() {
            return Ok(last.clone());
        }
        if responses.is_empty() {
            Ok(RawResponse::new(200, good_page("default")))
        } else {
            responses.remove(0)
        }
    }
}

#[async_trait]
impl StrategyExecutor for MockExecutor {
    async fn execute(&self, _url: &str, _timeout: Duration) -> Result<RawResponse, AppError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.next_response()
    }
}

// ---------------------------------------------------------------------------
// MockFailureSink
// ---------------------------------------------------------------------------

/// Collects failure records for assertions.
#[derive(Clone, Default)]
pub struct MockFailureSink {
    records: Arc<Mutex<Vec<FailureRecord>>>,
}

impl MockFailureSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<FailureRecord> {
        self.records.lock().unwrap().clone()
    }
}

impl FailureSink for MockFailureSink {
    fn record(&self, failure: FailureRecord) {
        self.records.lock().unwrap().push(failure);
    }
}

// ---------------------------------------------------------------------------
// MockFetcher
// ---------------------------------------------------------------------------

/// Mock fetcher with per-URL scripted outcomes.
///
/// Routes match on URL prefix; the first match wins. Unrouted URLs come
/// back as a 404 error.
#[derive(Clone, Default)]
pub struct MockFetcher {
    routes: Arc<Mutex<Vec<(String, Route)>>>,
    requested: Arc<Mutex<Vec<String>>>,
}

#[derive(Clone)]
enum Route {
    Page(String),
    Failure(FetchStatus, String),
}

impl MockFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_page(self, url_prefix: &str, body: &str) -> Self {
        self.routes
            .lock()
            .unwrap()
            .push((url_prefix.to_string(), Route::Page(body.to_string())));
        self
    }

    /// Fail matching URLs as blocked.
    pub fn with_block(self, url_prefix: &str) -> Self {
        self.routes.lock().unwrap().push((
            url_prefix.to_string(),
            Route::Failure(FetchStatus::Blocked, "403".into()),
        ));
        self
    }

    pub fn requested(&self) -> Vec<String> {
        self.requested.lock().unwrap().clone()
    }
}

impl Fetcher for MockFetcher {
    async fn fetch(&self, request: &FetchRequest) -> FetchResult {
        let url = request.url().to_string();
        self.requested.lock().unwrap().push(url.clone());
        let route = self
            .routes
            .lock()
            .unwrap()
            .iter()
            .find(|(prefix, _)| url.starts_with(prefix.as_str()))
            .map(|(_, route)| route.clone());
        match route {
            Some(Route::Page(body)) => FetchResult::from_body(url, Strategy::PlainHttp, body),
            Some(Route::Failure(status, detail)) => FetchResult::failure(
                url,
                status,
                AppError::Blocked {
                    strategy: Strategy::PlainHttp,
                    status: detail.parse().ok(),
                },
            ),
            None => FetchResult::failure(
                url.clone(),
                FetchStatus::Error,
                AppError::HttpError(format!("404 Not Found: {url}")),
            ),
        }
    }
}

// ---------------------------------------------------------------------------
// MockCleaner
// ---------------------------------------------------------------------------

/// Mock cleaner that returns its input, or a scripted error once.
#[derive(Clone)]
pub struct MockCleaner {
    error: Arc<Mutex<Option<AppError>>>,
}

impl MockCleaner {
    pub fn passthrough() -> Self {
        Self {
            error: Arc::new(Mutex::new(None)),
        }
    }

    pub fn with_error(error: AppError) -> Self {
        Self {
            error: Arc::new(Mutex::new(Some(error))),
        }
    }
}

impl Cleaner for MockCleaner {
    fn clean(&self, html: &str) -> Result<String, AppError> {
        if let Some(e) = self.error.lock().unwrap().take() {
            return Err(e);
        }
        Ok(html.to_string())
    }
}

// ---------------------------------------------------------------------------
// MockProvider
// ---------------------------------------------------------------------------

/// Mock extraction provider with a queue of responses.
#[derive(Clone)]
pub struct MockProvider {
    spec: ProviderSpec,
    responses: Arc<Mutex<Vec<Result<Value, AppError>>>>,
    delay: Duration,
    received: Arc<Mutex<Vec<usize>>>,
}

impl MockProvider {
    pub fn new(spec: ProviderSpec) -> Self {
        Self {
            spec,
            responses: Arc::new(Mutex::new(Vec::new())),
            delay: Duration::ZERO,
            received: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn with_response(self, response: Result<Value, AppError>) -> Self {
        self.responses.lock().unwrap().push(response);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn call_count(&self) -> usize {
        self.received.lock().unwrap().len()
    }

    /// Character count of each content string the provider received.
    pub fn received_lengths(&self) -> Vec<usize> {
        self.received.lock().unwrap().clone()
    }
}

#[async_trait]
impl ExtractionProvider for MockProvider {
    fn spec(&self) -> &ProviderSpec {
        &self.spec
    }

    async fn extract(
        &self,
        content: &str,
        _schema: &TargetSchema,
        _budget: &AiBudget,
    ) -> Result<Value, AppError> {
        self.received.lock().unwrap().push(content.chars().count());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let mut responses = self.responses.lock().unwrap();
        if responses.is_empty() {
            Ok(serde_json::json!({}))
        } else {
            responses.remove(0)
        }
    }
}

// ---------------------------------------------------------------------------
// MockAdapter
// ---------------------------------------------------------------------------

/// Mock source adapter returning a fixed output after an optional delay.
///
/// Expanding a cross-reference yields one titled record for it.
#[derive(Clone)]
pub struct MockAdapter {
    name: String,
    output: AdapterOutput,
    delay: Duration,
    subjects: Arc<Mutex<Vec<String>>>,
    expanded: Arc<Mutex<Vec<String>>>,
}

impl MockAdapter {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            output: AdapterOutput::default(),
            delay: Duration::ZERO,
            subjects: Arc::new(Mutex::new(Vec::new())),
            expanded: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn with_records(mut self, records: Vec<Record>) -> Self {
        self.output.records = records;
        self
    }

    pub fn with_errors(mut self, errors: Vec<SourceError>) -> Self {
        self.output.errors = errors;
        self
    }

    pub fn with_cross_references(mut self, references: Vec<CrossReference>) -> Self {
        self.output.cross_references = references;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Names of the subjects this adapter was queried with.
    pub fn subjects(&self) -> Vec<String> {
        self.subjects.lock().unwrap().clone()
    }

    /// Identifiers of the cross-references this adapter expanded.
    pub fn expanded(&self) -> Vec<String> {
        self.expanded.lock().unwrap().clone()
    }
}

#[async_trait]
impl SourceAdapter for MockAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn query(&self, subject: &Subject, _ctx: &QueryContext) -> AdapterOutput {
        self.subjects.lock().unwrap().push(subject.name.clone());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.output.clone()
    }

    async fn expand(&self, reference: &CrossReference, _ctx: &QueryContext) -> AdapterOutput {
        self.expanded.lock().unwrap().push(reference.identifier.clone());
        let record = Record::new(
            reference.kind,
            reference.identifier.as_str(),
            reference.category.clone().unwrap_or_default(),
            self.name.as_str(),
        )
        .with_title(format!("Expanded {}", reference.identifier));
        AdapterOutput::from_records(vec![record])
    }
}

// ---------------------------------------------------------------------------
// MockResolver
// ---------------------------------------------------------------------------

/// Mock subject resolver.
#[derive(Clone)]
pub struct MockResolver {
    name: String,
    result: Result<Resolution, String>,
    delay: Duration,
}

impl MockResolver {
    pub fn ok(name: &str, resolution: Resolution) -> Self {
        Self {
            name: name.to_string(),
            result: Ok(resolution),
            delay: Duration::ZERO,
        }
    }

    /// Fails every call with a network error carrying `message`.
    pub fn failing(name: &str, message: &str) -> Self {
        Self {
            name: name.to_string(),
            result: Err(message.to_string()),
            delay: Duration::ZERO,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

#[async_trait]
impl SubjectResolver for MockResolver {
    fn name(&self) -> &str {
        &self.name
    }

    async fn resolve(&self, _query: &str, _ctx: &QueryContext) -> Result<Resolution, AppError> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.result
            .clone()
            .map_err(AppError::NetworkError)
    }
}
