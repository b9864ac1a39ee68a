//! Fetch request and result types.

use std::time::Duration;

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::error::AppError;
use crate::host::host_of;
use crate::strategy::Strategy;

/// Default per-request hard ceiling.
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(30);

/// A single URL retrieval. Immutable once handed to a fetcher.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    url: String,
    host: String,
    strategies: Option<Vec<Strategy>>,
    timeout: Duration,
    retry_budget: Option<u32>,
    cancel: CancellationToken,
}

impl FetchRequest {
    /// Build a request for `url`. Fails if the URL has no host.
    pub fn new(url: impl Into<String>) -> Result<Self, AppError> {
        let url = url.into();
        let host = host_of(&url).ok_or_else(|| AppError::ParseError(format!("invalid URL: {url}")))?;
        Ok(Self {
            url,
            host,
            strategies: None,
            timeout: DEFAULT_FETCH_TIMEOUT,
            retry_budget: None,
            cancel: CancellationToken::new(),
        })
    }

    /// Restrict the strategies this request may use. Order is ignored; the
    /// crawler's escalation order always applies.
    pub fn with_strategies(mut self, strategies: impl IntoIterator<Item = Strategy>) -> Self {
        self.strategies = Some(strategies.into_iter().collect());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Override the number of local retries per strategy.
    pub fn with_retry_budget(mut self, retries: u32) -> Self {
        self.retry_budget = Some(retries);
        self
    }

    /// Tie this request to a parent cancellation scope.
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn retry_budget(&self) -> Option<u32> {
        self.retry_budget
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn allows(&self, strategy: Strategy) -> bool {
        self.strategies
            .as_ref()
            .is_none_or(|allowed| allowed.contains(&strategy))
    }
}

/// What an executor returns: the response as seen on the wire.
///
/// Non-2xx statuses are not errors at this level; classification happens in
/// the crawler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawResponse {
    pub status: u16,
    pub body: String,
    pub final_url: Option<String>,
}

impl RawResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
            final_url: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchStatus {
    Success,
    Blocked,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Success,
    SoftBlock,
    HardFailure,
    Rejected,
    CircuitOpen,
    RateLimited,
    Cancelled,
}

/// One entry in a fetch's strategy trace.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StrategyAttempt {
    pub strategy: Strategy,
    pub outcome: AttemptOutcome,
    pub status_code: Option<u16>,
    pub detail: Option<String>,
    #[serde(with = "duration_ms")]
    pub elapsed: Duration,
    pub body_len: usize,
}

/// Result of one fetch. Owned by the caller that issued the request.
#[derive(Debug)]
pub struct FetchResult {
    pub url: String,
    pub status: FetchStatus,
    /// Strategy that produced the final response, if any did.
    pub strategy: Option<Strategy>,
    pub status_code: Option<u16>,
    pub body: Option<String>,
    pub elapsed: Duration,
    /// Network attempts made (including retries).
    pub attempts: u32,
    pub trace: Vec<StrategyAttempt>,
    /// Why the fetch did not succeed.
    pub error: Option<AppError>,
}

impl FetchResult {
    /// A successful single-attempt result, for fetchers that do not escalate.
    pub fn from_body(url: impl Into<String>, strategy: Strategy, body: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            status: FetchStatus::Success,
            strategy: Some(strategy),
            status_code: Some(200),
            body: Some(body.into()),
            elapsed: Duration::ZERO,
            attempts: 1,
            trace: Vec::new(),
            error: None,
        }
    }

    pub fn failure(url: impl Into<String>, status: FetchStatus, error: AppError) -> Self {
        Self {
            url: url.into(),
            status,
            strategy: None,
            status_code: None,
            body: None,
            elapsed: Duration::ZERO,
            attempts: 0,
            trace: Vec::new(),
            error: Some(error),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == FetchStatus::Success
    }

    /// The body on success, otherwise the error that ended the fetch.
    pub fn into_body(self) -> Result<String, AppError> {
        match (self.status, self.body, self.error) {
            (FetchStatus::Success, Some(body), _) => Ok(body),
            (_, _, Some(error)) => Err(error),
            (status, _, None) => Err(AppError::Generic(format!(
                "fetch of {} ended with status {status:?}",
                self.url
            ))),
        }
    }
}

pub(crate) mod duration_ms {
    use std::time::Duration;

    use serde::Serializer;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_parses_host() {
        let req = FetchRequest::new("https://Patentscope.WIPO.int/search?q=x").unwrap();
        assert_eq!(req.host(), "patentscope.wipo.int");
        assert_eq!(req.timeout(), DEFAULT_FETCH_TIMEOUT);
        assert!(req.allows(Strategy::HeadlessChrome));
    }

    #[test]
    fn request_rejects_invalid_url() {
        assert!(matches!(
            FetchRequest::new("not a url"),
            Err(AppError::ParseError(_))
        ));
    }

    #[test]
    fn request_strategy_restriction() {
        let req = FetchRequest::new("https://example.com")
            .unwrap()
            .with_strategies([Strategy::PlainHttp, Strategy::StealthHttp]);
        assert!(req.allows(Strategy::PlainHttp));
        assert!(!req.allows(Strategy::HeadlessChrome));
    }

    #[test]
    fn into_body_returns_error_on_failure() {
        let result = FetchResult {
            url: "https://example.com".into(),
            status: FetchStatus::Blocked,
            strategy: None,
            status_code: Some(403),
            body: None,
            elapsed: Duration::ZERO,
            attempts: 1,
            trace: vec![],
            error: Some(AppError::Blocked {
                strategy: Strategy::PlainHttp,
                status: Some(403),
            }),
        };
        assert!(matches!(
            result.into_body(),
            Err(AppError::Blocked { .. })
        ));
    }

    #[test]
    fn attempt_serializes_elapsed_as_millis() {
        let attempt = StrategyAttempt {
            strategy: Strategy::PlainHttp,
            outcome: AttemptOutcome::SoftBlock,
            status_code: Some(429),
            detail: Some("HTTP 429".into()),
            elapsed: Duration::from_millis(1500),
            body_len: 12,
        };
        let json = serde_json::to_value(&attempt).unwrap();
        assert_eq!(json["elapsed"], 1500);
        assert_eq!(json["outcome"], "soft_block");
    }
}
