use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::AppError;
use crate::extraction::{AiBudget, ProviderSpec, TargetSchema};
use crate::fetch::{FetchRequest, FetchResult, RawResponse};

/// Performs one concrete access strategy against a URL.
///
/// Returns the response whatever its status; only transport failures
/// (connect, timeout, body read) are errors.
#[async_trait]
pub trait StrategyExecutor: Send + Sync {
    async fn execute(&self, url: &str, timeout: Duration) -> Result<RawResponse, AppError>;
}

/// Retrieves a URL, escalating through strategies as needed.
///
/// Never fails outright: the outcome, including errors, is in the
/// [`FetchResult`].
pub trait Fetcher: Send + Sync + Clone {
    fn fetch(&self, request: &FetchRequest) -> impl Future<Output = FetchResult> + Send;
}

/// Converts raw HTML into clean text for extraction.
pub trait Cleaner: Send + Sync + Clone {
    fn clean(&self, html: &str) -> Result<String, AppError>;
}

/// An external AI extraction service.
///
/// Cost and priority are static configuration exposed through [`spec`](Self::spec).
#[async_trait]
pub trait ExtractionProvider: Send + Sync {
    fn spec(&self) -> &ProviderSpec;

    /// Extract JSON matching `schema` from `content`.
    async fn extract(
        &self,
        content: &str,
        schema: &TargetSchema,
        budget: &AiBudget,
    ) -> Result<serde_json::Value, AppError>;
}
