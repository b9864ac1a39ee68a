//! Reference [`SourceAdapter`](argos_core::source::SourceAdapter)s for public
//! pharmaceutical data APIs.

pub mod clinical_trials;
pub mod pubchem;

use argos_core::ai_fallback::AiFallbackDecider;
use argos_core::error::{AppError, SourceError};
use argos_core::extraction::{ExtractionRequest, TargetSchema};
use argos_core::models::{CrossReference, Record};
use argos_core::source::QueryContext;
use argos_core::traits::{Cleaner, Fetcher};
use serde::de::DeserializeOwned;
use url::Url;

pub use clinical_trials::ClinicalTrialsAdapter;
pub use pubchem::{PubChemApi, PubChemPatentAdapter, PubChemResolver};

/// Fetch `url` within `ctx` and decode the body as JSON.
pub(crate) async fn fetch_json<F, T>(fetcher: &F, ctx: &QueryContext, url: &str) -> Result<T, AppError>
where
    F: Fetcher,
    T: DeserializeOwned,
{
    let body = fetch_text(fetcher, ctx, url).await?;
    decode(url, &body)
}

/// Like [`fetch_json`], but a 404 means there is nothing to report.
pub(crate) async fn fetch_json_or_missing<F, T>(
    fetcher: &F,
    ctx: &QueryContext,
    url: &str,
) -> Result<Option<T>, AppError>
where
    F: Fetcher,
    T: DeserializeOwned,
{
    let request = ctx.fetch_request(url)?;
    let result = fetcher.fetch(&request).await;
    if !result.is_success() && result.status_code == Some(404) {
        return Ok(None);
    }
    let body = result.into_body()?;
    decode(url, &body).map(Some)
}

fn decode<T: DeserializeOwned>(url: &str, body: &str) -> Result<T, AppError> {
    serde_json::from_str(body).map_err(|e| AppError::ParseError(format!("{url}: {e}")))
}

pub(crate) async fn fetch_text<F: Fetcher>(
    fetcher: &F,
    ctx: &QueryContext,
    url: &str,
) -> Result<String, AppError> {
    let request = ctx.fetch_request(url)?;
    fetcher.fetch(&request).await.into_body()
}

/// `base` with `segments` appended, each percent-encoded.
pub(crate) fn join_path(base: &Url, segments: &[&str]) -> Result<Url, AppError> {
    let mut url = base.clone();
    url.path_segments_mut()
        .map_err(|()| AppError::ConfigError(format!("{base} cannot be a base URL")))?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

/// AI recovery for documents that fail structural parsing.
///
/// The raw document is cleaned to text first so the provider is billed for
/// content only.
#[derive(Clone)]
pub struct AiAssist<C: Cleaner> {
    decider: AiFallbackDecider,
    cleaner: C,
}

impl<C: Cleaner> AiAssist<C> {
    pub fn new(decider: AiFallbackDecider, cleaner: C) -> Self {
        Self { decider, cleaner }
    }

    pub async fn recover(
        &self,
        source: &str,
        document: &str,
        schema: TargetSchema,
        known: Option<&CrossReference>,
        ctx: &QueryContext,
    ) -> Result<Record, SourceError> {
        let content = self
            .cleaner
            .clean(document)
            .map_err(|e| SourceError::from_app_error(source, &e))?;
        let mut request = ExtractionRequest::new(content, schema);
        if let Some(url) = known.and_then(|k| k.url.as_deref()) {
            request = request.with_source_url(url);
        }
        self.decider
            .extract_record(&request, source, known, ctx.cancel_token())
            .await
    }
}
