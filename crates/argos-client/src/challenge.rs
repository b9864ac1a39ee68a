use std::time::Duration;

use argos_core::error::AppError;
use argos_core::fetch::RawResponse;
use argos_core::traits::StrategyExecutor;
use async_trait::async_trait;
use reqwest::Client;
use reqwest::header::REFERER;
use tokio::time::Instant;
use url::Url;

use crate::http::{DESKTOP_USER_AGENT, browser_headers, read_response, transport_error};
use crate::ssrf::validate_url;

/// Cookie-priming client for sites that gate content behind a first visit.
///
/// Visits the site's origin first so the shared cookie jar picks up any
/// session or challenge cookies, then requests the target with the origin as
/// `Referer`. Both requests share the caller's timeout.
#[derive(Clone)]
pub struct ChallengeExecutor {
    client: Client,
    ssrf_protection: bool,
}

impl ChallengeExecutor {
    pub fn new() -> Result<Self, AppError> {
        let client = Client::builder()
            .user_agent(DESKTOP_USER_AGENT)
            .default_headers(browser_headers())
            .cookie_store(true)
            .build()
            .map_err(|e| AppError::HttpError(e.to_string()))?;

        Ok(Self {
            client,
            ssrf_protection: true,
        })
    }

    pub fn allow_private_urls(mut self) -> Self {
        self.ssrf_protection = false;
        self
    }

    async fn prime(&self, origin: &str, timeout: Duration) -> Result<(), AppError> {
        let response = self
            .client
            .get(origin)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| transport_error(e, timeout))?;
        tracing::debug!(origin, status = response.status().as_u16(), "Primed session cookies");
        // Drain the body so the connection can be reused.
        let _ = response.bytes().await;
        Ok(())
    }
}

#[async_trait]
impl StrategyExecutor for ChallengeExecutor {
    async fn execute(&self, url: &str, timeout: Duration) -> Result<RawResponse, AppError> {
        let parsed = if self.ssrf_protection {
            validate_url(url).await?
        } else {
            Url::parse(url).map_err(|e| AppError::HttpError(format!("Invalid URL: {e}")))?
        };
        let deadline = Instant::now() + timeout;
        let origin = format!("{}/", parsed.origin().ascii_serialization());

        if origin != url {
            self.prime(&origin, timeout).await?;
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(AppError::Timeout(timeout));
        }

        let response = self
            .client
            .get(url)
            .header(REFERER, origin.as_str())
            .timeout(remaining)
            .send()
            .await
            .map_err(|e| transport_error(e, timeout))?;

        read_response(response, timeout).await
    }
}
