use std::time::Duration;

use argos_core::error::AppError;
use argos_core::fetch::RawResponse;
use argos_core::traits::StrategyExecutor;
use async_trait::async_trait;
use reqwest::header::{ACCEPT, ACCEPT_LANGUAGE, HeaderMap, HeaderValue};
use reqwest::{Client, Response};

use crate::ssrf::validate_url;

pub(crate) const PLAIN_USER_AGENT: &str = "Argos/0.1 (research aggregator)";
pub(crate) const DESKTOP_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36";

/// Header set of the HTTP client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpProfile {
    /// Honest user agent, API-friendly `Accept`.
    Plain,
    /// Desktop Chrome user agent and navigation headers.
    Stealth,
}

/// Strategy executor backed by reqwest.
///
/// Returns every response as a [`RawResponse`] regardless of status; the
/// crawler decides what counts as a block. SSRF protection is on by default,
/// use [`allow_private_urls`](Self::allow_private_urls) to reach local hosts.
#[derive(Clone)]
pub struct HttpExecutor {
    client: Client,
    profile: HttpProfile,
    ssrf_protection: bool,
}

impl HttpExecutor {
    pub fn plain() -> Result<Self, AppError> {
        Self::new(HttpProfile::Plain)
    }

    pub fn stealth() -> Result<Self, AppError> {
        Self::new(HttpProfile::Stealth)
    }

    pub fn new(profile: HttpProfile) -> Result<Self, AppError> {
        let (user_agent, headers) = match profile {
            HttpProfile::Plain => (PLAIN_USER_AGENT, plain_headers()),
            HttpProfile::Stealth => (DESKTOP_USER_AGENT, browser_headers()),
        };
        let client = Client::builder()
            .user_agent(user_agent)
            .default_headers(headers)
            .build()
            .map_err(|e| AppError::HttpError(e.to_string()))?;

        Ok(Self {
            client,
            profile,
            ssrf_protection: true,
        })
    }

    /// Disable SSRF protection, allowing requests to private/reserved IPs.
    pub fn allow_private_urls(mut self) -> Self {
        self.ssrf_protection = false;
        self
    }

    pub fn profile(&self) -> HttpProfile {
        self.profile
    }
}

#[async_trait]
impl StrategyExecutor for HttpExecutor {
    async fn execute(&self, url: &str, timeout: Duration) -> Result<RawResponse, AppError> {
        if self.ssrf_protection {
            validate_url(url).await?;
        }

        let response = self
            .client
            .get(url)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| transport_error(e, timeout))?;

        read_response(response, timeout).await
    }
}

/// Collect status, final URL and body.
pub(crate) async fn read_response(
    response: Response,
    timeout: Duration,
) -> Result<RawResponse, AppError> {
    let status = response.status().as_u16();
    let final_url = response.url().to_string();
    let body = response.text().await.map_err(|e| {
        if e.is_timeout() {
            AppError::Timeout(timeout)
        } else {
            AppError::HttpError(format!("Failed to read response body: {e}"))
        }
    })?;
    Ok(RawResponse {
        status,
        body,
        final_url: Some(final_url),
    })
}

pub(crate) fn transport_error(e: reqwest::Error, timeout: Duration) -> AppError {
    if e.is_timeout() {
        AppError::Timeout(timeout)
    } else if e.is_connect() {
        AppError::NetworkError(format!("Connection failed: {e}"))
    } else if e.is_builder() {
        AppError::HttpError(e.to_string())
    } else {
        AppError::NetworkError(e.to_string())
    }
}

fn plain_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(
        ACCEPT,
        HeaderValue::from_static("application/json, text/html;q=0.9, */*;q=0.8"),
    );
    headers
}

pub(crate) fn browser_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(
        ACCEPT,
        HeaderValue::from_static(
            "text/html,application/xhtml+xml,application/xml;q=0.9,image/avif,image/webp,*/*;q=0.8",
        ),
    );
    headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static("en-US,en;q=0.9"));
    headers.insert("upgrade-insecure-requests", HeaderValue::from_static("1"));
    headers.insert("sec-fetch-dest", HeaderValue::from_static("document"));
    headers.insert("sec-fetch-mode", HeaderValue::from_static("navigate"));
    headers.insert("sec-fetch-site", HeaderValue::from_static("none"));
    headers.insert("sec-fetch-user", HeaderValue::from_static("?1"));
    headers.insert(
        "sec-ch-ua",
        HeaderValue::from_static(r#""Chromium";v="131", "Not_A Brand";v="24""#),
    );
    headers.insert("sec-ch-ua-mobile", HeaderValue::from_static("?0"));
    headers.insert("sec-ch-ua-platform", HeaderValue::from_static(r#""Windows""#));
    headers
}
