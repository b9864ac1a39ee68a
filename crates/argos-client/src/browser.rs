use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use argos_core::error::AppError;
use argos_core::fetch::RawResponse;
use argos_core::strategy::{Strategy, StrategyTable};
use argos_core::traits::StrategyExecutor;
use async_trait::async_trait;
use chromiumoxide::cdp::browser_protocol::network::SetUserAgentOverrideParams;
use chromiumoxide::{Browser, BrowserConfig, Page};
use futures::StreamExt;

use crate::http::DESKTOP_USER_AGENT;
use crate::ssrf::validate_url;

const MOBILE_USER_AGENT: &str = "Mozilla/5.0 (Linux; Android 14; Pixel 8) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Mobile Safari/537.36";

/// How a tab presents itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrowserProfile {
    Desktop,
    /// Automation markers hidden.
    Stealth,
    /// Mobile Chrome user agent.
    Mobile,
}

impl BrowserProfile {
    pub fn strategy(&self) -> Strategy {
        match self {
            BrowserProfile::Desktop => Strategy::HeadlessChrome,
            BrowserProfile::Stealth => Strategy::HeadlessChromeStealth,
            BrowserProfile::Mobile => Strategy::HeadlessChromeMobile,
        }
    }
}

/// One headless Chromium process shared by every browser strategy.
///
/// Each fetch opens a tab, waits for `<body>`, reads the rendered DOM and
/// closes the tab.
#[derive(Clone)]
pub struct HeadlessBrowser {
    browser: Arc<Browser>,
}

impl HeadlessBrowser {
    /// Launch Chromium. Requires a Chrome/Chromium binary on `$PATH`, at a
    /// well-known location, or named by `CHROME_BIN`.
    pub async fn launch() -> Result<Self, AppError> {
        let mut builder = BrowserConfig::builder().no_sandbox().disable_default_args();

        if let Some(bin) = find_chrome_binary() {
            tracing::info!("Using Chrome binary: {}", bin.display());
            builder = builder.chrome_executable(bin);
        }

        let config = builder
            .arg("--headless=new")
            .arg("--disable-gpu")
            .arg("--disable-dev-shm-usage")
            .arg("--disable-extensions")
            .arg("--disable-popup-blocking")
            .arg("--no-first-run")
            .build()
            .map_err(|e| AppError::Generic(format!("Browser config error: {e}")))?;

        let (browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|e| AppError::Generic(format!("Failed to launch browser: {e}")))?;

        // The CDP handler must be polled for the connection to make progress.
        tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if event.is_err() {
                    tracing::warn!("Browser CDP handler error: {event:?}");
                    break;
                }
            }
        });

        Ok(Self {
            browser: Arc::new(browser),
        })
    }

    pub fn executor(&self, profile: BrowserProfile) -> BrowserExecutor {
        BrowserExecutor {
            browser: Arc::clone(&self.browser),
            profile,
            ssrf_protection: true,
        }
    }

    /// Add all three browser strategies to `table`.
    pub fn register(&self, table: StrategyTable) -> StrategyTable {
        [
            BrowserProfile::Desktop,
            BrowserProfile::Stealth,
            BrowserProfile::Mobile,
        ]
        .into_iter()
        .fold(table, |table, profile| {
            table.with(profile.strategy(), Arc::new(self.executor(profile)))
        })
    }
}

/// Strategy executor rendering pages in a [`HeadlessBrowser`] tab.
///
/// The DevTools protocol does not surface the document status here, so a
/// rendered page is reported as 200 and left to the block detector.
#[derive(Clone)]
pub struct BrowserExecutor {
    browser: Arc<Browser>,
    profile: BrowserProfile,
    ssrf_protection: bool,
}

impl BrowserExecutor {
    pub fn allow_private_urls(mut self) -> Self {
        self.ssrf_protection = false;
        self
    }

    async fn render(&self, url: &str) -> Result<String, AppError> {
        let page = self
            .browser
            .new_page("about:blank")
            .await
            .map_err(|e| AppError::HttpError(format!("Failed to open tab: {e}")))?;

        let result = self.navigate(&page, url).await;
        let _ = page.close().await;
        result
    }

    async fn navigate(&self, page: &Page, url: &str) -> Result<String, AppError> {
        match self.profile {
            BrowserProfile::Desktop => {
                page.set_user_agent(SetUserAgentOverrideParams::new(DESKTOP_USER_AGENT))
                    .await
                    .map_err(|e| AppError::HttpError(format!("Failed to set user agent: {e}")))?;
            }
            BrowserProfile::Stealth => {
                page.enable_stealth_mode()
                    .await
                    .map_err(|e| AppError::HttpError(format!("Failed to enable stealth: {e}")))?;
            }
            BrowserProfile::Mobile => {
                page.set_user_agent(SetUserAgentOverrideParams::new(MOBILE_USER_AGENT))
                    .await
                    .map_err(|e| AppError::HttpError(format!("Failed to set user agent: {e}")))?;
            }
        }

        page.goto(url)
            .await
            .map_err(|e| AppError::HttpError(format!("Failed to navigate to {url}: {e}")))?;
        page.find_element("body")
            .await
            .map_err(|e| AppError::HttpError(format!("Page did not render body: {e}")))?;
        page.content()
            .await
            .map_err(|e| AppError::HttpError(format!("Failed to read page content: {e}")))
    }
}

#[async_trait]
impl StrategyExecutor for BrowserExecutor {
    async fn execute(&self, url: &str, timeout: Duration) -> Result<RawResponse, AppError> {
        if self.ssrf_protection {
            validate_url(url).await?;
        }

        let html = tokio::time::timeout(timeout, self.render(url))
            .await
            .map_err(|_| AppError::Timeout(timeout))??;

        Ok(RawResponse {
            status: 200,
            body: html,
            final_url: Some(url.to_string()),
        })
    }
}

/// Locate a real Chrome/Chromium binary.
///
/// The snap wrapper at `/snap/bin/chromium` strips unknown flags and breaks
/// headless mode, so the binary inside the snap is preferred. `None` leaves
/// the lookup to chromiumoxide.
fn find_chrome_binary() -> Option<PathBuf> {
    if let Ok(p) = std::env::var("CHROME_BIN") {
        let path = PathBuf::from(&p);
        if path.exists() {
            return Some(path);
        }
    }

    [
        "/snap/chromium/current/usr/lib/chromium-browser/chrome",
        "/var/lib/flatpak/exports/bin/org.chromium.Chromium",
        "/usr/bin/google-chrome-stable",
        "/usr/bin/google-chrome",
        "/usr/bin/chromium",
        "/usr/bin/chromium-browser",
    ]
    .iter()
    .map(PathBuf::from)
    .find(|p| p.exists())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn profiles_map_to_browser_strategies() {
        assert_eq!(BrowserProfile::Desktop.strategy(), Strategy::HeadlessChrome);
        assert_eq!(BrowserProfile::Stealth.strategy(), Strategy::HeadlessChromeStealth);
        assert_eq!(BrowserProfile::Mobile.strategy(), Strategy::HeadlessChromeMobile);
        assert!(BrowserProfile::Mobile.strategy().is_browser());
    }
}
