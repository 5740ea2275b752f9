//! Heavyweight fetch strategy: a real browser
//!
//! The browser is expensive, so one is launched lazily per run and reused by
//! every fallback in that run. Pages are short-lived: one per navigation,
//! closed on every path.

use super::{HeaderProfile, RawResponse};
use crate::config::BrowserSettings;
use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::emulation::SetUserAgentOverrideParams;
use chromiumoxide::cdp::browser_protocol::network::{
    EnableParams, Headers, SetExtraHttpHeadersParams,
};
use chromiumoxide::cdp::browser_protocol::page::AddScriptToEvaluateOnNewDocumentParams;
use chromiumoxide::page::Page;
use futures::StreamExt;
use rand::seq::SliceRandom;
use serde::Deserialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

/// Common desktop viewports
const VIEWPORTS: &[(u32, u32)] = &[
    (1366, 768),
    (1440, 900),
    (1536, 864),
    (1600, 900),
    (1920, 1080),
];

/// Masks the usual automation tells before any page script runs
const HARDENING_SCRIPT: &str = r#"
Object.defineProperty(navigator, 'webdriver', { get: () => false });
Object.defineProperty(navigator, 'plugins', { get: () => [1, 2, 3, 4, 5] });
Object.defineProperty(navigator, 'languages', { get: () => ['es-CL', 'es', 'en-US', 'en'] });
window.chrome = window.chrome || { runtime: {} };
(() => {
  const getParameter = WebGLRenderingContext.prototype.getParameter;
  WebGLRenderingContext.prototype.getParameter = function (parameter) {
    if (parameter === 37445) return 'Google Inc.';
    if (parameter === 37446) return 'ANGLE (Intel, Intel(R) UHD Graphics Direct3D11 vs_5_0 ps_5_0)';
    return getParameter.call(this, parameter);
  };
})();
"#;

/// Reads status, content type and body back out of the loaded document
const SNAPSHOT_SCRIPT: &str = r#"
(() => {
  const nav = performance.getEntriesByType('navigation')[0];
  const contentType = document.contentType || '';
  const body = contentType.includes('html')
    ? document.documentElement.outerHTML
    : (document.body ? document.body.innerText : '');
  return {
    status: nav && nav.responseStatus ? nav.responseStatus : null,
    contentType,
    body,
  };
})()
"#;

/// A short scroll so the visit is not a zero-interaction page load
const SCROLL_SCRIPT: &str = "window.scrollBy(0, 200 + Math.floor(Math.random() * 400)); true";

/// Errors from the heavyweight strategy
#[derive(Debug, Error)]
pub enum BrowserError {
    #[error("failed to launch browser: {0}")]
    Launch(String),

    #[error("failed to open page: {0}")]
    Page(String),

    #[error("navigation timed out after {0:?}")]
    Timeout(Duration),

    #[error("navigation failed: {0}")]
    Navigation(String),
}

/// Starts a browser
#[async_trait]
pub trait BrowserLauncher: Send + Sync {
    async fn launch(&self) -> Result<Box<dyn BrowserHandle>, BrowserError>;
}

/// A running browser
#[async_trait]
pub trait BrowserHandle: Send + Sync {
    async fn open_page(&self) -> Result<Box<dyn BrowserPage>, BrowserError>;

    async fn close(&mut self) -> Result<(), BrowserError>;
}

/// A single page (tab)
#[async_trait]
pub trait BrowserPage: Send + Sync {
    /// Applies the header profile, navigates and snapshots the response
    async fn navigate(
        &mut self,
        url: &str,
        headers: &HeaderProfile,
        timeout: Duration,
    ) -> Result<RawResponse, BrowserError>;

    async fn close(self: Box<Self>) -> Result<(), BrowserError>;
}

/// Run-scoped owner of the browser
///
/// Launches on first use and keeps the browser for later fallbacks. The run
/// calls [`BrowserSession::close`] when it ends; if it never does, dropping
/// the chromium handle aborts its event loop and kills the process.
pub struct BrowserSession {
    launcher: Arc<dyn BrowserLauncher>,
    handle: Mutex<Option<Box<dyn BrowserHandle>>>,
    launches: AtomicUsize,
}

impl BrowserSession {
    pub fn new(launcher: Arc<dyn BrowserLauncher>) -> Self {
        Self {
            launcher,
            handle: Mutex::new(None),
            launches: AtomicUsize::new(0),
        }
    }

    /// Fetches a URL in a fresh page, launching the browser if needed
    pub async fn fetch(
        &self,
        url: &str,
        headers: &HeaderProfile,
        timeout: Duration,
    ) -> Result<RawResponse, BrowserError> {
        let mut page = {
            let mut guard = self.handle.lock().await;
            if guard.is_none() {
                tracing::info!("Launching browser for heavyweight fallback");
                *guard = Some(self.launcher.launch().await?);
                self.launches.fetch_add(1, Ordering::Relaxed);
            }

            match guard.as_ref() {
                Some(handle) => handle.open_page().await?,
                None => return Err(BrowserError::Launch("browser unavailable".to_string())),
            }
        };

        let result = page.navigate(url, headers, timeout).await;

        if let Err(e) = page.close().await {
            tracing::warn!(url, error = %e, "Failed to close browser page");
        }

        result
    }

    /// Closes the browser if one was launched
    pub async fn close(&self) {
        let mut guard = self.handle.lock().await;
        if let Some(mut handle) = guard.take() {
            match handle.close().await {
                Ok(()) => tracing::info!("Browser session closed"),
                Err(e) => tracing::warn!(error = %e, "Failed to close browser cleanly"),
            }
        }
    }

    /// Whether a browser is currently running
    pub async fn is_open(&self) -> bool {
        self.handle.lock().await.is_some()
    }

    /// Number of browsers launched over the session's life
    pub fn launches(&self) -> usize {
        self.launches.load(Ordering::Relaxed)
    }
}

/// Launches Chromium through chromiumoxide
#[derive(Debug, Clone)]
pub struct ChromiumLauncher {
    settings: BrowserSettings,
}

impl ChromiumLauncher {
    pub fn new(settings: BrowserSettings) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl BrowserLauncher for ChromiumLauncher {
    async fn launch(&self) -> Result<Box<dyn BrowserHandle>, BrowserError> {
        let (width, height) = VIEWPORTS
            .choose(&mut rand::thread_rng())
            .copied()
            .unwrap_or((1366, 768));

        let mut builder = BrowserConfig::builder()
            .window_size(width, height)
            .arg("--disable-blink-features=AutomationControlled")
            .arg("--no-sandbox")
            .arg("--disable-setuid-sandbox")
            .arg("--disable-dev-shm-usage")
            .arg("--disable-gpu");

        if !self.settings.headless {
            builder = builder.with_head();
        }
        if let Some(path) = &self.settings.chrome_executable {
            builder = builder.chrome_executable(path);
        }

        let config = builder.build().map_err(BrowserError::Launch)?;

        let (browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|e| BrowserError::Launch(e.to_string()))?;

        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                let _ = event;
            }
        });

        tracing::debug!(width, height, headless = self.settings.headless, "Chromium launched");

        Ok(Box::new(ChromiumBrowser {
            browser,
            handler_task,
        }))
    }
}

struct ChromiumBrowser {
    browser: Browser,
    handler_task: JoinHandle<()>,
}

impl Drop for ChromiumBrowser {
    fn drop(&mut self) {
        self.handler_task.abort();
    }
}

#[async_trait]
impl BrowserHandle for ChromiumBrowser {
    async fn open_page(&self) -> Result<Box<dyn BrowserPage>, BrowserError> {
        let page = self
            .browser
            .new_page("about:blank")
            .await
            .map_err(|e| BrowserError::Page(e.to_string()))?;

        Ok(Box::new(ChromiumPage { page }))
    }

    async fn close(&mut self) -> Result<(), BrowserError> {
        let closed = self
            .browser
            .close()
            .await
            .map(|_| ())
            .map_err(|e| BrowserError::Navigation(e.to_string()));
        let _ = self.browser.wait().await;
        self.handler_task.abort();
        closed
    }
}

/// The document's HTTP status, preferring the CDP navigation response
///
/// Falls back to the Navigation Timing status read inside the page. A page
/// with neither is never taken as a success.
fn response_status(navigation: Option<u16>, snapshot: Option<u16>) -> Result<u16, BrowserError> {
    navigation
        .or(snapshot)
        .ok_or_else(|| BrowserError::Navigation("response status unavailable".to_string()))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PageSnapshot {
    status: Option<u16>,
    content_type: Option<String>,
    body: String,
}

struct ChromiumPage {
    page: Page,
}

impl ChromiumPage {
    async fn harden(&self, headers: &HeaderProfile) -> Result<(), BrowserError> {
        let page_error = |e: chromiumoxide::error::CdpError| BrowserError::Page(e.to_string());

        self.page
            .execute(AddScriptToEvaluateOnNewDocumentParams::new(HARDENING_SCRIPT))
            .await
            .map_err(page_error)?;
        self.page
            .execute(SetUserAgentOverrideParams::new(headers.user_agent.clone()))
            .await
            .map_err(page_error)?;
        self.page
            .execute(EnableParams::default())
            .await
            .map_err(page_error)?;
        self.page
            .execute(SetExtraHttpHeadersParams::new(Headers::new(
                serde_json::Value::Object(headers.extra_browser_headers()),
            )))
            .await
            .map_err(page_error)?;

        Ok(())
    }
}

#[async_trait]
impl BrowserPage for ChromiumPage {
    async fn navigate(
        &mut self,
        url: &str,
        headers: &HeaderProfile,
        timeout: Duration,
    ) -> Result<RawResponse, BrowserError> {
        self.harden(headers).await?;

        let navigation = async {
            self.page.goto(url).await?;
            self.page.wait_for_navigation_response().await
        };
        let request = match tokio::time::timeout(timeout, navigation).await {
            Ok(Ok(request)) => request,
            Ok(Err(e)) => return Err(BrowserError::Navigation(e.to_string())),
            Err(_) => return Err(BrowserError::Timeout(timeout)),
        };
        let navigation_status = request
            .as_ref()
            .and_then(|request| request.response.as_ref())
            .and_then(|response| u16::try_from(response.status).ok());

        // Best-effort; a failed scroll does not invalidate the page
        let _ = self.page.evaluate(SCROLL_SCRIPT).await;

        let snapshot: PageSnapshot = self
            .page
            .evaluate(SNAPSHOT_SCRIPT)
            .await
            .map_err(|e| BrowserError::Navigation(e.to_string()))?
            .into_value()
            .map_err(|e| BrowserError::Navigation(format!("unreadable page snapshot: {e:?}")))?;

        Ok(RawResponse {
            status: response_status(navigation_status, snapshot.status)?,
            content_type: snapshot.content_type.filter(|ct| !ct.is_empty()),
            body: snapshot.body,
        })
    }

    async fn close(self: Box<Self>) -> Result<(), BrowserError> {
        self.page
            .close()
            .await
            .map_err(|e| BrowserError::Page(e.to_string()))
    }
}
