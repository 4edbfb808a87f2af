use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chromiumoxide::cdp::browser_protocol::fetch::{
    ContinueRequestParams, EnableParams, EventRequestPaused, FailRequestParams,
};
use chromiumoxide::cdp::browser_protocol::network::{ErrorReason, ResourceType};
use chromiumoxide::{Browser, BrowserConfig, Page};
use futures::StreamExt;
use kestrel_core::error::AppError;
use kestrel_core::filter::{ResourceFilter, ResourceKind};
use kestrel_core::traits::{Fetcher, SessionFactory};
use tokio::task::JoinHandle;

const BLANK_PAGE: &str = "about:blank";
const HEAP_USED_SCRIPT: &str =
    "(performance.memory && performance.memory.usedJSHeapSize) || 0";

/// One browser tab held by the resource pool.
///
/// The interceptor task answers paused sub-requests for this tab and is
/// aborted when the session closes.
pub struct BrowserSession {
    page: Page,
    interceptor: Option<JoinHandle<()>>,
}

/// Launches a headless Chromium and opens pooled tabs on it.
///
/// A single Chromium process backs every session; the CDP handler loop runs
/// on its own task for the lifetime of the factory.
pub struct BrowserSessionFactory {
    browser: Arc<Browser>,
    handler: JoinHandle<()>,
}

impl BrowserSessionFactory {
    /// Launches the browser. Requires a Chromium / Chrome binary reachable
    /// via `CHROME_BIN`, a well-known install path, or `$PATH`.
    pub async fn launch() -> Result<Self, AppError> {
        let mut builder = BrowserConfig::builder().no_sandbox().disable_default_args();

        // Snap-packaged Chromium ships a wrapper that rejects the headless
        // flags, so prefer the real binary when one can be found.
        if let Some(bin) = find_chrome_binary() {
            tracing::info!(binary = %bin.display(), "Using Chrome binary");
            builder = builder.chrome_executable(bin);
        }

        let config = builder
            .arg("--headless=new")
            .arg("--disable-gpu")
            .arg("--disable-dev-shm-usage")
            .arg("--disable-extensions")
            .arg("--disable-popup-blocking")
            .arg("--disable-translate")
            .arg("--no-first-run")
            .build()
            .map_err(|e| AppError::ConfigError(format!("Browser config error: {e}")))?;

        let (browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|e| AppError::Generic(format!("Failed to launch browser: {e}")))?;

        let handler = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    tracing::warn!(error = %e, "Browser CDP handler error");
                    break;
                }
            }
        });

        Ok(Self {
            browser: Arc::new(browser),
            handler,
        })
    }
}

impl Drop for BrowserSessionFactory {
    fn drop(&mut self) {
        self.handler.abort();
    }
}

impl SessionFactory for BrowserSessionFactory {
    type Session = BrowserSession;

    async fn create(&self) -> Result<BrowserSession, AppError> {
        let page = self
            .browser
            .new_page(BLANK_PAGE)
            .await
            .map_err(|e| AppError::Generic(format!("Failed to open tab: {e}")))?;
        Ok(BrowserSession {
            page,
            interceptor: None,
        })
    }

    async fn install_filter(
        &self,
        session: &mut BrowserSession,
        filter: &ResourceFilter,
    ) -> Result<(), AppError> {
        let mut paused = session
            .page
            .event_listener::<EventRequestPaused>()
            .await
            .map_err(|e| AppError::Generic(format!("Failed to listen for requests: {e}")))?;
        session
            .page
            .execute(EnableParams::default())
            .await
            .map_err(|e| AppError::Generic(format!("Failed to enable interception: {e}")))?;

        let page = session.page.clone();
        let filter = filter.clone();
        let interceptor = tokio::spawn(async move {
            while let Some(event) = paused.next().await {
                let kind = resource_kind(&event.resource_type);
                let outcome = if filter.allows(&event.request.url, kind) {
                    page.execute(ContinueRequestParams::new(event.request_id.clone()))
                        .await
                        .map(drop)
                } else {
                    tracing::trace!(url = %event.request.url, kind = kind.as_str(), "Blocked sub-request");
                    page.execute(FailRequestParams::new(
                        event.request_id.clone(),
                        ErrorReason::BlockedByClient,
                    ))
                    .await
                    .map(drop)
                };
                if let Err(e) = outcome {
                    tracing::debug!(error = %e, "Request interception stopped");
                    break;
                }
            }
        });

        if let Some(previous) = session.interceptor.replace(interceptor) {
            previous.abort();
        }
        Ok(())
    }

    async fn reset(&self, session: &mut BrowserSession) -> Result<(), AppError> {
        session
            .page
            .goto(BLANK_PAGE)
            .await
            .map_err(|e| AppError::Generic(format!("Failed to reset tab: {e}")))?;
        Ok(())
    }

    async fn close(&self, session: BrowserSession) {
        if let Some(interceptor) = session.interceptor {
            interceptor.abort();
        }
        if let Err(e) = session.page.close().await {
            tracing::debug!(error = %e, "Failed to close tab");
        }
    }

    async fn memory_usage_mb(&self, session: &mut BrowserSession) -> Option<f64> {
        let bytes = session
            .page
            .evaluate(HEAP_USED_SCRIPT)
            .await
            .ok()?
            .into_value::<f64>()
            .ok()?;
        (bytes > 0.0).then(|| bytes / (1024.0 * 1024.0))
    }
}

/// Renders pages in a pooled browser tab and returns the resulting DOM.
///
/// Suitable for SPAs and lazy-loaded content that plain HTTP fetching
/// misses.
#[derive(Debug, Clone, Copy, Default)]
pub struct BrowserFetcher;

impl BrowserFetcher {
    pub fn new() -> Self {
        Self
    }
}

impl Fetcher<BrowserSession> for BrowserFetcher {
    async fn fetch(
        &self,
        session: &mut BrowserSession,
        url: &str,
        timeout: Duration,
    ) -> Result<String, AppError> {
        let page = &session.page;
        let render = async {
            page.goto(url)
                .await
                .map_err(|e| AppError::FetchError(format!("Failed to navigate to {url}: {e}")))?;

            // <body> present is the minimal signal that the page rendered.
            page.find_element("body")
                .await
                .map_err(|e| AppError::FetchError(format!("Page did not render body: {e}")))?;

            page.content()
                .await
                .map_err(|e| AppError::FetchError(format!("Failed to read page content: {e}")))
        };

        tokio::time::timeout(timeout, render)
            .await
            .map_err(|_| AppError::FetchTimeout(timeout.as_millis() as u64))?
    }
}

fn resource_kind(resource_type: &ResourceType) -> ResourceKind {
    match resource_type {
        ResourceType::Document => ResourceKind::Document,
        ResourceType::Stylesheet => ResourceKind::Stylesheet,
        ResourceType::Script => ResourceKind::Script,
        ResourceType::Image => ResourceKind::Image,
        ResourceType::Media => ResourceKind::Media,
        ResourceType::Font => ResourceKind::Font,
        ResourceType::Xhr => ResourceKind::Xhr,
        ResourceType::Fetch => ResourceKind::Fetch,
        _ => ResourceKind::Other,
    }
}

/// Locate a real Chrome/Chromium binary, honouring `CHROME_BIN` first.
///
/// Returns `None` to let `chromiumoxide` do its own lookup.
fn find_chrome_binary() -> Option<PathBuf> {
    const CANDIDATES: &[&str] = &[
        "/snap/chromium/current/usr/lib/chromium-browser/chrome",
        "/var/lib/flatpak/exports/bin/org.chromium.Chromium",
        "/usr/bin/google-chrome-stable",
        "/usr/bin/google-chrome",
        "/usr/bin/chromium",
        "/usr/bin/chromium-browser",
    ];

    if let Ok(p) = std::env::var("CHROME_BIN") {
        let path = PathBuf::from(p);
        if path.exists() {
            return Some(path);
        }
    }

    CANDIDATES.iter().map(PathBuf::from).find(|p| p.exists())
}
