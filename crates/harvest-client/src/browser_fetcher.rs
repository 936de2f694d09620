use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chromiumoxide::{Browser, BrowserConfig, Page};
use futures::StreamExt;
use harvest_core::error::AppError;
use harvest_core::traits::Fetcher;
use url::Url;

use crate::fetcher::{BROWSER_USER_AGENT, validate_url};

/// Hides the automation flag some platforms check before serving metadata.
const HIDE_WEBDRIVER: &str =
    "Object.defineProperty(navigator, 'webdriver', { get: () => undefined })";

/// Headless-browser fetcher using Chromium via the Chrome DevTools Protocol.
///
/// Renders JavaScript before returning the HTML, which YouTube and
/// Dailymotion need for channel metadata. One Chromium process is shared by
/// all clones; each fetch opens a tab and closes it afterwards.
#[derive(Clone)]
pub struct BrowserFetcher {
    browser: Arc<Browser>,
    timeout: Duration,
    settle: Duration,
}

impl BrowserFetcher {
    pub async fn new() -> Result<Self, AppError> {
        Self::with_timeout(Duration::from_secs(30)).await
    }

    pub async fn with_timeout(timeout: Duration) -> Result<Self, AppError> {
        let mut builder = BrowserConfig::builder().no_sandbox().disable_default_args();

        if let Some(bin) = find_chrome_binary() {
            tracing::info!(binary = %bin.display(), "Using Chrome binary");
            builder = builder.chrome_executable(bin);
        }

        let config = builder
            .arg("--headless=new")
            .arg("--disable-gpu")
            .arg("--disable-dev-shm-usage")
            .arg("--disable-extensions")
            .arg("--disable-blink-features=AutomationControlled")
            .arg("--mute-audio")
            .arg("--no-first-run")
            .arg(format!("--user-agent={BROWSER_USER_AGENT}"))
            .build()
            .map_err(|e| AppError::ConfigError(format!("Browser config error: {e}")))?;

        let (browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|e| AppError::ConfigError(format!("Failed to launch browser: {e}")))?;

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
            timeout,
            settle: Duration::from_secs(2),
        })
    }

    /// Extra wait after `<body>` appears, for late metadata scripts.
    pub fn with_settle_delay(mut self, settle: Duration) -> Self {
        self.settle = settle;
        self
    }
}

/// Locate a real Chrome/Chromium binary. `CHROME_BIN` wins; `None` lets
/// chromiumoxide do its own lookup.
fn find_chrome_binary() -> Option<PathBuf> {
    if let Ok(p) = std::env::var("CHROME_BIN") {
        let path = PathBuf::from(p);
        if path.exists() {
            return Some(path);
        }
    }

    [
        "/snap/chromium/current/usr/lib/chromium-browser/chrome",
        "/usr/bin/google-chrome-stable",
        "/usr/bin/google-chrome",
        "/usr/bin/chromium",
        "/usr/bin/chromium-browser",
    ]
    .iter()
    .map(PathBuf::from)
    .find(|p| p.exists())
}

/// A browser tab that can be closed.
trait Tab: Send + 'static {
    fn close(self) -> impl Future<Output = Result<(), String>> + Send;
}

impl Tab for Page {
    async fn close(self) -> Result<(), String> {
        Page::close(self).await.map_err(|e| e.to_string())
    }
}

/// Closes its tab when dropped, so errors, timeouts and cancelled fetches
/// do not leave tabs open in the shared browser.
struct CloseOnDrop<T: Tab> {
    tab: Option<T>,
}

impl<T: Tab> CloseOnDrop<T> {
    fn new(tab: T) -> Self {
        Self { tab: Some(tab) }
    }

    async fn close(mut self) {
        if let Some(tab) = self.tab.take() {
            close_tab(tab).await;
        }
    }
}

impl<T: Tab> Drop for CloseOnDrop<T> {
    fn drop(&mut self) {
        let Some(tab) = self.tab.take() else { return };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(close_tab(tab));
            }
            Err(_) => tracing::warn!("No runtime to close an abandoned browser tab"),
        }
    }
}

async fn close_tab<T: Tab>(tab: T) {
    if let Err(e) = tab.close().await {
        tracing::warn!(error = %e, "Failed to close browser tab");
    }
}

impl BrowserFetcher {
    async fn render(&self, page: &Page, target: &Url) -> Result<String, AppError> {
        if let Err(e) = page.evaluate_on_new_document(HIDE_WEBDRIVER).await {
            tracing::debug!(error = %e, "Could not install webdriver override");
        }
        page.goto(target.as_str())
            .await
            .map_err(|e| AppError::NetworkError(format!("Failed to navigate to {target}: {e}")))?;
        page.find_element("body")
            .await
            .map_err(|e| AppError::UnsupportedContent(format!("Page did not render body: {e}")))?;
        tokio::time::sleep(self.settle).await;

        page.content()
            .await
            .map_err(|e| AppError::NetworkError(format!("Failed to read page content: {e}")))
    }
}

impl Fetcher for BrowserFetcher {
    async fn fetch(&self, url: &str) -> Result<String, AppError> {
        let target = validate_url(url)?;

        let opened = tokio::time::timeout(self.timeout, self.browser.new_page("about:blank")).await;
        let page = match opened {
            Ok(page) => {
                page.map_err(|e| AppError::NetworkError(format!("Failed to open tab: {e}")))?
            }
            Err(_) => return Err(AppError::Timeout(self.timeout)),
        };
        let guard = CloseOnDrop::new(page.clone());

        let result = match tokio::time::timeout(self.timeout, self.render(&page, &target)).await {
            Ok(result) => result,
            Err(_) => Err(AppError::Timeout(self.timeout)),
        };
        guard.close().await;
        result
    }
}
