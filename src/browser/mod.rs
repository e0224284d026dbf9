//! Persistent browser sessions for the fallback fetch path.
//!
//! One headless-browser page per domain, reused across fetches so cookies
//! and fingerprint survive between requests to the same site. The pool is
//! bounded; the least-recently-used domain's session is closed to make room.
//! Invoked only after the plain-HTTP path fails with a network-class error.

mod sessions;

pub use sessions::LruSessions;

use async_trait::async_trait;

use crate::config::BrowserPoolConfig;
use crate::error::FetchResult;

/// Content retrieved through a browser session.
#[derive(Debug, Clone)]
pub struct BrowserFetchResponse {
    pub url: String,
    pub final_url: String,
    pub status: u16,
    pub content: String,
    pub content_type: String,
}

/// Fallback-fetch seam. The orchestrator depends on this trait, not the
/// concrete pool, so the session manager is constructor-injected and
/// replaceable in tests.
#[async_trait]
pub trait SessionFetcher: Send + Sync {
    /// Fetch a URL through the domain's persistent session, creating the
    /// session on demand.
    async fn fetch(&self, domain: &str, url: &str) -> FetchResult<BrowserFetchResponse>;

    /// Close every live session and the underlying browser.
    async fn close_all(&self);
}

#[cfg(feature = "browser")]
mod pool {
    use std::sync::Arc;
    use std::time::Duration;

    use anyhow::{Context, Result};
    use async_trait::async_trait;
    use chromiumoxide::handler::HandlerConfig;
    use chromiumoxide::{Browser, BrowserConfig, Page};
    use futures::StreamExt;
    use tokio::sync::Mutex;
    use tracing::{debug, info, warn};

    use crate::error::{FetchError, FetchResult};

    use super::{BrowserFetchResponse, BrowserPoolConfig, LruSessions, SessionFetcher};

    /// Common Chrome executable paths to check.
    const CHROME_PATHS: &[&str] = &[
        "/usr/bin/google-chrome",
        "/usr/bin/google-chrome-stable",
        "/usr/bin/chromium",
        "/usr/bin/chromium-browser",
        "/snap/bin/chromium",
        "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
        "/Applications/Chromium.app/Contents/MacOS/Chromium",
        "/opt/google/chrome/google-chrome",
    ];

    /// Pool of persistent per-domain browser sessions, LRU-bounded.
    pub struct BrowserSessionPool {
        config: BrowserPoolConfig,
        browser: Mutex<Option<Arc<Browser>>>,
        sessions: Mutex<LruSessions<Page>>,
    }

    impl BrowserSessionPool {
        pub fn new(config: BrowserPoolConfig) -> Self {
            let sessions = LruSessions::new(config.max_sessions);
            Self {
                config,
                browser: Mutex::new(None),
                sessions: Mutex::new(sessions),
            }
        }

        fn find_chrome() -> Result<std::path::PathBuf> {
            for path in CHROME_PATHS {
                let p = std::path::Path::new(path);
                if p.exists() {
                    info!("Found Chrome at: {}", path);
                    return Ok(p.to_path_buf());
                }
            }
            for cmd in &[
                "google-chrome",
                "google-chrome-stable",
                "chromium",
                "chromium-browser",
            ] {
                if let Ok(output) = std::process::Command::new("which").arg(cmd).output() {
                    if output.status.success() {
                        let path = String::from_utf8_lossy(&output.stdout).trim().to_string();
                        if !path.is_empty() {
                            info!("Found Chrome in PATH: {}", path);
                            return Ok(std::path::PathBuf::from(path));
                        }
                    }
                }
            }
            Err(anyhow::anyhow!(
                "Chrome/Chromium not found; install it or set browser.remote_url"
            ))
        }

        async fn launch(&self) -> Result<Browser> {
            if let Some(remote_url) = self.config.remote_url.clone() {
                return self.connect_remote(&remote_url).await;
            }

            info!("Launching browser (headless={})", self.config.headless);
            let chrome_path = Self::find_chrome()?;

            let mut builder = BrowserConfig::builder().chrome_executable(chrome_path);
            if !self.config.headless {
                builder = builder.with_head();
            }
            builder = builder
                .arg("--disable-blink-features=AutomationControlled")
                .arg("--disable-infobars")
                .arg("--disable-dev-shm-usage")
                .arg("--no-first-run")
                .arg("--no-default-browser-check")
                .arg("--disable-background-networking")
                .arg("--disable-sync")
                .arg("--no-sandbox")
                .arg("--disable-gpu");
            for arg in &self.config.chrome_args {
                builder = builder.arg(arg);
            }

            let browser_config = builder
                .build()
                .map_err(|e| anyhow::anyhow!("Failed to build browser config: {}", e))?;
            let (browser, mut handler) = Browser::launch(browser_config)
                .await
                .context("Failed to launch browser")?;

            tokio::spawn(async move {
                while let Some(h) = handler.next().await {
                    if h.is_err() {
                        break;
                    }
                }
            });

            Ok(browser)
        }

        async fn connect_remote(&self, url: &str) -> Result<Browser> {
            info!("Connecting to remote browser at {}", url);

            let http_url = url
                .replace("ws://", "http://")
                .replace("wss://", "https://");
            let version_url = format!("{}/json/version", http_url.trim_end_matches('/'));

            let client = reqwest::Client::new();
            let resp: serde_json::Value = client
                .get(&version_url)
                .send()
                .await
                .context("Failed to connect to remote browser")?
                .json()
                .await
                .context("Failed to parse browser version info")?;

            let ws_url = resp
                .get("webSocketDebuggerUrl")
                .and_then(|v| v.as_str())
                .ok_or_else(|| anyhow::anyhow!("No webSocketDebuggerUrl in response"))?;

            let handler_config = HandlerConfig {
                request_timeout: self.config.navigation_timeout(),
                ..Default::default()
            };
            let (browser, mut handler) = Browser::connect_with_config(ws_url, handler_config)
                .await
                .context("Failed to connect to remote browser")?;

            tokio::spawn(async move {
                while let Some(h) = handler.next().await {
                    if h.is_err() {
                        break;
                    }
                }
            });

            Ok(browser)
        }

        async fn ensure_browser(&self) -> Result<Arc<Browser>> {
            let mut guard = self.browser.lock().await;
            if let Some(browser) = guard.as_ref() {
                return Ok(browser.clone());
            }
            let browser = Arc::new(self.launch().await?);
            *guard = Some(browser.clone());
            Ok(browser)
        }

        /// Get the domain's session, creating (and possibly evicting) one.
        /// Pool mutation happens under the pool lock; page navigation never
        /// does.
        async fn get_session(&self, domain: &str) -> Result<Page> {
            if let Some(page) = self.sessions.lock().await.touch(domain) {
                debug!("Reusing browser session for {}", domain);
                return Ok(page);
            }

            let browser = self.ensure_browser().await?;
            let page = browser
                .new_page("about:blank")
                .await
                .context("Failed to open page")?;

            let closed = self.sessions.lock().await.insert(domain, page.clone());
            for victim in closed {
                debug!("Evicting browser session");
                let _ = victim.close().await;
            }
            Ok(page)
        }

        async fn navigate(&self, page: &Page, url: &str) -> Result<String> {
            let timeout = self.config.navigation_timeout();
            tokio::time::timeout(timeout, page.goto(url))
                .await
                .map_err(|_| anyhow::anyhow!("Navigation timed out after {:?}", timeout))?
                .context("Navigation failed")?;

            // Wait for the document instead of a fixed delay.
            let ready_script = r#"
                new Promise((resolve) => {
                    if (document.readyState === 'complete' || document.readyState === 'interactive') {
                        resolve(document.readyState);
                    } else {
                        document.addEventListener('DOMContentLoaded', () => resolve(document.readyState));
                        setTimeout(() => resolve('timeout'), 10000);
                    }
                })
            "#;
            match tokio::time::timeout(timeout, page.evaluate(ready_script.to_string())).await {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => debug!("Could not check ready state: {}", e),
                Err(_) => warn!("Timeout waiting for page ready state"),
            }
            tokio::time::sleep(Duration::from_millis(500)).await;

            page.content().await.context("Failed to read page content")
        }
    }

    #[async_trait]
    impl SessionFetcher for BrowserSessionPool {
        async fn fetch(&self, domain: &str, url: &str) -> FetchResult<BrowserFetchResponse> {
            let page = self.get_session(domain).await.map_err(|e| {
                FetchError::Browser {
                    url: url.to_string(),
                    message: e.to_string(),
                }
            })?;

            let content = match self.navigate(&page, url).await {
                Ok(content) => content,
                Err(e) => {
                    // A broken page poisons the session; drop it so the next
                    // fallback starts clean.
                    if let Some(stale) = self.sessions.lock().await.remove(domain) {
                        let _ = stale.close().await;
                    }
                    return Err(FetchError::Browser {
                        url: url.to_string(),
                        message: e.to_string(),
                    });
                }
            };

            let final_url = page
                .url()
                .await
                .ok()
                .flatten()
                .unwrap_or_else(|| url.to_string());

            Ok(BrowserFetchResponse {
                url: url.to_string(),
                final_url,
                status: 200, // CDP does not expose the HTTP status directly.
                content,
                content_type: "text/html".to_string(),
            })
        }

        async fn close_all(&self) {
            let pages = self.sessions.lock().await.drain();
            for page in pages {
                let _ = page.close().await;
            }
            *self.browser.lock().await = None;
        }
    }
}

#[cfg(feature = "browser")]
pub use pool::BrowserSessionPool;

// Stub for when browser support is not compiled.
#[cfg(not(feature = "browser"))]
pub struct BrowserSessionPool {
    #[allow(dead_code)]
    config: BrowserPoolConfig,
}

#[cfg(not(feature = "browser"))]
impl BrowserSessionPool {
    pub fn new(config: BrowserPoolConfig) -> Self {
        Self { config }
    }
}

#[cfg(not(feature = "browser"))]
#[async_trait]
impl SessionFetcher for BrowserSessionPool {
    async fn fetch(&self, _domain: &str, url: &str) -> FetchResult<BrowserFetchResponse> {
        Err(crate::error::FetchError::Browser {
            url: url.to_string(),
            message: "Browser support not compiled. Rebuild with: cargo build --features browser"
                .to_string(),
        })
    }

    async fn close_all(&self) {}
}
