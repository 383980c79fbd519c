//! Long-lived headless-browser render service.
//!
//! One background task owns the browser; callers submit render requests over
//! a channel and block on a per-request reply channel. A render call never
//! outlives `render_timeout + idle_timeout` (plus a small grace) — on any
//! failure or timeout the caller gets an empty string and the service stays
//! up. Shutdown is a poison-pill message plus join.

use std::path::Path;
use std::time::Duration;

use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::handler::viewport::Viewport;
use futures::StreamExt;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

enum BrowserRequest {
    Render {
        url: String,
        reply: oneshot::Sender<String>,
    },
    Shutdown,
}

struct ServiceHandle {
    tx: mpsc::Sender<BrowserRequest>,
    task: JoinHandle<()>,
}

/// Thread-safe render facade. Started lazily on the first `render` call;
/// `shutdown` enqueues the sentinel and joins the worker.
pub struct BrowserService {
    render_timeout: Duration,
    idle_timeout: Duration,
    inner: Mutex<Option<ServiceHandle>>,
}

impl BrowserService {
    pub fn new(render_timeout: Duration, idle_timeout: Duration) -> Self {
        Self {
            render_timeout,
            idle_timeout,
            inner: Mutex::new(None),
        }
    }

    /// Render `url` to HTML. Empty string on failure, timeout, or when no
    /// browser executable is available on this machine.
    pub async fn render(&self, url: &str) -> String {
        let Some(tx) = self.ensure_started().await else {
            return String::new();
        };

        let (reply_tx, reply_rx) = oneshot::channel();
        if tx
            .send(BrowserRequest::Render {
                url: url.to_string(),
                reply: reply_tx,
            })
            .await
            .is_err()
        {
            warn!("Browser service gone; returning empty render for {}", url);
            return String::new();
        }

        let budget = self.render_timeout + self.idle_timeout + Duration::from_secs(2);
        match tokio::time::timeout(budget, reply_rx).await {
            Ok(Ok(html)) => html,
            _ => {
                warn!("Render timed out for {}", url);
                String::new()
            }
        }
    }

    async fn ensure_started(&self) -> Option<mpsc::Sender<BrowserRequest>> {
        let mut guard = self.inner.lock().await;
        if let Some(handle) = guard.as_ref() {
            return Some(handle.tx.clone());
        }

        let exe = find_browser_executable()?;
        let config = build_headless_config(&exe).ok()?;
        let (browser, mut handler) = match Browser::launch(config).await {
            Ok(pair) => pair,
            Err(e) => {
                warn!("Failed to launch browser ({}): {}", exe, e);
                return None;
            }
        };

        tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    error!("CDP handler error: {}", e);
                }
            }
        });

        let (tx, rx) = mpsc::channel(32);
        let render_timeout = self.render_timeout;
        let idle_timeout = self.idle_timeout;
        let task = tokio::spawn(service_loop(browser, rx, render_timeout, idle_timeout));

        info!("Browser service started ({})", exe);
        *guard = Some(ServiceHandle { tx: tx.clone(), task });
        Some(tx)
    }

    /// Poison-pill shutdown; joins the worker task. Idempotent.
    pub async fn shutdown(&self) {
        let handle = self.inner.lock().await.take();
        if let Some(handle) = handle {
            let _ = handle.tx.send(BrowserRequest::Shutdown).await;
            let _ = handle.task.await;
            info!("Browser service shut down");
        }
    }
}

async fn service_loop(
    mut browser: Browser,
    mut rx: mpsc::Receiver<BrowserRequest>,
    render_timeout: Duration,
    idle_timeout: Duration,
) {
    while let Some(request) = rx.recv().await {
        match request {
            BrowserRequest::Shutdown => break,
            BrowserRequest::Render { url, reply } => {
                let html = match render_page(&browser, &url, render_timeout, idle_timeout).await {
                    Ok(html) => html,
                    Err(e) => {
                        warn!("Render error for {}: {}", url, e);
                        String::new()
                    }
                };
                // Caller may have timed out and dropped the receiver.
                let _ = reply.send(html);
            }
        }
    }
    if let Err(e) = browser.close().await {
        warn!("Browser close error (non-fatal): {}", e);
    }
    let _ = browser.wait().await;
}

async fn render_page(
    browser: &Browser,
    url: &str,
    render_timeout: Duration,
    idle_timeout: Duration,
) -> anyhow::Result<String> {
    let page = tokio::time::timeout(render_timeout, browser.new_page(url)).await??;

    // Wait for the initial navigation, then give late XHRs a settle window.
    if tokio::time::timeout(render_timeout, page.wait_for_navigation())
        .await
        .is_err()
    {
        debug!("Navigation wait expired for {}", url);
    }
    tokio::time::sleep(idle_timeout).await;

    let html = page.content().await?;
    let _ = page.close().await;
    Ok(html)
}

// ── Browser executable discovery ─────────────────────────────────────────────

/// Find a usable Chromium-family executable: `CHROME_EXECUTABLE` env var,
/// then PATH, then well-known install locations.
pub fn find_browser_executable() -> Option<String> {
    if let Ok(p) = std::env::var("CHROME_EXECUTABLE") {
        if Path::new(&p).exists() {
            return Some(p);
        }
    }

    if let Ok(path_var) = std::env::var("PATH") {
        let candidates = ["google-chrome", "chromium", "chromium-browser", "chrome"];
        for dir in std::env::split_paths(&path_var) {
            for exe in candidates {
                let full = dir.join(exe);
                if full.exists() {
                    return Some(full.to_string_lossy().to_string());
                }
            }
        }
    }

    #[cfg(target_os = "linux")]
    {
        let candidates = [
            "/usr/bin/chromium",
            "/usr/bin/chromium-browser",
            "/usr/bin/google-chrome",
            "/usr/local/bin/chromium",
        ];
        for c in candidates {
            if Path::new(c).exists() {
                return Some(c.to_string());
            }
        }
    }

    #[cfg(target_os = "macos")]
    {
        let candidates = [
            "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
            "/Applications/Chromium.app/Contents/MacOS/Chromium",
        ];
        for c in candidates {
            if Path::new(c).exists() {
                return Some(c.to_string());
            }
        }
    }

    None
}

fn build_headless_config(exe: &str) -> anyhow::Result<BrowserConfig> {
    BrowserConfig::builder()
        .chrome_executable(exe)
        .viewport(Viewport {
            width: 1280,
            height: 900,
            device_scale_factor: Some(1.0),
            emulating_mobile: false,
            is_landscape: true,
            has_touch: false,
        })
        .arg("--disable-gpu")
        .arg("--no-sandbox")
        .arg("--disable-dev-shm-usage")
        .arg("--disable-extensions")
        .arg("--disable-background-networking")
        .arg("--no-first-run")
        .arg("--mute-audio")
        .build()
        .map_err(|e| anyhow::anyhow!("Failed to build browser config: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn render_without_browser_returns_empty() {
        if find_browser_executable().is_some() {
            // A real browser would launch; rendered error pages are not
            // deterministic enough to assert on here.
            return;
        }
        let service = BrowserService::new(Duration::from_secs(1), Duration::from_millis(100));
        let html = service.render("https://nonexistent.invalid/").await;
        assert!(html.is_empty());
        service.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_is_idempotent() {
        let service = BrowserService::new(Duration::from_secs(1), Duration::from_millis(100));
        service.shutdown().await;
        service.shutdown().await;
    }
}
