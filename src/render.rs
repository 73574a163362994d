use crate::types::{PipelineError, Result};
use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::network::SetUserAgentOverrideParams;
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, warn};
use url::Url;

/// Seam for the rendered-fetch tier so the extractor (and tests) never
/// depend on a real browser being installed.
#[async_trait]
pub trait PageRenderer: Send + Sync {
    /// Returns the fully rendered HTML for `url`.
    async fn render(&self, url: &str) -> Result<String>;
}

/// Minimum gap between rendered fetches against the same domain.
const DOMAIN_GAP: Duration = Duration::from_secs(2);

const PAGE_TIMEOUT: Duration = Duration::from_secs(60);

/// Browser identities rotated across rendered fetches.
const USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/126.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/126.0.0.0 Safari/537.36",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/126.0.0.0 Safari/537.36",
];

/// One shared headless-Chromium session with a fixed cap on concurrent
/// pages and a per-domain next-allowed-time map.
pub struct ChromiumRenderer {
    browser: Browser,
    pages: Semaphore,
    next_allowed: Mutex<HashMap<String, Instant>>,
    ua_index: AtomicUsize,
}

impl ChromiumRenderer {
    /// Launches the browser and drives its event handler on a background
    /// task. Fails cleanly when no Chromium binary is available; callers
    /// treat that as "rendered tier unavailable".
    pub async fn launch(max_pages: usize) -> Result<Arc<Self>> {
        let config = BrowserConfig::builder()
            .no_sandbox()
            .build()
            .map_err(PipelineError::Render)?;
        let (browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|e| PipelineError::Render(e.to_string()))?;

        tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    debug!(error = %e, "browser handler event error");
                }
            }
        });

        Ok(Arc::new(Self {
            browser,
            pages: Semaphore::new(max_pages),
            next_allowed: Mutex::new(HashMap::new()),
            ua_index: AtomicUsize::new(0),
        }))
    }

    async fn wait_for_domain(&self, url: &str) {
        let Some(domain) = Url::parse(url)
            .ok()
            .and_then(|u| u.host_str().map(|h| h.to_string()))
        else {
            return;
        };

        let wait = {
            let mut map = self.next_allowed.lock().await;
            let now = Instant::now();
            let allowed_at = map.get(&domain).copied().unwrap_or(now);
            let start = allowed_at.max(now);
            map.insert(domain.clone(), start + DOMAIN_GAP);
            start.saturating_duration_since(now)
        };
        if !wait.is_zero() {
            debug!(%domain, ?wait, "domain rate limit");
            tokio::time::sleep(wait).await;
        }
    }

    fn next_user_agent(&self) -> &'static str {
        let i = self.ua_index.fetch_add(1, Ordering::Relaxed);
        USER_AGENTS[i % USER_AGENTS.len()]
    }
}

#[async_trait]
impl PageRenderer for ChromiumRenderer {
    async fn render(&self, url: &str) -> Result<String> {
        let _permit = self
            .pages
            .acquire()
            .await
            .map_err(|_| PipelineError::Render("page pool closed".to_string()))?;
        self.wait_for_domain(url).await;

        let ua = SetUserAgentOverrideParams::builder()
            .user_agent(self.next_user_agent())
            .build()
            .map_err(PipelineError::Render)?;

        let result = tokio::time::timeout(PAGE_TIMEOUT, async {
            let page = self
                .browser
                .new_page("about:blank")
                .await
                .map_err(|e| PipelineError::Render(e.to_string()))?;
            let html = async {
                page.set_user_agent(ua)
                    .await
                    .map_err(|e| PipelineError::Render(e.to_string()))?;
                page.goto(url)
                    .await
                    .map_err(|e| PipelineError::Render(e.to_string()))?;
                page.wait_for_navigation()
                    .await
                    .map_err(|e| PipelineError::Render(e.to_string()))?;
                page.content()
                    .await
                    .map_err(|e| PipelineError::Render(e.to_string()))
            }
            .await;

            // Pages hold CDP connections; close explicitly win or lose.
            if let Err(e) = page.close().await {
                warn!(%url, error = %e, "failed to close page");
            }
            html
        })
        .await;

        match result {
            Ok(html) => html,
            Err(_) => Err(PipelineError::Render(format!("render timed out: {url}"))),
        }
    }
}
