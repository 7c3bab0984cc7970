//! Tier 2: headless-browser rendering for script-driven portals.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use tracing::debug;
use url::Url;

use councilgen_shared::{CouncilgenError, ExtractionError, Result};

use crate::fetch::{FetchedPage, validate_target};

/// Produces fully rendered HTML for a URL.
#[async_trait]
pub trait PageRenderer: Send + Sync {
    /// Navigate to `url` and return the DOM once `wait_for` matches, or once
    /// the network is idle when no selector is given.
    async fn render(
        &self,
        url: &Url,
        wait_for: Option<&str>,
        timeout: Duration,
    ) -> std::result::Result<FetchedPage, ExtractionError>;

    /// Renderer name for tracing.
    fn name(&self) -> &str;
}

// ---------------------------------------------------------------------------
// HttpRenderer
// ---------------------------------------------------------------------------

/// Renders through a browserless-compatible service (`POST /content`).
pub struct HttpRenderer {
    client: Client,
    endpoint: String,
    allow_private_hosts: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ContentRequest<'a> {
    url: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    wait_for_selector: Option<WaitForSelector<'a>>,
    goto_options: GotoOptions,
}

#[derive(Serialize)]
struct WaitForSelector<'a> {
    selector: &'a str,
    timeout: u64,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GotoOptions {
    wait_until: &'static str,
    timeout: u64,
}

impl HttpRenderer {
    pub fn new(endpoint: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .build()
            .map_err(|e| CouncilgenError::Network(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            allow_private_hosts: false,
        })
    }

    /// Allow rendering localhost/private targets (for tests).
    pub fn allow_private_hosts(mut self) -> Self {
        self.allow_private_hosts = true;
        self
    }
}

#[async_trait]
impl PageRenderer for HttpRenderer {
    async fn render(
        &self,
        url: &Url,
        wait_for: Option<&str>,
        timeout: Duration,
    ) -> std::result::Result<FetchedPage, ExtractionError> {
        validate_target(url, self.allow_private_hosts)?;
        debug!(%url, wait_for, "rendered fetch via service");

        let budget_ms = timeout.as_millis() as u64;
        let body = ContentRequest {
            url: url.as_str(),
            wait_for_selector: wait_for.map(|selector| WaitForSelector {
                selector,
                timeout: budget_ms,
            }),
            goto_options: GotoOptions {
                wait_until: if wait_for.is_some() { "load" } else { "networkidle2" },
                timeout: budget_ms,
            },
        };

        let render_err = |message: String| ExtractionError::Render {
            url: url.to_string(),
            message,
        };
        let timed_out = || ExtractionError::RenderTimeout {
            url: url.to_string(),
            timeout,
        };

        let call = async {
            let response = self
                .client
                .post(format!("{}/content", self.endpoint))
                .json(&body)
                .timeout(timeout)
                .send()
                .await
                .map_err(|e| if e.is_timeout() { timed_out() } else { render_err(e.to_string()) })?;

            let status = response.status();
            if !status.is_success() {
                let detail = response.text().await.unwrap_or_default();
                return Err(render_err(format!(
                    "rendering service returned HTTP {status}: {}",
                    detail.chars().take(200).collect::<String>()
                )));
            }

            let html = response
                .text()
                .await
                .map_err(|e| if e.is_timeout() { timed_out() } else { render_err(e.to_string()) })?;

            Ok(FetchedPage {
                url: url.to_string(),
                status: status.as_u16(),
                html,
            })
        };

        tokio::time::timeout(timeout, call)
            .await
            .map_err(|_| timed_out())?
    }

    fn name(&self) -> &str {
        "http"
    }
}

// ---------------------------------------------------------------------------
// ChromiumRenderer
// ---------------------------------------------------------------------------

#[cfg(feature = "chromium")]
pub use chromium::ChromiumRenderer;

#[cfg(feature = "chromium")]
mod chromium {
    use std::time::{Duration, Instant};

    use async_trait::async_trait;
    use chromiumoxide::Page;
    use chromiumoxide::browser::{Browser, BrowserConfig};
    use futures::StreamExt;
    use tracing::{debug, warn};
    use url::Url;

    use councilgen_shared::{CouncilgenError, ExtractionError, Result};

    use super::PageRenderer;
    use crate::fetch::{FetchedPage, validate_target};

    /// Poll interval while waiting for a selector to appear.
    const SELECTOR_POLL: Duration = Duration::from_millis(250);
    /// Quiet window after which the network counts as idle.
    const NETWORK_IDLE: Duration = Duration::from_millis(500);

    /// Drives a local headless Chrome over CDP.
    pub struct ChromiumRenderer {
        browser: Browser,
        handler: tokio::task::JoinHandle<()>,
        allow_private_hosts: bool,
    }

    impl ChromiumRenderer {
        /// Launch a headless browser. `chrome_executable` overrides detection.
        pub async fn launch(chrome_executable: Option<&str>) -> Result<Self> {
            let mut builder = BrowserConfig::builder();
            if let Some(path) = chrome_executable {
                builder = builder.chrome_executable(path);
            }
            let config = builder
                .build()
                .map_err(|e| CouncilgenError::config(format!("invalid browser config: {e}")))?;

            let (browser, mut handler) = Browser::launch(config)
                .await
                .map_err(|e| CouncilgenError::Network(format!("failed to launch browser: {e}")))?;

            let handler = tokio::spawn(async move {
                while let Some(event) = handler.next().await {
                    if let Err(e) = event {
                        warn!(error = %e, "browser handler stopped");
                        break;
                    }
                }
            });

            Ok(Self {
                browser,
                handler,
                allow_private_hosts: false,
            })
        }

        /// Allow rendering localhost/private targets (for tests).
        pub fn allow_private_hosts(mut self) -> Self {
            self.allow_private_hosts = true;
            self
        }
    }

    impl Drop for ChromiumRenderer {
        fn drop(&mut self) {
            self.handler.abort();
        }
    }

    /// Wait until no new resource has started loading for [`NETWORK_IDLE`].
    async fn wait_for_network_idle(page: &Page) {
        let mut seen = resource_count(page).await;
        loop {
            tokio::time::sleep(NETWORK_IDLE).await;
            let now = resource_count(page).await;
            if now == seen {
                return;
            }
            seen = now;
        }
    }

    async fn resource_count(page: &Page) -> Option<u64> {
        page.evaluate("performance.getEntriesByType('resource').length")
            .await
            .ok()?
            .into_value::<u64>()
            .ok()
    }

    /// Navigate, wait, and read the DOM of an already open tab.
    async fn load(
        page: &Page,
        url: &Url,
        wait_for: Option<&str>,
    ) -> std::result::Result<FetchedPage, ExtractionError> {
        let render_err = |e: String| ExtractionError::Render {
            url: url.to_string(),
            message: e,
        };

        page.goto(url.as_str())
            .await
            .map_err(|e| render_err(e.to_string()))?;

        match wait_for {
            Some(selector) => {
                while page.find_element(selector).await.is_err() {
                    tokio::time::sleep(SELECTOR_POLL).await;
                }
            }
            None => wait_for_network_idle(page).await,
        }

        let html = page.content().await.map_err(|e| render_err(e.to_string()))?;
        let final_url = page
            .url()
            .await
            .ok()
            .flatten()
            .unwrap_or_else(|| url.to_string());

        Ok(FetchedPage {
            url: final_url,
            status: 200,
            html,
        })
    }

    #[async_trait]
    impl PageRenderer for ChromiumRenderer {
        async fn render(
            &self,
            url: &Url,
            wait_for: Option<&str>,
            timeout: Duration,
        ) -> std::result::Result<FetchedPage, ExtractionError> {
            validate_target(url, self.allow_private_hosts)?;
            debug!(%url, wait_for, "rendered fetch via chromium");

            let started = Instant::now();
            let timed_out = || ExtractionError::RenderTimeout {
                url: url.to_string(),
                timeout,
            };

            let page = tokio::time::timeout(timeout, self.browser.new_page("about:blank"))
                .await
                .map_err(|_| timed_out())?
                .map_err(|e| ExtractionError::Render {
                    url: url.to_string(),
                    message: e.to_string(),
                })?;

            let remaining = timeout.saturating_sub(started.elapsed());
            let outcome = tokio::time::timeout(remaining, load(&page, url, wait_for)).await;

            // The tab is closed on every exit path, including timeouts.
            if let Err(e) = page.close().await {
                debug!(%url, error = %e, "page close failed");
            }

            outcome.map_err(|_| timed_out())?
        }

        fn name(&self) -> &str {
            "chromium"
        }
    }

}
