//! Chrome/Chromium driver over CDP.
//!
//! Only built with the `browser` feature.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use chromiumoxide::Page;
use chromiumoxide::browser::{Browser, BrowserConfig};
use futures::StreamExt;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::driver::{BrowserDriver, BrowserHandle, LaunchOptions, PageId, ResourceUsage};

/// Launches local Chrome/Chromium processes.
#[derive(Debug, Default, Clone)]
pub struct ChromiumDriver;

impl ChromiumDriver {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl BrowserDriver for ChromiumDriver {
    async fn launch(&self, options: &LaunchOptions) -> anyhow::Result<Arc<dyn BrowserHandle>> {
        let mut builder = BrowserConfig::builder()
            .args(options.effective_args())
            .request_timeout(options.request_timeout);
        if !options.headless {
            builder = builder.with_head();
        }
        if let Some(path) = &options.chrome_path {
            builder = builder.chrome_executable(path);
        }
        let config = builder
            .build()
            .map_err(|e| anyhow::anyhow!("invalid browser config: {e}"))?;

        let (browser, mut handler) = Browser::launch(config)
            .await
            .context("failed to launch Chrome")?;

        let events = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    debug!(error = %e, "CDP handler stopped");
                    break;
                }
            }
        });

        info!(
            headless = options.headless,
            proxy = options.proxy.as_ref().map(|p| p.key()).as_deref().unwrap_or("direct"),
            "Chrome launched"
        );
        Ok(Arc::new(ChromiumHandle {
            browser: Mutex::new(browser),
            pages: Mutex::new(HashMap::new()),
            events,
        }))
    }
}

/// One running Chrome process.
pub struct ChromiumHandle {
    browser: Mutex<Browser>,
    pages: Mutex<HashMap<PageId, Page>>,
    events: JoinHandle<()>,
}

#[async_trait]
impl BrowserHandle for ChromiumHandle {
    async fn new_page(&self) -> anyhow::Result<PageId> {
        let page = self
            .browser
            .lock()
            .await
            .new_page("about:blank")
            .await
            .context("failed to open page")?;
        let id = PageId::new(Uuid::new_v4().to_string());
        self.pages.lock().await.insert(id.clone(), page);
        Ok(id)
    }

    async fn close_page(&self, page: &PageId) -> anyhow::Result<()> {
        let Some(handle) = self.pages.lock().await.remove(page) else {
            anyhow::bail!("unknown page {page}");
        };
        handle.close().await.context("failed to close page")?;
        Ok(())
    }

    async fn probe(&self) -> anyhow::Result<()> {
        self.browser
            .lock()
            .await
            .version()
            .await
            .context("browser did not answer version query")?;
        Ok(())
    }

    async fn resource_usage(&self) -> anyhow::Result<ResourceUsage> {
        let pages: Vec<Page> = self.pages.lock().await.values().cloned().collect();
        let mut usage = ResourceUsage::default();
        for page in pages {
            for metric in page.metrics().await.context("failed to read page metrics")? {
                match metric.name.as_str() {
                    "JSHeapUsedSize" => usage.memory_mb += metric.value / (1024.0 * 1024.0),
                    "Nodes" | "JSEventListeners" => usage.handles += metric.value as u64,
                    _ => {}
                }
            }
        }
        Ok(usage)
    }

    async fn close(&self) -> anyhow::Result<()> {
        self.pages.lock().await.clear();
        let mut browser = self.browser.lock().await;
        if let Err(e) = browser.close().await {
            warn!(error = %e, "Chrome close command failed, waiting for exit");
        }
        browser.wait().await.context("failed waiting for Chrome to exit")?;
        self.events.abort();
        Ok(())
    }
}
