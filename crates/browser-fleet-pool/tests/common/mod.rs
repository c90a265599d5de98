//! In-test driver: browsers are counters, launches can be slowed down.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use browser_fleet_pool::{BrowserDriver, BrowserHandle, LaunchOptions, PageId};

#[derive(Default)]
pub struct TestBrowser {
    pub closed: AtomicBool,
    pub open_pages: AtomicUsize,
    next_page: AtomicUsize,
}

#[async_trait]
impl BrowserHandle for TestBrowser {
    async fn new_page(&self) -> anyhow::Result<PageId> {
        self.open_pages.fetch_add(1, Ordering::SeqCst);
        let n = self.next_page.fetch_add(1, Ordering::SeqCst);
        Ok(PageId::new(format!("tab-{n}")))
    }

    async fn close_page(&self, _page: &PageId) -> anyhow::Result<()> {
        self.open_pages.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }

    async fn probe(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn close(&self) -> anyhow::Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
pub struct TestDriver {
    pub browsers: Mutex<Vec<Arc<TestBrowser>>>,
    pub launch_delay: Option<Duration>,
    pub fail: AtomicBool,
}

impl TestDriver {
    pub fn slow(delay: Duration) -> Self {
        Self {
            launch_delay: Some(delay),
            ..Self::default()
        }
    }

    pub fn launched(&self) -> usize {
        self.browsers.lock().unwrap().len()
    }

    pub fn running(&self) -> usize {
        self.browsers
            .lock()
            .unwrap()
            .iter()
            .filter(|b| !b.closed.load(Ordering::SeqCst))
            .count()
    }
}

#[async_trait]
impl BrowserDriver for TestDriver {
    async fn launch(&self, _options: &LaunchOptions) -> anyhow::Result<Arc<dyn BrowserHandle>> {
        if let Some(delay) = self.launch_delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail.load(Ordering::SeqCst) {
            anyhow::bail!("no chrome binary");
        }
        let browser = Arc::new(TestBrowser::default());
        self.browsers.lock().unwrap().push(browser.clone());
        Ok(browser)
    }
}
