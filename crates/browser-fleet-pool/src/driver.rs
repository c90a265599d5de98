//! Driver traits: how the pool launches and talks to browser processes.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use browser_fleet_core::config::{LaunchConfig, ProxyConfig};

/// Options passed to [`BrowserDriver::launch`].
#[derive(Debug, Clone)]
pub struct LaunchOptions {
    pub headless: bool,
    pub chrome_path: Option<PathBuf>,
    pub args: Vec<String>,
    pub proxy: Option<ProxyConfig>,
    pub request_timeout: Duration,
}

impl LaunchOptions {
    pub fn from_config(config: &LaunchConfig) -> Self {
        Self {
            headless: config.headless,
            chrome_path: config.resolved_chrome_path(),
            args: config.args.clone(),
            proxy: None,
            request_timeout: Duration::from_millis(config.request_timeout_ms),
        }
    }

    pub fn with_proxy(mut self, proxy: Option<ProxyConfig>) -> Self {
        self.proxy = proxy;
        self
    }

    /// Launch arguments with the proxy flags appended.
    pub fn effective_args(&self) -> Vec<String> {
        let mut args = self.args.clone();
        if let Some(proxy) = &self.proxy {
            args.push(format!("--proxy-server={}", proxy.server_arg()));
            if !proxy.bypass.is_empty() {
                args.push(format!("--proxy-bypass-list={}", proxy.bypass.join(";")));
            }
        }
        args
    }
}

impl Default for LaunchOptions {
    fn default() -> Self {
        Self::from_config(&LaunchConfig::default())
    }
}

/// Identifies a page within one browser instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PageId(pub String);

impl PageId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Resource figures sampled by the driver.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ResourceUsage {
    pub memory_mb: f64,
    pub cpu_percent: f64,
    pub handles: u64,
}

/// A launched browser process.
#[async_trait]
pub trait BrowserHandle: Send + Sync {
    async fn new_page(&self) -> anyhow::Result<PageId>;

    async fn close_page(&self, page: &PageId) -> anyhow::Result<()>;

    /// Cheap liveness check.
    async fn probe(&self) -> anyhow::Result<()>;

    /// Current resource usage. Drivers that can't measure report zeros.
    async fn resource_usage(&self) -> anyhow::Result<ResourceUsage> {
        Ok(ResourceUsage::default())
    }

    async fn close(&self) -> anyhow::Result<()>;
}

/// Starts browser processes.
#[async_trait]
pub trait BrowserDriver: Send + Sync {
    async fn launch(&self, options: &LaunchOptions) -> anyhow::Result<Arc<dyn BrowserHandle>>;
}

#[cfg(test)]
pub(crate) mod fake {
    //! In-memory driver for unit tests.

    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use super::*;

    #[derive(Default)]
    pub struct FakeHandle {
        pub pages: Mutex<Vec<PageId>>,
        pub healthy: AtomicBool,
        pub closed: AtomicBool,
        pub fail_close: AtomicBool,
        pub usage: Mutex<ResourceUsage>,
        next_page: AtomicUsize,
    }

    impl FakeHandle {
        pub fn open_pages(&self) -> usize {
            self.pages.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl BrowserHandle for FakeHandle {
        async fn new_page(&self) -> anyhow::Result<PageId> {
            let n = self.next_page.fetch_add(1, Ordering::SeqCst);
            let id = PageId::new(format!("page-{n}"));
            self.pages.lock().unwrap().push(id.clone());
            Ok(id)
        }

        async fn close_page(&self, page: &PageId) -> anyhow::Result<()> {
            self.pages.lock().unwrap().retain(|p| p != page);
            Ok(())
        }

        async fn probe(&self) -> anyhow::Result<()> {
            if self.healthy.load(Ordering::SeqCst) {
                Ok(())
            } else {
                anyhow::bail!("target crashed")
            }
        }

        async fn resource_usage(&self) -> anyhow::Result<ResourceUsage> {
            Ok(*self.usage.lock().unwrap())
        }

        async fn close(&self) -> anyhow::Result<()> {
            if self.fail_close.load(Ordering::SeqCst) {
                anyhow::bail!("close refused")
            }
            self.closed.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    /// Launches [`FakeHandle`]s and remembers them.
    #[derive(Default)]
    pub struct FakeDriver {
        pub handles: Mutex<Vec<Arc<FakeHandle>>>,
        pub fail_launch: AtomicBool,
        pub launch_delay: Mutex<Option<Duration>>,
        pub launches: AtomicUsize,
        pub last_options: Mutex<Option<LaunchOptions>>,
    }

    impl FakeDriver {
        pub fn handle(&self, n: usize) -> Arc<FakeHandle> {
            self.handles.lock().unwrap()[n].clone()
        }

        pub fn live(&self) -> usize {
            self.handles
                .lock()
                .unwrap()
                .iter()
                .filter(|h| !h.closed.load(Ordering::SeqCst))
                .count()
        }
    }

    #[async_trait]
    impl BrowserDriver for FakeDriver {
        async fn launch(&self, options: &LaunchOptions) -> anyhow::Result<Arc<dyn BrowserHandle>> {
            self.launches.fetch_add(1, Ordering::SeqCst);
            *self.last_options.lock().unwrap() = Some(options.clone());
            let delay = *self.launch_delay.lock().unwrap();
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            if self.fail_launch.load(Ordering::SeqCst) {
                anyhow::bail!("chrome exited with status 1")
            }
            let handle = Arc::new(FakeHandle {
                healthy: AtomicBool::new(true),
                ..FakeHandle::default()
            });
            self.handles.lock().unwrap().push(handle.clone());
            Ok(handle)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_effective_args_include_proxy() {
        let mut proxy = ProxyConfig::new("10.0.0.5", 3128);
        proxy.username = Some("user".into());
        proxy.password = Some("secret".into());
        proxy.bypass = vec!["localhost".into(), "*.corp".into()];

        let options = LaunchOptions::default().with_proxy(Some(proxy));
        let args = options.effective_args();
        assert!(args.contains(&"--proxy-server=http://10.0.0.5:3128".to_string()));
        assert!(args.contains(&"--proxy-bypass-list=localhost;*.corp".to_string()));
        assert!(args.iter().all(|a| !a.contains("secret")));
    }

    #[test]
    fn test_page_id_display() {
        assert_eq!(PageId::new("abc").to_string(), "abc");
    }
}
