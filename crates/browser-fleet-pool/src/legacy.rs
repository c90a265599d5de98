//! Legacy pool, the first-generation browser pool.
//!
//! Launches on demand up to `max_browsers` and reuses idle browsers.
//! No circuit breaker, recycling or scaling. Serves as the migration
//! baseline and fallback target.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

use browser_fleet_core::config::{LaunchConfig, PoolConfig};
use browser_fleet_core::error::{FleetError, Result};
use browser_fleet_core::metrics;

use crate::backend::{PoolBackend, PoolStats};
use crate::driver::{BrowserDriver, BrowserHandle, LaunchOptions, PageId};
use crate::instance::AcquiredInstance;

/// A browser held by the legacy pool.
struct LegacyBrowser {
    handle: Arc<dyn BrowserHandle>,
    holder: Option<String>,
    acquired_at: DateTime<Utc>,
    /// Open pages and the session that owns each.
    pages: HashMap<PageId, String>,
}

/// A pool of browsers, lazily launched.
pub struct SimplePool {
    config: PoolConfig,
    launch: LaunchConfig,
    driver: Arc<dyn BrowserDriver>,
    browsers: Arc<RwLock<HashMap<String, LegacyBrowser>>>,
    closing: AtomicBool,
}

impl SimplePool {
    pub fn new(config: PoolConfig, launch: LaunchConfig, driver: Arc<dyn BrowserDriver>) -> Self {
        Self {
            config,
            launch,
            driver,
            browsers: Arc::new(RwLock::new(HashMap::new())),
            closing: AtomicBool::new(false),
        }
    }

    /// Get the maximum number of concurrent browsers.
    pub fn max_browsers(&self) -> usize {
        self.config.max_browsers
    }

    /// Get the number of launched browsers.
    pub async fn len(&self) -> usize {
        self.browsers.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.browsers.read().await.is_empty()
    }

    async fn close_browser(&self, instance_id: &str, browser: LegacyBrowser) {
        for page in browser.pages.keys() {
            let _ = browser.handle.close_page(page).await;
        }
        if let Err(e) = browser.handle.close().await {
            warn!(instance_id, error = %e, "Legacy browser close failed");
        }
    }
}

#[async_trait]
impl PoolBackend for SimplePool {
    fn name(&self) -> &'static str {
        "legacy"
    }

    async fn acquire(&self, session_id: &str) -> Result<AcquiredInstance> {
        if self.closing.load(Ordering::SeqCst) {
            return Err(FleetError::ShuttingDown);
        }
        // The write lock is held across the launch so capacity checks never race.
        let mut browsers = self.browsers.write().await;

        if let Some((id, browser)) = browsers.iter_mut().find(|(_, b)| b.holder.is_none()) {
            browser.holder = Some(session_id.to_string());
            browser.acquired_at = Utc::now();
            debug!(session_id, instance_id = %id, "Legacy browser reused");
            metrics::record_acquire("reused");
            return Ok(AcquiredInstance {
                instance_id: id.clone(),
                session_id: session_id.to_string(),
                acquired_at: browser.acquired_at,
                handle: browser.handle.clone(),
            });
        }

        if browsers.len() >= self.config.max_browsers {
            let active = browsers.values().filter(|b| b.holder.is_some()).count();
            metrics::record_acquire("pool_exhausted");
            return Err(FleetError::PoolExhausted {
                active,
                max: self.config.max_browsers,
            });
        }

        let options = LaunchOptions::from_config(&self.launch);
        let started = tokio::time::Instant::now();
        let launched = tokio::time::timeout(self.config.launch_timeout(), self.driver.launch(&options)).await;
        let handle = match launched {
            Ok(Ok(handle)) => handle,
            Ok(Err(e)) => {
                metrics::record_launch(false, started.elapsed().as_secs_f64());
                return Err(FleetError::LaunchFailure(format!("{e:#}")));
            }
            Err(_) => {
                metrics::record_launch(false, started.elapsed().as_secs_f64());
                return Err(FleetError::LaunchFailure(format!(
                    "launch timed out after {}ms",
                    self.config.launch_timeout_ms
                )));
            }
        };
        metrics::record_launch(true, started.elapsed().as_secs_f64());
        metrics::record_acquire("launched");

        let id = Uuid::new_v4().to_string();
        let acquired_at = Utc::now();
        browsers.insert(
            id.clone(),
            LegacyBrowser {
                handle: handle.clone(),
                holder: Some(session_id.to_string()),
                acquired_at,
                pages: HashMap::new(),
            },
        );
        info!(session_id, instance_id = %id, "Legacy browser launched");

        Ok(AcquiredInstance {
            instance_id: id,
            session_id: session_id.to_string(),
            acquired_at,
            handle,
        })
    }

    async fn release(&self, instance_id: &str, session_id: &str) -> Result<()> {
        let (handle, pages) = {
            let mut browsers = self.browsers.write().await;
            let browser = browsers
                .get_mut(instance_id)
                .ok_or_else(|| FleetError::InstanceNotFound(instance_id.to_string()))?;
            if browser.holder.as_deref() != Some(session_id) {
                return Err(FleetError::NotAcquired {
                    instance_id: instance_id.to_string(),
                    session_id: session_id.to_string(),
                });
            }
            browser.holder = None;
            let pages: Vec<PageId> = browser.pages.drain().map(|(page, _)| page).collect();
            (browser.handle.clone(), pages)
        };

        for page in &pages {
            if let Err(e) = handle.close_page(page).await {
                warn!(instance_id, page_id = %page, error = %e, "Failed to close page on release");
            }
        }
        metrics::record_release();
        debug!(instance_id, session_id, "Legacy browser released");
        Ok(())
    }

    async fn create_page(&self, instance_id: &str, session_id: &str) -> Result<PageId> {
        let mut browsers = self.browsers.write().await;
        let browser = browsers
            .get_mut(instance_id)
            .ok_or_else(|| FleetError::InstanceNotFound(instance_id.to_string()))?;
        if browser.holder.as_deref() != Some(session_id) {
            return Err(FleetError::NotAcquired {
                instance_id: instance_id.to_string(),
                session_id: session_id.to_string(),
            });
        }
        if browser.pages.len() >= self.config.max_pages_per_browser {
            return Err(FleetError::PageLimit {
                instance_id: instance_id.to_string(),
                max: self.config.max_pages_per_browser,
            });
        }

        let page = browser.handle.new_page().await.map_err(FleetError::Other)?;
        browser.pages.insert(page.clone(), session_id.to_string());
        metrics::record_page(true);
        Ok(page)
    }

    async fn close_page(&self, instance_id: &str, session_id: &str, page_id: &PageId) -> Result<()> {
        let handle = {
            let mut browsers = self.browsers.write().await;
            let browser = browsers
                .get_mut(instance_id)
                .ok_or_else(|| FleetError::InstanceNotFound(instance_id.to_string()))?;
            if browser.holder.as_deref() != Some(session_id) {
                return Err(FleetError::NotAcquired {
                    instance_id: instance_id.to_string(),
                    session_id: session_id.to_string(),
                });
            }
            if browser.pages.remove(page_id).is_none() {
                return Err(FleetError::PageNotFound {
                    instance_id: instance_id.to_string(),
                    page_id: page_id.to_string(),
                });
            }
            browser.handle.clone()
        };
        metrics::record_page(false);
        handle.close_page(page_id).await.map_err(FleetError::Other)
    }

    async fn health_check(&self) -> HashMap<String, bool> {
        let targets: Vec<(String, Arc<dyn BrowserHandle>)> = self
            .browsers
            .read()
            .await
            .iter()
            .map(|(id, b)| (id.clone(), b.handle.clone()))
            .collect();

        let mut report = HashMap::with_capacity(targets.len());
        for (id, handle) in targets {
            let healthy = matches!(
                tokio::time::timeout(self.config.health_check_timeout(), handle.probe()).await,
                Ok(Ok(()))
            );
            metrics::record_health_check(healthy);
            report.insert(id, healthy);
        }
        report
    }

    fn stats(&self) -> PoolStats {
        // Non-blocking snapshot; a writer mid-launch yields an empty view.
        let Ok(browsers) = self.browsers.try_read() else {
            return PoolStats {
                max_size: self.config.max_browsers,
                ..PoolStats::default()
            };
        };
        let total = browsers.len();
        let active = browsers.values().filter(|b| b.holder.is_some()).count();
        PoolStats {
            total,
            idle: total - active,
            active,
            acquisitions: active,
            max_size: self.config.max_browsers,
            utilization: if total == 0 {
                0.0
            } else {
                active as f64 / total as f64
            },
            ..PoolStats::default()
        }
    }

    async fn shutdown(&self) {
        if self.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        let drained: Vec<(String, LegacyBrowser)> = self.browsers.write().await.drain().collect();
        let count = drained.len();
        for (id, browser) in drained {
            self.close_browser(&id, browser).await;
        }
        info!(closed = count, "Legacy pool shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::fake::FakeDriver;

    fn pool(max_browsers: usize) -> (SimplePool, Arc<FakeDriver>) {
        let driver = Arc::new(FakeDriver::default());
        let config = PoolConfig {
            max_browsers,
            max_pages_per_browser: 1,
            ..PoolConfig::default()
        };
        (
            SimplePool::new(config, LaunchConfig::default(), driver.clone()),
            driver,
        )
    }

    #[tokio::test]
    async fn test_pool_acquire_and_reuse() {
        let (pool, driver) = pool(2);
        let a = pool.acquire("s1").await.unwrap();
        pool.release(&a.instance_id, "s1").await.unwrap();
        let b = pool.acquire("s2").await.unwrap();
        assert_eq!(a.instance_id, b.instance_id);
        assert_eq!(driver.handles.lock().unwrap().len(), 1);
        assert_eq!(pool.len().await, 1);
    }

    #[tokio::test]
    async fn test_pool_max_browsers() {
        let (pool, _driver) = pool(2);
        pool.acquire("s1").await.unwrap();
        pool.acquire("s2").await.unwrap();
        assert!(matches!(
            pool.acquire("s3").await,
            Err(FleetError::PoolExhausted { active: 2, max: 2 })
        ));
    }

    #[tokio::test]
    async fn test_pool_pages() {
        let (pool, driver) = pool(1);
        let id = pool.acquire("s1").await.unwrap().instance_id;
        let page = pool.create_page(&id, "s1").await.unwrap();
        assert!(matches!(
            pool.create_page(&id, "s1").await,
            Err(FleetError::PageLimit { max: 1, .. })
        ));
        pool.close_page(&id, "s1", &page).await.unwrap();
        assert!(matches!(
            pool.close_page(&id, "s1", &page).await,
            Err(FleetError::PageNotFound { .. })
        ));

        pool.create_page(&id, "s1").await.unwrap();
        pool.release(&id, "s1").await.unwrap();
        assert_eq!(driver.handle(0).open_pages(), 0);
    }

    #[tokio::test]
    async fn test_pool_launch_failure() {
        let (pool, driver) = pool(1);
        driver.fail_launch.store(true, Ordering::SeqCst);
        assert!(matches!(
            pool.acquire("s1").await,
            Err(FleetError::LaunchFailure(_))
        ));
        assert!(pool.is_empty().await);
    }

    #[tokio::test]
    async fn test_pool_shutdown() {
        let (pool, driver) = pool(2);
        pool.acquire("s1").await.unwrap();
        pool.shutdown().await;
        assert_eq!(driver.live(), 0);
        assert!(matches!(
            pool.acquire("s1").await,
            Err(FleetError::ShuttingDown)
        ));
    }
}
