//! Proxy manager: the facade the pool and callers talk to.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use browser_fleet_core::config::{ContextProxyConfig, ProxyConfig, ProxyPoolConfig};
use browser_fleet_core::error::Result;
use browser_fleet_core::events::EventBus;

use crate::bypass::BypassRules;
use crate::context::{ContextBinding, ContextProxyManager};
use crate::instance::ProxyInstance;
use crate::pool::{ProbeReport, ProxyPool};
use crate::probe::{ConnectivityProbe, TcpProbe};
use crate::stats::ProxyPoolStats;

pub struct ProxyManager {
    pool: Arc<ProxyPool>,
    contexts: Arc<ContextProxyManager>,
    bypass: BypassRules,
    probe: Arc<dyn ConnectivityProbe>,
    cancel: CancellationToken,
    health_task: Mutex<Option<JoinHandle<()>>>,
}

impl ProxyManager {
    pub fn new(config: &ProxyPoolConfig, events: Option<Arc<EventBus>>) -> Self {
        let pool = ProxyPool::new(config);
        let pool = Arc::new(match &events {
            Some(events) => pool.with_events(events.clone()),
            None => pool,
        });
        let contexts = Arc::new(ContextProxyManager::new(pool.clone(), config, events));

        Self {
            pool,
            contexts,
            bypass: BypassRules::new(&config.bypass),
            probe: Arc::new(TcpProbe),
            cancel: CancellationToken::new(),
            health_task: Mutex::new(None),
        }
    }

    /// Replace the connectivity probe (defaults to [`TcpProbe`]).
    pub fn with_probe(mut self, probe: Arc<dyn ConnectivityProbe>) -> Self {
        self.probe = probe;
        self
    }

    pub fn pool(&self) -> &Arc<ProxyPool> {
        &self.pool
    }

    /// The proxy to use for `url`, or `None` if the request should go direct.
    ///
    /// A bound context always gets its bound proxy. Otherwise one is
    /// selected from the pool; an empty pool means direct.
    pub fn get_proxy_for_url(&self, url: &str, context_id: Option<&str>) -> Result<Option<ProxyConfig>> {
        if self.bypass.matches(url) {
            debug!(url, "Pool bypass rule matched");
            return Ok(None);
        }

        if let Some(context_id) = context_id {
            if let Some(rules) = self.contexts.context_bypass(context_id) {
                if rules.matches(url) {
                    debug!(url, context_id, "Context bypass rule matched");
                    return Ok(None);
                }
            }
            if let Some(binding) = self.contexts.context_binding(context_id) {
                return Ok(filter_proxy_bypass(binding.proxy, url));
            }
        }

        if self.pool.is_empty() {
            return Ok(None);
        }
        let proxy = self.pool.select(None, &[])?;
        Ok(filter_proxy_bypass(proxy, url))
    }

    pub fn configure_context_proxy(&self, context_id: &str, config: ContextProxyConfig) -> Result<ContextBinding> {
        self.contexts.configure_context_proxy(context_id, config)
    }

    pub fn rotate_context_proxy(&self, context_id: &str) -> Result<Option<ContextBinding>> {
        self.contexts.rotate_context_proxy(context_id)
    }

    pub fn remove_context(&self, context_id: &str) -> bool {
        self.contexts.remove_context(context_id)
    }

    pub fn context_binding(&self, context_id: &str) -> Option<ContextBinding> {
        self.contexts.context_binding(context_id)
    }

    pub fn contexts(&self) -> Vec<String> {
        self.contexts.contexts()
    }

    pub fn report_success(&self, proxy_id: &str, response_time: Duration) -> Result<()> {
        self.pool.report_success(proxy_id, response_time)
    }

    pub fn report_failure(&self, proxy_id: &str, error: &str) -> Result<()> {
        self.pool.report_failure(proxy_id, error)
    }

    pub fn stats(&self) -> ProxyPoolStats {
        self.pool.stats()
    }

    pub fn instances(&self) -> Vec<ProxyInstance> {
        self.pool.instances()
    }

    /// Probe every proxy once.
    pub async fn check_health(&self) -> Vec<ProbeReport> {
        self.pool.check_health(self.probe.as_ref()).await
    }

    /// Start the periodic health loop. No-op without proxies or if already running.
    pub fn start(&self) {
        if self.pool.is_empty() {
            return;
        }
        let mut task = self.health_task.lock().unwrap_or_else(PoisonError::into_inner);
        if task.is_some() {
            return;
        }
        *task = self
            .pool
            .spawn_health_loop(self.probe.clone(), self.cancel.child_token());
        if task.is_some() {
            info!(proxies = self.pool.len(), "Proxy health loop started");
        }
    }

    /// Stop the health loop and every rotation timer.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.contexts.shutdown();
        let task = self
            .health_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            let _ = task.await;
        }
        info!("Proxy manager stopped");
    }
}

fn filter_proxy_bypass(proxy: ProxyConfig, url: &str) -> Option<ProxyConfig> {
    if !proxy.bypass.is_empty() && BypassRules::new(&proxy.bypass).matches(url) {
        debug!(url, proxy_id = %proxy.key(), "Proxy bypass rule matched");
        return None;
    }
    Some(proxy)
}

#[cfg(test)]
mod tests {
    use browser_fleet_core::error::FleetError;

    use super::*;

    fn manager(n: u16) -> ProxyManager {
        let config = ProxyPoolConfig {
            proxies: (0..n).map(|i| ProxyConfig::new("10.2.2.2", 1080 + i)).collect(),
            bypass: vec!["localhost".into(), "*.intra.net".into()],
            ..ProxyPoolConfig::default()
        };
        ProxyManager::new(&config, None)
    }

    #[test]
    fn test_no_proxies_means_direct() {
        let m = manager(0);
        assert!(m.get_proxy_for_url("https://example.com", None).unwrap().is_none());
    }

    #[test]
    fn test_pool_bypass_wins() {
        let m = manager(2);
        assert!(m.get_proxy_for_url("http://localhost:3000/", None).unwrap().is_none());
        assert!(m.get_proxy_for_url("https://wiki.intra.net/", None).unwrap().is_none());
        assert!(m.get_proxy_for_url("https://example.com/", None).unwrap().is_some());
    }

    #[tokio::test]
    async fn test_bound_context_gets_its_proxy() {
        let m = manager(3);
        let binding = m
            .configure_context_proxy("ctx", ContextProxyConfig::default())
            .unwrap();
        for _ in 0..5 {
            let proxy = m
                .get_proxy_for_url("https://example.com", Some("ctx"))
                .unwrap()
                .unwrap();
            assert_eq!(proxy.key(), binding.proxy_id);
        }
        // Unbound contexts fall through to pool selection
        assert!(m.get_proxy_for_url("https://example.com", Some("other")).unwrap().is_some());
    }

    #[tokio::test]
    async fn test_proxy_level_bypass() {
        let m = manager(0);
        let mut proxy = ProxyConfig::new("10.9.9.9", 8080);
        proxy.bypass = vec!["direct.example.com".into()];
        m.configure_context_proxy(
            "ctx",
            ContextProxyConfig {
                proxy: Some(proxy),
                ..Default::default()
            },
        )
        .unwrap();

        assert!(m.get_proxy_for_url("https://direct.example.com", Some("ctx")).unwrap().is_none());
        assert!(m.get_proxy_for_url("https://other.example.com", Some("ctx")).unwrap().is_some());
    }

    #[test]
    fn test_reports_flow_into_stats() {
        let m = manager(1);
        m.report_success("10.2.2.2:1080", Duration::from_millis(40)).unwrap();
        m.report_failure("10.2.2.2:1080", "reset").unwrap();
        let stats = m.stats();
        assert_eq!(stats.success_rate, 0.5);
        assert!(matches!(
            m.report_failure("nope", "x"),
            Err(FleetError::ProxyNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_start_and_shutdown() {
        let m = manager(1);
        m.start();
        m.start();
        m.shutdown().await;
        assert!(m.health_task.lock().unwrap().is_none());
    }
}
