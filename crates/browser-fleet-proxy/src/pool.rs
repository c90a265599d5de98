//! Proxy pool: the set of configured proxies, their accounting, and selection.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use browser_fleet_core::config::{ProxyConfig, ProxyPoolConfig, SelectionStrategy};
use browser_fleet_core::error::{FleetError, Result};
use browser_fleet_core::events::{EventBus, FleetEvent};
use browser_fleet_core::metrics;

use crate::instance::ProxyInstance;
use crate::probe::ConnectivityProbe;
use crate::selector::{ProxySelector, candidates};
use crate::stats::ProxyPoolStats;

/// Result of probing one proxy.
#[derive(Debug, Clone, Serialize)]
pub struct ProbeReport {
    pub proxy_id: String,
    pub healthy: bool,
    pub latency_ms: Option<f64>,
    pub error: Option<String>,
}

struct PoolState {
    instances: Vec<ProxyInstance>,
    selector: ProxySelector,
}

/// All proxies known to the manager. Never shrinks while in use.
pub struct ProxyPool {
    strategy: SelectionStrategy,
    failure_threshold: u32,
    probe_timeout: Duration,
    probe_interval: Duration,
    state: Mutex<PoolState>,
    events: Option<Arc<EventBus>>,
}

impl ProxyPool {
    pub fn new(config: &ProxyPoolConfig) -> Self {
        let mut instances: Vec<ProxyInstance> = Vec::with_capacity(config.proxies.len());
        for proxy in &config.proxies {
            let instance = ProxyInstance::new(proxy.clone());
            if instances.iter().any(|p| p.id == instance.id) {
                warn!(proxy_id = %instance.id, "Duplicate proxy id ignored");
                continue;
            }
            instances.push(instance);
        }

        Self {
            strategy: config.strategy,
            failure_threshold: config.failure_threshold,
            probe_timeout: config.health_check_timeout(),
            probe_interval: config.health_check_interval(),
            state: Mutex::new(PoolState {
                instances,
                selector: ProxySelector::new(),
            }),
            events: None,
        }
    }

    pub fn with_events(mut self, events: Arc<EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn strategy(&self) -> SelectionStrategy {
        self.strategy
    }

    pub fn len(&self) -> usize {
        self.lock().instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Register a proxy if its id is new. Returns the id.
    pub fn register(&self, config: ProxyConfig) -> String {
        let id = config.key();
        let mut state = self.lock();
        if !state.instances.iter().any(|p| p.id == id) {
            debug!(proxy_id = %id, "Proxy registered");
            state.instances.push(ProxyInstance::new(config));
        }
        id
    }

    pub fn get(&self, id: &str) -> Option<ProxyInstance> {
        self.lock().instances.iter().find(|p| p.id == id).cloned()
    }

    /// Snapshot of every proxy.
    pub fn instances(&self) -> Vec<ProxyInstance> {
        self.lock().instances.clone()
    }

    /// Select a proxy and mark it used.
    ///
    /// Fails with `ProxyPoolEmpty` if no proxy survives the exclusion list.
    pub fn select(
        &self,
        strategy: Option<SelectionStrategy>,
        exclude: &[String],
    ) -> Result<ProxyConfig> {
        let strategy = strategy.unwrap_or(self.strategy);
        let mut state = self.lock();
        let state = &mut *state;

        let cands = candidates(&state.instances, exclude);
        let idx = state
            .selector
            .pick(strategy, &state.instances, &cands)
            .ok_or_else(|| {
                FleetError::ProxyPoolEmpty(format!(
                    "{} proxies, {} excluded",
                    state.instances.len(),
                    exclude.len()
                ))
            })?;

        let chosen = &mut state.instances[idx];
        chosen.mark_used(Utc::now());
        debug!(proxy_id = %chosen.id, ?strategy, "Proxy selected");
        Ok(chosen.config.clone())
    }

    pub fn report_success(&self, id: &str, response_time: Duration) -> Result<()> {
        let recovered = {
            let mut state = self.lock();
            let instance = find_mut(&mut state.instances, id)?;
            instance.record_success(response_time, Utc::now())
        };
        metrics::record_proxy_request(id, true);
        if recovered {
            info!(proxy_id = %id, "Proxy recovered");
            self.emit_health(id, true, None);
        }
        Ok(())
    }

    pub fn report_failure(&self, id: &str, error: &str) -> Result<()> {
        let (tripped, failures) = {
            let mut state = self.lock();
            let instance = find_mut(&mut state.instances, id)?;
            let tripped = instance.record_failure(error, self.failure_threshold, Utc::now());
            (tripped, instance.health.consecutive_failures)
        };
        metrics::record_proxy_request(id, false);
        if tripped {
            warn!(proxy_id = %id, failures, error, "Proxy marked unhealthy");
            self.emit_health(id, false, Some(error.to_string()));
        } else {
            debug!(proxy_id = %id, failures, error, "Proxy failure reported");
        }
        Ok(())
    }

    pub fn stats(&self) -> ProxyPoolStats {
        ProxyPoolStats::from_instances(&self.lock().instances)
    }

    /// Probe every proxy concurrently and feed the results into the
    /// success/failure accounting.
    pub async fn check_health(&self, probe: &dyn ConnectivityProbe) -> Vec<ProbeReport> {
        let targets: Vec<(String, String, u16)> = self
            .lock()
            .instances
            .iter()
            .map(|p| (p.id.clone(), p.config.host.clone(), p.config.port))
            .collect();

        let timeout = self.probe_timeout;
        let checks = targets.into_iter().map(|(id, host, port)| async move {
            let result = probe.probe(&host, port, timeout).await;
            (id, result)
        });
        let results = join_all(checks).await;

        let mut reports = Vec::with_capacity(results.len());
        for (id, result) in results {
            let report = match result {
                Ok(latency) => {
                    let _ = self.report_success(&id, latency);
                    ProbeReport {
                        proxy_id: id,
                        healthy: true,
                        latency_ms: Some(latency.as_secs_f64() * 1000.0),
                        error: None,
                    }
                }
                Err(e) => {
                    let error = format!("{e:#}");
                    let _ = self.report_failure(&id, &error);
                    ProbeReport {
                        proxy_id: id,
                        healthy: false,
                        latency_ms: None,
                        error: Some(error),
                    }
                }
            };
            reports.push(report);
        }
        reports
    }

    /// Run [`check_health`](Self::check_health) on the configured interval until cancelled.
    ///
    /// Returns `None` when the interval is zero.
    pub fn spawn_health_loop(
        self: &Arc<Self>,
        probe: Arc<dyn ConnectivityProbe>,
        cancel: CancellationToken,
    ) -> Option<JoinHandle<()>> {
        if self.probe_interval.is_zero() {
            debug!("Zero proxy health interval, health loop disabled");
            return None;
        }
        let pool = Arc::clone(self);
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(pool.probe_interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let reports = pool.check_health(probe.as_ref()).await;
                        let stats = pool.stats();
                        debug!(
                            probed = reports.len(),
                            healthy = stats.healthy,
                            unhealthy = stats.unhealthy,
                            "Proxy health check completed"
                        );
                    }
                }
            }
            debug!("Proxy health loop stopped");
        }))
    }

    fn emit_health(&self, id: &str, healthy: bool, last_error: Option<String>) {
        if let Some(events) = &self.events {
            events.emit(FleetEvent::ProxyHealthChanged {
                proxy_id: id.to_string(),
                healthy,
                last_error,
            });
        }
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn find_mut<'a>(instances: &'a mut [ProxyInstance], id: &str) -> Result<&'a mut ProxyInstance> {
    instances
        .iter_mut()
        .find(|p| p.id == id)
        .ok_or_else(|| FleetError::ProxyNotFound(id.to_string()))
}
