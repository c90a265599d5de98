//! Migration layer: routes pool calls between the legacy and optimized
//! backends during a staged rollout.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, info, warn};

use browser_fleet_core::config::{MigrationConfig, MigrationMode};
use browser_fleet_core::error::{FleetError, Result};
use browser_fleet_core::events::{EventBus, EventKind, FleetEvent, SubscriptionId};
use browser_fleet_core::metrics;

use crate::backend::{PoolBackend, PoolStats};
use crate::driver::PageId;
use crate::instance::AcquiredInstance;

/// Which backend served a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Path {
    Legacy,
    Optimized,
}

impl Path {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Legacy => "legacy",
            Self::Optimized => "optimized",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MigrationStats {
    pub mode: MigrationMode,
    pub rollout_percent: u8,
    pub legacy_calls: u64,
    pub optimized_calls: u64,
    pub fallbacks: u64,
    pub optimized_errors: u64,
    /// Successful acquisitions over all acquisitions, 1.0 before any.
    pub success_rate: f64,
}

#[derive(Default)]
struct Counters {
    legacy_calls: u64,
    optimized_calls: u64,
    fallbacks: u64,
    optimized_errors: u64,
    acquired: u64,
    failed: u64,
}

/// 0..100 bucket for canary routing. FNV-1a, stable across runs.
fn rollout_bucket(session_id: &str) -> u8 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in session_id.bytes() {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(0x0100_0000_01b3);
    }
    (hash % 100) as u8
}

/// A [`PoolBackend`] that picks a backend per session and remembers which
/// one owns each instance.
pub struct MigrationPool {
    config: MigrationConfig,
    legacy: Arc<dyn PoolBackend>,
    optimized: Arc<dyn PoolBackend>,
    owners: Arc<Mutex<HashMap<String, Path>>>,
    counters: Mutex<Counters>,
    subscription: Option<(Arc<EventBus>, SubscriptionId)>,
}

impl MigrationPool {
    pub fn new(config: MigrationConfig, legacy: Arc<dyn PoolBackend>, optimized: Arc<dyn PoolBackend>) -> Self {
        info!(mode = ?config.mode, rollout_percent = config.rollout_percent, "Migration layer configured");
        Self {
            config,
            legacy,
            optimized,
            owners: Arc::new(Mutex::new(HashMap::new())),
            counters: Mutex::new(Counters::default()),
            subscription: None,
        }
    }

    /// Forget owners of instances the backends close on their own
    /// (crashes, recycling) without a release.
    pub fn with_events(mut self, events: Arc<EventBus>) -> Self {
        let owners = Arc::clone(&self.owners);
        let id = events.subscribe(EventKind::InstanceClosed, move |event| {
            if let FleetEvent::InstanceClosed { instance_id, .. } = event {
                owners
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove(instance_id);
            }
        });
        if let Some((previous, old)) = self.subscription.replace((events, id)) {
            previous.unsubscribe(old);
        }
        self
    }

    fn owners(&self) -> MutexGuard<'_, HashMap<String, Path>> {
        self.owners.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn counters(&self) -> MutexGuard<'_, Counters> {
        self.counters.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn backend(&self, path: Path) -> &Arc<dyn PoolBackend> {
        match path {
            Path::Legacy => &self.legacy,
            Path::Optimized => &self.optimized,
        }
    }

    /// The path a new acquisition for `session_id` takes.
    pub fn route(&self, session_id: &str) -> Path {
        match self.config.mode {
            MigrationMode::Legacy => Path::Legacy,
            MigrationMode::Optimized => Path::Optimized,
            MigrationMode::Canary => {
                if rollout_bucket(session_id) < self.config.rollout_percent {
                    Path::Optimized
                } else {
                    Path::Legacy
                }
            }
        }
    }

    /// The backend that issued `instance_id`, if it is still tracked.
    pub fn owner(&self, instance_id: &str) -> Option<Path> {
        self.owners().get(instance_id).copied()
    }

    fn count(&self, path: Path, fallback: bool) {
        {
            let mut counters = self.counters();
            match path {
                Path::Legacy => counters.legacy_calls += 1,
                Path::Optimized => counters.optimized_calls += 1,
            }
        }
        metrics::record_migration_path(path.as_str(), fallback);
    }

    fn owned(&self, instance_id: &str) -> Result<(Path, &Arc<dyn PoolBackend>)> {
        let path = self
            .owner(instance_id)
            .ok_or_else(|| FleetError::InstanceNotFound(instance_id.to_string()))?;
        self.count(path, false);
        Ok((path, self.backend(path)))
    }

    pub fn stats_detail(&self) -> MigrationStats {
        let counters = self.counters();
        let attempts = counters.acquired + counters.failed;
        MigrationStats {
            mode: self.config.mode,
            rollout_percent: self.config.rollout_percent,
            legacy_calls: counters.legacy_calls,
            optimized_calls: counters.optimized_calls,
            fallbacks: counters.fallbacks,
            optimized_errors: counters.optimized_errors,
            success_rate: if attempts == 0 {
                1.0
            } else {
                counters.acquired as f64 / attempts as f64
            },
        }
    }

    fn settle(&self, path: Path, result: Result<AcquiredInstance>) -> Result<AcquiredInstance> {
        match &result {
            Ok(acquired) => {
                self.owners().insert(acquired.instance_id.clone(), path);
                self.counters().acquired += 1;
            }
            Err(_) => self.counters().failed += 1,
        }
        result
    }
}

#[async_trait]
impl PoolBackend for MigrationPool {
    fn name(&self) -> &'static str {
        "migration"
    }

    async fn acquire(&self, session_id: &str) -> Result<AcquiredInstance> {
        let path = self.route(session_id);
        self.count(path, false);
        let result = self.backend(path).acquire(session_id).await;

        let fallback = match &result {
            Err(e) if path == Path::Optimized => {
                self.counters().optimized_errors += 1;
                self.config.fallback_on_error && !matches!(e, FleetError::ShuttingDown)
            }
            _ => false,
        };
        if !fallback {
            return self.settle(path, result);
        }

        if let Err(e) = &result {
            warn!(session_id, error = %e, "Optimized pool failed, falling back to legacy");
        }
        self.counters().fallbacks += 1;
        self.count(Path::Legacy, true);
        let result = self.legacy.acquire(session_id).await;
        self.settle(Path::Legacy, result)
    }

    async fn release(&self, instance_id: &str, session_id: &str) -> Result<()> {
        let (path, backend) = self.owned(instance_id)?;
        let result = backend.release(instance_id, session_id).await;
        match &result {
            Ok(()) | Err(FleetError::InstanceNotFound(_)) => {
                self.owners().remove(instance_id);
                debug!(instance_id, path = path.as_str(), "Released through migration layer");
            }
            Err(_) => {}
        }
        result
    }

    async fn create_page(&self, instance_id: &str, session_id: &str) -> Result<PageId> {
        let (_, backend) = self.owned(instance_id)?;
        backend.create_page(instance_id, session_id).await
    }

    async fn close_page(&self, instance_id: &str, session_id: &str, page_id: &PageId) -> Result<()> {
        let (_, backend) = self.owned(instance_id)?;
        backend.close_page(instance_id, session_id, page_id).await
    }

    async fn health_check(&self) -> HashMap<String, bool> {
        let (mut legacy, optimized) = tokio::join!(self.legacy.health_check(), self.optimized.health_check());
        legacy.extend(optimized);
        legacy
    }

    fn stats(&self) -> PoolStats {
        self.legacy.stats().merge(&self.optimized.stats())
    }

    async fn shutdown(&self) {
        tokio::join!(self.legacy.shutdown(), self.optimized.shutdown());
        self.owners().clear();
        info!(stats = ?self.stats_detail(), "Migration layer shut down");
    }
}

impl Drop for MigrationPool {
    fn drop(&mut self) {
        if let Some((events, id)) = self.subscription.take() {
            events.unsubscribe(id);
        }
    }
}
