//! Pool manager: owns the instance set and serializes every change to it.
//!
//! All bookkeeping lives behind one mutex that is never held across an
//! await. Launches, probes and closes happen outside the lock; their
//! results are folded back in under it. Launches run on their own task so
//! an acquirer that gives up never strands a half-registered browser.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use tokio::sync::{Notify, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use browser_fleet_breaker::{BreakerError, BreakerRegistry};
use browser_fleet_core::config::{Config, ProxyConfig};
use browser_fleet_core::error::{FleetError, Result};
use browser_fleet_core::events::{EventBus, FleetEvent};
use browser_fleet_core::metrics;
use browser_fleet_core::types::InstanceState;
use browser_fleet_proxy::ProxyManager;

use crate::backend::{PoolBackend, PoolStats};
use crate::driver::{BrowserDriver, BrowserHandle, LaunchOptions, PageId};
use crate::instance::{AcquiredInstance, Acquisition, Instance, InstanceSnapshot};
use crate::recycler::Recycler;
use crate::scaler::ScalingController;

/// Breaker guarding driver launches.
pub const LAUNCH_BREAKER: &str = "launch";
/// Breaker guarding instance health probes.
pub const HEALTH_BREAKER: &str = "healthCheck";

#[derive(Default)]
struct PoolState {
    instances: HashMap<String, Instance>,
    /// Keyed by instance id; an instance has at most one holder.
    acquisitions: HashMap<String, Acquisition>,
    /// Launches reserved against capacity but not yet registered.
    launching: usize,
    closing: bool,
}

impl PoolState {
    fn occupancy(&self) -> usize {
        self.instances.len() + self.launching
    }

    fn count(&self, state: InstanceState) -> usize {
        self.instances.values().filter(|i| i.state == state).count()
    }
}

fn transition(instance: &mut Instance, to: InstanceState, events: &mut Vec<FleetEvent>) {
    if instance.state == to {
        return;
    }
    events.push(FleetEvent::InstanceStateChanged {
        instance_id: instance.id.clone(),
        from: instance.state,
        to,
    });
    instance.state = to;
}

struct Launched {
    instance_id: String,
    handle: Arc<dyn BrowserHandle>,
    acquired_at: chrono::DateTime<Utc>,
}

struct Shared {
    config: Config,
    max_size: usize,
    min_size: usize,
    driver: Arc<dyn BrowserDriver>,
    breakers: Arc<BreakerRegistry>,
    proxies: Option<Arc<ProxyManager>>,
    events: Arc<EventBus>,
    state: Mutex<PoolState>,
    recycler: Mutex<Recycler>,
    scaler: Mutex<ScalingController>,
    released: Notify,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Capacity held for a launch in progress. Dropping it gives the slot back.
struct LaunchReservation {
    shared: Arc<Shared>,
    active: bool,
}

impl LaunchReservation {
    fn new(shared: Arc<Shared>) -> Self {
        Self {
            shared,
            active: true,
        }
    }

    /// Convert the reservation into a registered instance under the caller's lock.
    fn commit(mut self, state: &mut PoolState) {
        state.launching = state.launching.saturating_sub(1);
        self.active = false;
    }
}

impl Drop for LaunchReservation {
    fn drop(&mut self) {
        if self.active {
            let mut state = self.shared.lock();
            state.launching = state.launching.saturating_sub(1);
        }
    }
}

/// Page creation in flight; counts against the page ceiling until resolved.
struct PendingPage<'a> {
    shared: &'a Shared,
    instance_id: &'a str,
    active: bool,
}

impl PendingPage<'_> {
    fn resolve(mut self, state: &mut PoolState) {
        if let Some(instance) = state.instances.get_mut(self.instance_id) {
            instance.pending_pages = instance.pending_pages.saturating_sub(1);
        }
        self.active = false;
    }
}

impl Drop for PendingPage<'_> {
    fn drop(&mut self) {
        if self.active {
            let mut state = self.shared.lock();
            if let Some(instance) = state.instances.get_mut(self.instance_id) {
                instance.pending_pages = instance.pending_pages.saturating_sub(1);
            }
        }
    }
}

fn launch_error(err: BreakerError) -> FleetError {
    match err {
        BreakerError::Open { name, state, .. } => FleetError::CircuitOpen { name, state },
        BreakerError::Failed { error, .. } => FleetError::LaunchFailure(format!("{error:#}")),
    }
}

/// The optimized pool: circuit-protected launches and probes, recycling
/// and scaling on background timers.
///
/// Cheap to clone; clones share the same pool. Dropping the last clone
/// stops the background loops.
#[derive(Clone)]
pub struct PoolManager {
    shared: Arc<Shared>,
    _stop_loops: Arc<DropGuard>,
}

pub struct PoolManagerBuilder {
    config: Config,
    driver: Arc<dyn BrowserDriver>,
    events: Option<Arc<EventBus>>,
    breakers: Option<Arc<BreakerRegistry>>,
    proxies: Option<Arc<ProxyManager>>,
}

impl PoolManagerBuilder {
    pub fn events(mut self, events: Arc<EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn breakers(mut self, breakers: Arc<BreakerRegistry>) -> Self {
        self.breakers = Some(breakers);
        self
    }

    pub fn proxies(mut self, proxies: Arc<ProxyManager>) -> Self {
        self.proxies = Some(proxies);
        self
    }

    pub fn build(self) -> PoolManager {
        let events = self.events.unwrap_or_default();
        let breakers = self.breakers.unwrap_or_else(|| {
            Arc::new(
                BreakerRegistry::new(self.config.circuit_breaker.clone()).with_events(events.clone()),
            )
        });
        let max_size = self.config.effective_max_size();
        let scaler = ScalingController::new(self.config.scaling.clone(), max_size);
        let min_size = scaler.min_size();

        let cancel = CancellationToken::new();
        PoolManager {
            _stop_loops: Arc::new(cancel.clone().drop_guard()),
            shared: Arc::new(Shared {
                max_size,
                min_size,
                driver: self.driver,
                breakers,
                proxies: self.proxies,
                events,
                state: Mutex::new(PoolState::default()),
                recycler: Mutex::new(Recycler::new(self.config.recycling.clone())),
                scaler: Mutex::new(scaler),
                released: Notify::new(),
                cancel,
                tasks: Mutex::new(Vec::new()),
                config: self.config,
            }),
        }
    }
}

impl PoolManager {
    pub fn builder(config: Config, driver: Arc<dyn BrowserDriver>) -> PoolManagerBuilder {
        PoolManagerBuilder {
            config,
            driver,
            events: None,
            breakers: None,
            proxies: None,
        }
    }

    pub fn new(config: Config, driver: Arc<dyn BrowserDriver>) -> Self {
        Self::builder(config, driver).build()
    }

    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    pub fn max_size(&self) -> usize {
        self.shared.max_size
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.shared.events
    }

    pub fn breakers(&self) -> &Arc<BreakerRegistry> {
        &self.shared.breakers
    }

    pub fn proxies(&self) -> Option<&Arc<ProxyManager>> {
        self.shared.proxies.as_ref()
    }

    /// Hand an instance to `session_id`: an idle one if available, else a
    /// fresh launch if capacity allows. Bounded by `acquire_timeout_ms`.
    pub async fn acquire(&self, session_id: &str) -> Result<AcquiredInstance> {
        let limit = self.shared.config.pool.acquire_timeout();
        let result = match tokio::time::timeout(limit, self.shared.acquire(session_id)).await {
            Ok(result) => result,
            Err(_) => Err(FleetError::AcquireTimeout(limit.as_millis() as u64)),
        };

        match &result {
            Ok((acquired, launched)) => {
                metrics::record_acquire(if *launched { "launched" } else { "reused" });
                debug!(session_id, instance_id = %acquired.instance_id, launched, "Instance acquired");
            }
            Err(e) => {
                metrics::record_acquire(e.kind());
                warn!(session_id, error = %e, "Acquire failed");
            }
        }
        result.map(|(acquired, _)| acquired)
    }

    pub async fn release(&self, instance_id: &str, session_id: &str) -> Result<()> {
        self.shared.release(instance_id, session_id).await
    }

    pub async fn create_page(&self, instance_id: &str, session_id: &str) -> Result<PageId> {
        self.shared.create_page(instance_id, session_id).await
    }

    pub async fn close_page(&self, instance_id: &str, session_id: &str, page_id: &PageId) -> Result<()> {
        self.shared.close_page(instance_id, session_id, page_id).await
    }

    /// Probe every instance through the health breaker.
    pub async fn health_check(&self) -> HashMap<String, bool> {
        self.shared.health_check().await
    }

    /// Run one recycling pass: reap idle instances above the floor, then
    /// retire the worst-scoring idle instances.
    pub async fn run_maintenance(&self) {
        self.shared.maintain().await
    }

    /// Run one scaling evaluation and act on it.
    pub async fn run_scaling(&self) {
        self.shared.scale().await
    }

    pub fn stats(&self) -> PoolStats {
        self.shared.stats()
    }

    pub fn instances(&self) -> Vec<InstanceSnapshot> {
        let now = Instant::now();
        let state = self.shared.lock();
        let mut snapshots: Vec<InstanceSnapshot> = state
            .instances
            .values()
            .map(|i| {
                let session = state.acquisitions.get(&i.id).map(|a| a.session_id.as_str());
                i.snapshot(now, session)
            })
            .collect();
        snapshots.sort_by(|a, b| a.launched_at.cmp(&b.launched_at).then(a.id.cmp(&b.id)));
        snapshots
    }

    pub fn acquisitions(&self) -> Vec<Acquisition> {
        self.shared.lock().acquisitions.values().cloned().collect()
    }

    /// Warm the pool to its minimum size and start the background loops.
    /// Returns the number of instances warmed.
    pub async fn start(&self) -> usize {
        let shared = &self.shared;
        let missing = {
            let state = shared.lock();
            shared.min_size.saturating_sub(state.occupancy())
        };
        let warmed = shared.launch_idle(missing).await;

        let mut tasks = Vec::new();
        tasks.extend(spawn_loop(
            shared,
            "health",
            shared.config.pool.health_check_interval(),
            |s| async move {
                s.health_check().await;
            },
        ));
        tasks.extend(spawn_loop(
            shared,
            "maintenance",
            shared.config.pool.maintenance_interval(),
            |s| async move { s.maintain().await },
        ));
        if shared.config.scaling.enabled {
            tasks.extend(spawn_loop(
                shared,
                "scaling",
                shared.config.scaling.evaluation_interval(),
                |s| async move { s.scale().await },
            ));
        }
        tasks.extend(shared.breakers.spawn_sweeper(shared.cancel.child_token()));
        if let Some(proxies) = &shared.proxies {
            proxies.start();
        }
        shared
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(tasks);

        info!(warmed, max_size = shared.max_size, "Pool started");
        warmed
    }

    /// Stop accepting acquisitions, wait up to `shutdown_grace_ms` for
    /// holders to release, then force-close everything and stop all timers.
    pub async fn shutdown(&self) {
        self.shared.shutdown().await
    }
}

fn spawn_loop<F, Fut>(
    shared: &Arc<Shared>,
    name: &'static str,
    period: Duration,
    tick: F,
) -> Option<JoinHandle<()>>
where
    F: Fn(Arc<Shared>) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send,
{
    if period.is_zero() {
        debug!(task = name, "Zero interval, loop disabled");
        return None;
    }
    let shared = Arc::clone(shared);
    let cancel = shared.cancel.child_token();
    Some(tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => tick(Arc::clone(&shared)).await,
            }
        }
        debug!(task = name, "Pool loop stopped");
    }))
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit_all(&self, events: Vec<FleetEvent>) {
        for event in events {
            self.events.emit(event);
        }
    }

    fn publish_size(&self) {
        let (total, active, idle) = {
            let state = self.lock();
            (
                state.instances.len(),
                state.acquisitions.len(),
                state.count(InstanceState::Idle),
            )
        };
        metrics::record_pool_size(total, active, idle);
    }

    fn stats(&self) -> PoolStats {
        let state = self.lock();
        let total = state.instances.len();
        let active = state.count(InstanceState::Active);
        PoolStats {
            total,
            idle: state.count(InstanceState::Idle),
            active,
            launching: state.launching + state.count(InstanceState::Launching),
            draining: state.count(InstanceState::Draining) + state.count(InstanceState::Recycling),
            crashed: state.count(InstanceState::Crashed),
            acquisitions: state.acquisitions.len(),
            max_size: self.max_size,
            utilization: if total == 0 {
                0.0
            } else {
                active as f64 / total as f64
            },
        }
    }

    // ========================================================================
    // Acquire / release
    // ========================================================================

    async fn acquire(self: &Arc<Self>, session_id: &str) -> Result<(AcquiredInstance, bool)> {
        enum Slot {
            Reused(AcquiredInstance, Vec<FleetEvent>),
            Launch(LaunchReservation),
        }

        let slot = {
            let mut state = self.lock();
            if state.closing {
                return Err(FleetError::ShuttingDown);
            }

            let idle = state
                .instances
                .values()
                .filter(|i| i.state.is_available())
                .max_by(|a, b| {
                    a.health_score
                        .total_cmp(&b.health_score)
                        .then(a.last_used.cmp(&b.last_used))
                })
                .map(|i| i.id.clone());

            match idle {
                Some(instance_id) => {
                    let mut events = Vec::new();
                    let acquired_at = Utc::now();
                    let handle = match state.instances.get_mut(&instance_id) {
                        Some(instance) => {
                            transition(instance, InstanceState::Active, &mut events);
                            instance.handle.clone()
                        }
                        None => return Err(FleetError::InstanceNotFound(instance_id)),
                    };
                    state.acquisitions.insert(
                        instance_id.clone(),
                        Acquisition {
                            session_id: session_id.to_string(),
                            instance_id: instance_id.clone(),
                            acquired_at,
                        },
                    );
                    Slot::Reused(
                        AcquiredInstance {
                            instance_id,
                            session_id: session_id.to_string(),
                            acquired_at,
                            handle,
                        },
                        events,
                    )
                }
                None if state.occupancy() >= self.max_size => {
                    return Err(FleetError::PoolExhausted {
                        active: state.acquisitions.len(),
                        max: self.max_size,
                    });
                }
                None => {
                    state.launching += 1;
                    Slot::Launch(LaunchReservation::new(Arc::clone(self)))
                }
            }
        };

        match slot {
            Slot::Reused(acquired, events) => {
                self.emit_all(events);
                self.publish_size();
                Ok((acquired, false))
            }
            Slot::Launch(reservation) => {
                let launched = self.launch(reservation, Some(session_id.to_string())).await?;
                Ok((
                    AcquiredInstance {
                        instance_id: launched.instance_id,
                        session_id: session_id.to_string(),
                        acquired_at: launched.acquired_at,
                        handle: launched.handle,
                    },
                    true,
                ))
            }
        }
    }

    async fn release(&self, instance_id: &str, session_id: &str) -> Result<()> {
        let mut events = Vec::new();
        let (handle, pages) = {
            let mut state = self.lock();
            let held_by = state.acquisitions.get(instance_id).map(|a| a.session_id.clone());
            match held_by {
                Some(holder) if holder == session_id => {}
                _ if !state.instances.contains_key(instance_id) => {
                    return Err(FleetError::InstanceNotFound(instance_id.to_string()));
                }
                _ => {
                    return Err(FleetError::NotAcquired {
                        instance_id: instance_id.to_string(),
                        session_id: session_id.to_string(),
                    });
                }
            }
            state.acquisitions.remove(instance_id);

            let Some(instance) = state.instances.get_mut(instance_id) else {
                return Err(FleetError::InstanceNotFound(instance_id.to_string()));
            };
            instance.last_used = Instant::now();
            instance.use_count += 1;
            let pages: Vec<PageId> = instance
                .pages
                .iter()
                .filter(|(_, owner)| owner.as_str() == session_id)
                .map(|(page, _)| page.clone())
                .collect();
            for page in &pages {
                instance.pages.remove(page);
            }
            if instance.state == InstanceState::Active {
                transition(instance, InstanceState::Idle, &mut events);
            }
            (instance.handle.clone(), pages)
        };
        self.released.notify_waiters();

        for page in &pages {
            if let Err(e) = handle.close_page(page).await {
                warn!(instance_id, page_id = %page, error = %e, "Failed to close page on release");
            }
            metrics::record_page(false);
        }

        self.emit_all(events);
        metrics::record_release();
        self.publish_size();
        debug!(instance_id, session_id, closed_pages = pages.len(), "Instance released");
        Ok(())
    }

    // ========================================================================
    // Pages
    // ========================================================================

    fn check_holder(state: &PoolState, instance_id: &str, session_id: &str) -> Result<()> {
        if !state.instances.contains_key(instance_id) {
            return Err(FleetError::InstanceNotFound(instance_id.to_string()));
        }
        match state.acquisitions.get(instance_id) {
            Some(a) if a.session_id == session_id => Ok(()),
            _ => Err(FleetError::NotAcquired {
                instance_id: instance_id.to_string(),
                session_id: session_id.to_string(),
            }),
        }
    }

    async fn create_page(&self, instance_id: &str, session_id: &str) -> Result<PageId> {
        let max = self.config.pool.max_pages_per_browser;
        let (handle, pending) = {
            let mut state = self.lock();
            Self::check_holder(&state, instance_id, session_id)?;
            let Some(instance) = state.instances.get_mut(instance_id) else {
                return Err(FleetError::InstanceNotFound(instance_id.to_string()));
            };
            if instance.page_load() >= max {
                return Err(FleetError::PageLimit {
                    instance_id: instance_id.to_string(),
                    max,
                });
            }
            instance.pending_pages += 1;
            (
                instance.handle.clone(),
                PendingPage {
                    shared: self,
                    instance_id,
                    active: true,
                },
            )
        };

        let result = handle.new_page().await;

        let mut state = self.lock();
        pending.resolve(&mut state);
        let page = result.map_err(|e| FleetError::Other(e.context("failed to open page")))?;
        match state.instances.get_mut(instance_id) {
            Some(instance) => {
                instance.pages.insert(page.clone(), session_id.to_string());
                instance.total_pages += 1;
                metrics::record_page(true);
                debug!(instance_id, session_id, page_id = %page, "Page created");
                Ok(page)
            }
            None => Err(FleetError::InstanceNotFound(instance_id.to_string())),
        }
    }

    async fn close_page(&self, instance_id: &str, session_id: &str, page_id: &PageId) -> Result<()> {
        let handle = {
            let mut state = self.lock();
            Self::check_holder(&state, instance_id, session_id)?;
            let Some(instance) = state.instances.get_mut(instance_id) else {
                return Err(FleetError::InstanceNotFound(instance_id.to_string()));
            };
            match instance.pages.get(page_id) {
                Some(owner) if owner == session_id => {
                    instance.pages.remove(page_id);
                }
                _ => {
                    return Err(FleetError::PageNotFound {
                        instance_id: instance_id.to_string(),
                        page_id: page_id.to_string(),
                    });
                }
            }
            instance.handle.clone()
        };

        metrics::record_page(false);
        handle
            .close_page(page_id)
            .await
            .map_err(|e| FleetError::Other(e.context("failed to close page")))
    }

    // ========================================================================
    // Launching
    // ========================================================================

    fn launch_proxy(&self, session_id: Option<&str>) -> Option<ProxyConfig> {
        if !self.config.launch.assign_proxy {
            return None;
        }
        let proxies = self.proxies.as_ref()?;
        if let Some(binding) = session_id.and_then(|s| proxies.context_binding(s)) {
            return Some(binding.proxy);
        }
        if proxies.pool().is_empty() {
            return None;
        }
        match proxies.pool().select(None, &[]) {
            Ok(proxy) => Some(proxy),
            Err(e) => {
                warn!(error = %e, "No proxy for launch, launching direct");
                None
            }
        }
    }

    /// Launch on a separate task and wait for it. If this future is
    /// dropped the task still finishes and closes what it launched.
    async fn launch(
        self: &Arc<Self>,
        reservation: LaunchReservation,
        session_id: Option<String>,
    ) -> Result<Launched> {
        let (tx, rx) = oneshot::channel();
        let shared = Arc::clone(self);
        tokio::spawn(async move {
            shared.run_launch(reservation, session_id, tx).await;
        });
        rx.await
            .map_err(|_| FleetError::LaunchFailure("launch task ended without a result".into()))?
    }

    async fn run_launch(
        self: Arc<Self>,
        reservation: LaunchReservation,
        session_id: Option<String>,
        tx: oneshot::Sender<Result<Launched>>,
    ) {
        let proxy = self.launch_proxy(session_id.as_deref());
        let proxy_id = proxy.as_ref().map(ProxyConfig::key);
        let options = LaunchOptions::from_config(&self.config.launch).with_proxy(proxy);
        let limit = self.config.pool.launch_timeout();
        let breaker = self.breakers.get_or_create(LAUNCH_BREAKER);
        let driver = Arc::clone(&self.driver);

        let started = Instant::now();
        let result = breaker
            .call(|| async {
                tokio::time::timeout(limit, driver.launch(&options))
                    .await
                    .map_err(|_| anyhow::anyhow!("launch timed out after {limit:?}"))?
            })
            .await;
        metrics::record_launch(result.is_ok(), started.elapsed().as_secs_f64());

        let handle = match result {
            Ok(handle) => handle,
            Err(e) => {
                let err = launch_error(e);
                error!(error = %err, "Browser launch failed");
                drop(reservation);
                let _ = tx.send(Err(err));
                return;
            }
        };

        let instance_id = Uuid::new_v4().to_string();
        let mut events = Vec::new();
        let registered = {
            let mut state = self.lock();
            reservation.commit(&mut state);
            if state.closing {
                Err(FleetError::ShuttingDown)
            } else if tx.is_closed() {
                Err(FleetError::AcquireTimeout(self.config.pool.acquire_timeout_ms))
            } else {
                let initial = if session_id.is_some() {
                    InstanceState::Active
                } else {
                    InstanceState::Idle
                };
                let instance = Instance::new(instance_id.clone(), handle.clone(), initial, proxy_id.clone());
                let acquired_at = Utc::now();
                if let Some(session_id) = &session_id {
                    state.acquisitions.insert(
                        instance_id.clone(),
                        Acquisition {
                            session_id: session_id.clone(),
                            instance_id: instance_id.clone(),
                            acquired_at,
                        },
                    );
                }
                state.instances.insert(instance_id.clone(), instance);
                events.push(FleetEvent::InstanceLaunched {
                    instance_id: instance_id.clone(),
                });
                Ok(acquired_at)
            }
        };

        let acquired_at = match registered {
            Ok(at) => at,
            Err(err) => {
                debug!(reason = %err, "Launched browser no longer wanted, closing");
                if let Err(e) = handle.close().await {
                    warn!(error = %e, "Failed to close unwanted browser");
                }
                let _ = tx.send(Err(err));
                return;
            }
        };

        self.emit_all(events);
        self.publish_size();
        info!(
            instance_id = %instance_id,
            proxy_id = proxy_id.as_deref().unwrap_or("direct"),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Instance launched"
        );

        let launched = Launched {
            instance_id: instance_id.clone(),
            handle,
            acquired_at,
        };
        if tx.send(Ok(launched)).is_err() {
            // The acquirer gave up between registration and hand-off.
            self.force_close(&instance_id, "acquirer_gone").await;
        }
    }

    /// Launch up to `count` idle instances within capacity. Returns how many succeeded.
    async fn launch_idle(self: &Arc<Self>, count: usize) -> usize {
        if count == 0 {
            return 0;
        }
        let reservations: Vec<LaunchReservation> = {
            let mut state = self.lock();
            if state.closing {
                return 0;
            }
            let n = count.min(self.max_size.saturating_sub(state.occupancy()));
            state.launching += n;
            (0..n).map(|_| LaunchReservation::new(Arc::clone(self))).collect()
        };

        let results = join_all(reservations.into_iter().map(|r| self.launch(r, None))).await;
        let launched = results.iter().filter(|r| r.is_ok()).count();
        if launched < results.len() {
            warn!(requested = count, launched, "Some background launches failed");
        }
        launched
    }

    // ========================================================================
    // Health
    // ========================================================================

    async fn health_check(&self) -> HashMap<String, bool> {
        let targets: Vec<(String, Arc<dyn BrowserHandle>)> = {
            let state = self.lock();
            state
                .instances
                .values()
                .filter(|i| matches!(i.state, InstanceState::Idle | InstanceState::Active))
                .map(|i| (i.id.clone(), i.handle.clone()))
                .collect()
        };
        if targets.is_empty() {
            return HashMap::new();
        }

        let breaker = self.breakers.get_or_create(HEALTH_BREAKER);
        let limit = self.config.pool.health_check_timeout();
        let probes = targets.into_iter().map(|(id, handle)| {
            let breaker = &breaker;
            async move {
                let outcome = breaker
                    .call(|| async {
                        tokio::time::timeout(limit, handle.probe())
                            .await
                            .map_err(|_| anyhow::anyhow!("probe timed out after {limit:?}"))?
                    })
                    .await;
                let usage = match outcome {
                    Ok(()) => handle.resource_usage().await.ok(),
                    Err(_) => None,
                };
                (id, outcome, usage)
            }
        });
        let results = join_all(probes).await;

        let crash_threshold = self.config.pool.crash_threshold.max(1);
        let mut report = HashMap::with_capacity(results.len());
        let mut crashed = Vec::new();
        let mut events = Vec::new();
        {
            let mut state = self.lock();
            for (id, outcome, usage) in results {
                let Some(instance) = state.instances.get_mut(&id) else {
                    continue;
                };
                let healthy = match outcome {
                    Ok(()) => {
                        instance.consecutive_failures = 0;
                        instance.health_score = (instance.health_score + 1.0) / 2.0;
                        if let Some(usage) = usage {
                            instance.resources = usage;
                        }
                        true
                    }
                    Err(e) if e.is_rejection() => {
                        debug!(instance_id = %id, "Health probe short-circuited");
                        false
                    }
                    Err(e) => {
                        instance.consecutive_failures += 1;
                        instance.health_score /= 2.0;
                        let err = FleetError::HealthCheckFailure {
                            instance_id: id.clone(),
                            reason: e.to_string(),
                        };
                        warn!(
                            error = %err,
                            failures = instance.consecutive_failures,
                            health_score = instance.health_score,
                            "Health probe failed"
                        );
                        if instance.consecutive_failures >= crash_threshold {
                            transition(instance, InstanceState::Crashed, &mut events);
                            crashed.push(id.clone());
                        }
                        false
                    }
                };
                metrics::record_health_check(healthy);
                report.insert(id, healthy);
            }
        }
        self.emit_all(events);

        for id in crashed {
            error!(instance_id = %id, "Instance crashed, force-closing");
            self.force_close(&id, "crashed").await;
        }
        report
    }

    // ========================================================================
    // Closing and recycling
    // ========================================================================

    /// Remove an instance regardless of state, closing its pages first.
    async fn force_close(&self, instance_id: &str, reason: &str) -> bool {
        let mut events = Vec::new();
        let (mut instance, held) = {
            let mut state = self.lock();
            let Some(instance) = state.instances.remove(instance_id) else {
                return false;
            };
            let held = state.acquisitions.remove(instance_id).is_some();
            (instance, held)
        };
        if held {
            self.released.notify_waiters();
        }

        for page in instance.pages.keys() {
            if let Err(e) = instance.handle.close_page(page).await {
                debug!(instance_id, page_id = %page, error = %e, "Page close failed during force-close");
            }
            metrics::record_page(false);
        }
        instance.pages.clear();
        if let Err(e) = instance.handle.close().await {
            warn!(instance_id, error = %e, "Browser close failed");
        }

        transition(&mut instance, InstanceState::Closed, &mut events);
        events.push(FleetEvent::InstanceClosed {
            instance_id: instance_id.to_string(),
            reason: reason.to_string(),
        });
        self.emit_all(events);
        self.publish_size();
        info!(instance_id, reason, "Instance closed");
        true
    }

    /// Gracefully retire an idle instance. A no-op if it is no longer idle.
    ///
    /// On close failure the instance goes back to idle for the next pass.
    async fn retire(
        self: &Arc<Self>,
        instance_id: &str,
        reason: &str,
        score: Option<f64>,
        replace: bool,
    ) -> Result<()> {
        let recycling = &self.config.recycling;
        let mut events = Vec::new();
        let (handle, pages) = {
            let mut state = self.lock();
            let Some(instance) = state.instances.get_mut(instance_id) else {
                return Ok(());
            };
            if instance.state != InstanceState::Idle {
                return Ok(());
            }
            transition(instance, InstanceState::Draining, &mut events);
            let pages: Vec<PageId> = instance.pages.keys().cloned().collect();
            (instance.handle.clone(), pages)
        };
        self.emit_all(std::mem::take(&mut events));

        if recycling.graceful {
            if replace && recycling.warmup_pool_size > 0 {
                let warmed = self.launch_idle(recycling.warmup_pool_size).await;
                debug!(instance_id, warmed, "Replacement instances warmed");
            }
            if !pages.is_empty() {
                let drain = join_all(pages.iter().map(|p| handle.close_page(p)));
                if tokio::time::timeout(recycling.drain_timeout(), drain).await.is_err() {
                    warn!(instance_id, pages = pages.len(), "Page drain timed out");
                }
            }
        }

        {
            let mut state = self.lock();
            if let Some(instance) = state.instances.get_mut(instance_id) {
                for _ in instance.pages.drain() {
                    metrics::record_page(false);
                }
                transition(instance, InstanceState::Recycling, &mut events);
            }
        }
        self.emit_all(std::mem::take(&mut events));

        match handle.close().await {
            Ok(()) => {
                {
                    let mut state = self.lock();
                    if let Some(mut instance) = state.instances.remove(instance_id) {
                        transition(&mut instance, InstanceState::Closed, &mut events);
                    }
                }
                if let Some(score) = score {
                    events.push(FleetEvent::InstanceRecycled {
                        instance_id: instance_id.to_string(),
                        score,
                        reason: reason.to_string(),
                    });
                }
                events.push(FleetEvent::InstanceClosed {
                    instance_id: instance_id.to_string(),
                    reason: reason.to_string(),
                });
                self.emit_all(events);
                metrics::record_recycle(reason);
                self.publish_size();
                info!(instance_id, reason, ?score, "Instance retired");
                Ok(())
            }
            Err(e) => {
                {
                    let mut state = self.lock();
                    if let Some(instance) = state.instances.get_mut(instance_id) {
                        transition(instance, InstanceState::Idle, &mut events);
                    }
                }
                self.emit_all(events);
                let err = FleetError::RecyclingFailure {
                    instance_id: instance_id.to_string(),
                    reason: format!("{e:#}"),
                };
                warn!(error = %err, "Recycling failed, instance returned to idle");
                Err(err)
            }
        }
    }

    async fn maintain(self: &Arc<Self>) {
        let now = Instant::now();
        let idle_timeout = self.config.pool.idle_timeout();

        let (expired, candidates) = {
            let state = self.lock();
            let mut stale: Vec<(&Instance, Duration)> = state
                .instances
                .values()
                .filter(|i| i.state == InstanceState::Idle)
                .map(|i| (i, now.duration_since(i.last_used)))
                .filter(|(_, idle_for)| !idle_timeout.is_zero() && *idle_for >= idle_timeout)
                .collect();
            stale.sort_by(|a, b| b.1.cmp(&a.1));
            let surplus = state.instances.len().saturating_sub(self.min_size);
            let expired: Vec<String> = stale.into_iter().take(surplus).map(|(i, _)| i.id.clone()).collect();

            let candidates: Vec<_> = state
                .instances
                .values()
                .filter(|i| !expired.contains(&i.id))
                .map(|i| (i.id.clone(), i.state, i.recycle_input(now)))
                .collect();
            (expired, candidates)
        };

        for id in &expired {
            let _ = self.retire(id, "idle_timeout", None, false).await;
        }

        let decisions = {
            let mut recycler = self.recycler.lock().unwrap_or_else(PoisonError::into_inner);
            if recycler.batch_ready(now) {
                let decisions = recycler.select(&candidates);
                if !decisions.is_empty() {
                    recycler.mark_batch(now);
                }
                decisions
            } else {
                Vec::new()
            }
        };
        for decision in decisions {
            let _ = self
                .retire(&decision.instance_id, &decision.reason, Some(decision.score), true)
                .await;
        }
    }

    async fn scale(self: &Arc<Self>) {
        let (total, active) = {
            let state = self.lock();
            let live = state
                .instances
                .values()
                .filter(|i| !i.state.is_retiring())
                .count();
            (live + state.launching, state.acquisitions.len())
        };
        let decision = self
            .scaler
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .evaluate(total, active, Instant::now());
        let Some(decision) = decision else {
            return;
        };

        metrics::record_scaling(decision.direction);
        self.events.emit(FleetEvent::ScalingDecision {
            direction: decision.direction,
            from: decision.from,
            to: decision.to,
            utilization: decision.utilization,
        });
        info!(
            direction = %decision.direction,
            from = decision.from,
            to = decision.to,
            utilization = decision.utilization,
            "Scaling pool"
        );

        if decision.to > decision.from {
            self.launch_idle(decision.to - decision.from).await;
        } else {
            let surplus = decision.from - decision.to;
            let victims: Vec<String> = {
                let state = self.lock();
                let mut idle: Vec<&Instance> = state
                    .instances
                    .values()
                    .filter(|i| i.state == InstanceState::Idle)
                    .collect();
                idle.sort_by_key(|i| i.last_used);
                idle.into_iter().take(surplus).map(|i| i.id.clone()).collect()
            };
            for id in victims {
                let _ = self.retire(&id, "scale_down", None, false).await;
            }
        }
    }

    // ========================================================================
    // Shutdown
    // ========================================================================

    async fn shutdown(&self) {
        {
            let mut state = self.lock();
            if state.closing {
                return;
            }
            state.closing = true;
        }
        info!("Pool shutting down");
        self.cancel.cancel();

        let deadline = Instant::now() + self.config.pool.shutdown_grace();
        loop {
            let released = self.released.notified();
            let active = self.lock().acquisitions.len();
            if active == 0 {
                break;
            }
            if tokio::time::timeout_at(deadline, released).await.is_err() {
                warn!(active, "Shutdown grace period elapsed, force-closing held instances");
                break;
            }
        }

        let ids: Vec<String> = self.lock().instances.keys().cloned().collect();
        join_all(ids.iter().map(|id| self.force_close(id, "shutdown"))).await;

        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner));
        for task in tasks {
            let _ = task.await;
        }
        if let Some(proxies) = &self.proxies {
            proxies.shutdown().await;
        }
        self.publish_size();
        info!(closed = ids.len(), "Pool shut down");
    }
}

#[async_trait::async_trait]
impl PoolBackend for PoolManager {
    fn name(&self) -> &'static str {
        "optimized"
    }

    async fn acquire(&self, session_id: &str) -> Result<AcquiredInstance> {
        PoolManager::acquire(self, session_id).await
    }

    async fn release(&self, instance_id: &str, session_id: &str) -> Result<()> {
        PoolManager::release(self, instance_id, session_id).await
    }

    async fn create_page(&self, instance_id: &str, session_id: &str) -> Result<PageId> {
        PoolManager::create_page(self, instance_id, session_id).await
    }

    async fn close_page(&self, instance_id: &str, session_id: &str, page_id: &PageId) -> Result<()> {
        PoolManager::close_page(self, instance_id, session_id, page_id).await
    }

    async fn health_check(&self) -> HashMap<String, bool> {
        PoolManager::health_check(self).await
    }

    fn stats(&self) -> PoolStats {
        PoolManager::stats(self)
    }

    async fn shutdown(&self) {
        PoolManager::shutdown(self).await
    }
}
