//! Context → proxy bindings with timed rotation.
//!
//! Each context holds at most one binding. Rotation swaps it under the
//! context lock, so readers see either the old or the new proxy.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use browser_fleet_core::config::{ContextProxyConfig, ProxyConfig, ProxyPoolConfig, SelectionStrategy};
use browser_fleet_core::error::{FleetError, Result};
use browser_fleet_core::events::{EventBus, FleetEvent};
use browser_fleet_core::metrics;

use crate::bypass::BypassRules;
use crate::pool::ProxyPool;

/// The proxy currently bound to a context.
#[derive(Debug, Clone, Serialize)]
pub struct ContextBinding {
    pub context_id: String,
    pub proxy_id: String,
    pub proxy: ProxyConfig,
    pub bound_at: DateTime<Utc>,
    pub rotations: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rotation_interval_ms: Option<u64>,
}

struct ContextEntry {
    binding: ContextBinding,
    strategy: Option<SelectionStrategy>,
    bypass: BypassRules,
    timer: Option<CancellationToken>,
}

pub struct ContextProxyManager {
    pool: Arc<ProxyPool>,
    rotate_by_default: bool,
    default_interval: Duration,
    contexts: Mutex<HashMap<String, ContextEntry>>,
    events: Option<Arc<EventBus>>,
    cancel: CancellationToken,
}

impl ContextProxyManager {
    pub fn new(pool: Arc<ProxyPool>, config: &ProxyPoolConfig, events: Option<Arc<EventBus>>) -> Self {
        Self {
            pool,
            rotate_by_default: config.rotate_on_interval,
            default_interval: config.rotation_interval(),
            contexts: Mutex::new(HashMap::new()),
            events,
            cancel: CancellationToken::new(),
        }
    }

    /// Bind a proxy to `context_id`, replacing any previous binding, and
    /// schedule rotation if requested.
    pub fn configure_context_proxy(
        self: &Arc<Self>,
        context_id: &str,
        config: ContextProxyConfig,
    ) -> Result<ContextBinding> {
        if self.cancel.is_cancelled() {
            return Err(FleetError::ShuttingDown);
        }

        let proxy = match &config.proxy {
            Some(explicit) => {
                let id = self.pool.register(explicit.clone());
                self.pool
                    .get(&id)
                    .map(|p| p.config)
                    .ok_or(FleetError::ProxyNotFound(id))?
            }
            None => {
                if self.pool.is_empty() {
                    return Err(FleetError::ProxyPoolEmpty(format!(
                        "no proxies configured for context {context_id}"
                    )));
                }
                self.pool.select(config.strategy, &[])?
            }
        };

        let rotate = config.rotate_on_interval || self.rotate_by_default;
        let interval = config
            .rotation_interval_ms
            .map(Duration::from_millis)
            .unwrap_or(self.default_interval);

        let binding = ContextBinding {
            context_id: context_id.to_string(),
            proxy_id: proxy.key(),
            proxy,
            bound_at: Utc::now(),
            rotations: 0,
            rotation_interval_ms: rotate.then_some(interval.as_millis() as u64),
        };

        let timer = (rotate && !interval.is_zero()).then(|| self.spawn_rotation(context_id, interval));

        let previous = {
            let mut contexts = self.lock();
            let previous = contexts.insert(
                context_id.to_string(),
                ContextEntry {
                    binding: binding.clone(),
                    strategy: config.strategy,
                    bypass: BypassRules::new(&config.bypass),
                    timer,
                },
            );
            previous.map(|old| {
                if let Some(timer) = old.timer {
                    timer.cancel();
                }
                old.binding.proxy_id
            })
        };

        info!(
            context_id,
            proxy_id = %binding.proxy_id,
            rotate,
            "Context proxy configured"
        );
        self.emit_rotated(context_id, previous, &binding.proxy_id);
        Ok(binding)
    }

    /// Rebind the context to a different proxy.
    ///
    /// Returns `None` for an unknown context. If no other proxy is
    /// available the current binding is kept.
    pub fn rotate_context_proxy(&self, context_id: &str) -> Result<Option<ContextBinding>> {
        let (binding, previous) = {
            let mut contexts = self.lock();
            let Some(entry) = contexts.get_mut(context_id) else {
                return Ok(None);
            };

            let current = entry.binding.proxy_id.clone();
            match self.pool.select(entry.strategy, std::slice::from_ref(&current)) {
                Ok(next) => {
                    entry.binding.proxy_id = next.key();
                    entry.binding.proxy = next;
                    entry.binding.bound_at = Utc::now();
                    entry.binding.rotations += 1;
                    (entry.binding.clone(), current)
                }
                Err(FleetError::ProxyPoolEmpty(_)) => {
                    debug!(context_id, proxy_id = %current, "No alternative proxy, keeping binding");
                    return Ok(Some(entry.binding.clone()));
                }
                Err(e) => return Err(e),
            }
        };

        metrics::record_proxy_rotation();
        info!(context_id, from = %previous, to = %binding.proxy_id, "Context proxy rotated");
        self.emit_rotated(context_id, Some(previous), &binding.proxy_id);
        Ok(Some(binding))
    }

    /// Drop the context's binding and stop its rotation timer.
    pub fn remove_context(&self, context_id: &str) -> bool {
        let removed = self.lock().remove(context_id);
        match removed {
            Some(entry) => {
                if let Some(timer) = entry.timer {
                    timer.cancel();
                }
                debug!(context_id, "Context removed");
                true
            }
            None => false,
        }
    }

    pub fn context_binding(&self, context_id: &str) -> Option<ContextBinding> {
        self.lock().get(context_id).map(|e| e.binding.clone())
    }

    /// Bypass rules configured for the context, if any.
    pub fn context_bypass(&self, context_id: &str) -> Option<BypassRules> {
        self.lock()
            .get(context_id)
            .filter(|e| !e.bypass.is_empty())
            .map(|e| e.bypass.clone())
    }

    /// Ids of all bound contexts, sorted.
    pub fn contexts(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Cancel every rotation timer and drop all bindings.
    pub fn shutdown(&self) {
        self.cancel.cancel();
        let drained: Vec<ContextEntry> = self.lock().drain().map(|(_, e)| e).collect();
        debug!(contexts = drained.len(), "Context proxy manager stopped");
    }

    fn spawn_rotation(self: &Arc<Self>, context_id: &str, period: Duration) -> CancellationToken {
        let token = self.cancel.child_token();
        let cancel = token.clone();
        let manager: Weak<Self> = Arc::downgrade(self);
        let context_id = context_id.to_string();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(manager) = manager.upgrade() else { break };
                        if let Err(e) = manager.rotate_context_proxy(&context_id) {
                            debug!(context_id = %context_id, %e, "Scheduled rotation failed");
                        }
                    }
                }
            }
        });
        token
    }

    fn emit_rotated(&self, context_id: &str, previous: Option<String>, current: &str) {
        if let Some(events) = &self.events {
            events.emit(FleetEvent::ProxyRotated {
                context_id: context_id.to_string(),
                previous,
                current: current.to_string(),
            });
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, ContextEntry>> {
        self.contexts.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use browser_fleet_core::events::EventKind;

    use super::*;

    fn setup(n: u16) -> (Arc<ContextProxyManager>, Arc<EventBus>) {
        let config = ProxyPoolConfig {
            proxies: (0..n).map(|i| ProxyConfig::new("10.1.1.1", 3000 + i)).collect(),
            ..ProxyPoolConfig::default()
        };
        let events = Arc::new(EventBus::new());
        let pool = Arc::new(ProxyPool::new(&config));
        let manager = ContextProxyManager::new(pool, &config, Some(events.clone()));
        (Arc::new(manager), events)
    }

    #[tokio::test]
    async fn test_configure_binds_and_emits() {
        let (manager, events) = setup(2);
        let (_id, mut rx) = events.subscribe_channel(EventKind::ProxyRotated);

        let binding = manager
            .configure_context_proxy("ctx", ContextProxyConfig::default())
            .unwrap();
        assert_eq!(manager.context_binding("ctx").unwrap().proxy_id, binding.proxy_id);
        assert_eq!(manager.contexts(), vec!["ctx"]);

        let event = rx.recv().await.unwrap();
        assert!(matches!(event, FleetEvent::ProxyRotated { previous: None, .. }));
    }

    #[tokio::test]
    async fn test_explicit_proxy_is_registered_and_bound() {
        let (manager, _) = setup(0);
        let config = ContextProxyConfig {
            proxy: Some(ProxyConfig::new("192.168.0.9", 3128)),
            ..Default::default()
        };
        let binding = manager.configure_context_proxy("ctx", config).unwrap();
        assert_eq!(binding.proxy_id, "192.168.0.9:3128");
        assert!(manager.pool.get("192.168.0.9:3128").is_some());
    }

    #[tokio::test]
    async fn test_empty_pool_without_explicit_proxy_fails() {
        let (manager, _) = setup(0);
        let err = manager
            .configure_context_proxy("ctx", ContextProxyConfig::default())
            .unwrap_err();
        assert!(matches!(err, FleetError::ProxyPoolEmpty(_)));
    }

    #[tokio::test]
    async fn test_rotation_excludes_current_proxy() {
        let (manager, events) = setup(3);
        let first = manager
            .configure_context_proxy("ctx", ContextProxyConfig::default())
            .unwrap();
        let (_id, mut rx) = events.subscribe_channel(EventKind::ProxyRotated);

        let rotated = manager.rotate_context_proxy("ctx").unwrap().unwrap();
        assert_ne!(rotated.proxy_id, first.proxy_id);
        assert_eq!(rotated.rotations, 1);

        let event = rx.recv().await.unwrap();
        assert_eq!(
            event,
            FleetEvent::ProxyRotated {
                context_id: "ctx".into(),
                previous: Some(first.proxy_id),
                current: rotated.proxy_id,
            }
        );
    }

    #[tokio::test]
    async fn test_rotation_without_alternative_keeps_binding() {
        let (manager, events) = setup(1);
        let first = manager
            .configure_context_proxy("ctx", ContextProxyConfig::default())
            .unwrap();
        let (_id, mut rx) = events.subscribe_channel(EventKind::ProxyRotated);

        let kept = manager.rotate_context_proxy("ctx").unwrap().unwrap();
        assert_eq!(kept.proxy_id, first.proxy_id);
        assert_eq!(kept.rotations, 0);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unknown_context_rotation_is_none() {
        let (manager, _) = setup(2);
        assert!(manager.rotate_context_proxy("missing").unwrap().is_none());
        assert!(!manager.remove_context("missing"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_rotation_until_removed() {
        let (manager, _) = setup(2);
        let config = ContextProxyConfig {
            rotate_on_interval: true,
            rotation_interval_ms: Some(1_000),
            ..Default::default()
        };
        manager.configure_context_proxy("ctx", config).unwrap();

        tokio::time::sleep(Duration::from_millis(3_500)).await;
        assert_eq!(manager.context_binding("ctx").unwrap().rotations, 3);

        assert!(manager.remove_context("ctx"));
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(manager.context_binding("ctx").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_stops_timers_and_rejects_new_contexts() {
        let (manager, _) = setup(2);
        let config = ContextProxyConfig {
            rotate_on_interval: true,
            rotation_interval_ms: Some(1_000),
            ..Default::default()
        };
        manager.configure_context_proxy("ctx", config).unwrap();
        manager.shutdown();

        assert!(manager.contexts().is_empty());
        assert!(matches!(
            manager.configure_context_proxy("other", ContextProxyConfig::default()),
            Err(FleetError::ShuttingDown)
        ));
    }

    #[tokio::test]
    async fn test_context_bypass_rules() {
        let (manager, _) = setup(1);
        let config = ContextProxyConfig {
            bypass: vec!["*.internal".into()],
            ..Default::default()
        };
        manager.configure_context_proxy("ctx", config).unwrap();
        let rules = manager.context_bypass("ctx").unwrap();
        assert!(rules.matches("https://svc.internal/"));
        assert!(manager.context_bypass("missing").is_none());
    }
}
