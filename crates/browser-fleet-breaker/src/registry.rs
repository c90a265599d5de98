//! Named breaker registry with a background sweeper.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use browser_fleet_core::config::CircuitBreakerConfig;
use browser_fleet_core::events::EventBus;

use crate::breaker::{BreakerStats, CircuitBreaker};

/// Holds one breaker per operation name, all sharing a config.
pub struct BreakerRegistry {
    config: CircuitBreakerConfig,
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
    events: Option<Arc<EventBus>>,
}

impl BreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            breakers: RwLock::new(HashMap::new()),
            events: None,
        }
    }

    /// Breakers created from now on publish on `events`.
    pub fn with_events(mut self, events: Arc<EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    /// Return the breaker for `name`, creating it on first use.
    pub fn get_or_create(&self, name: &str) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.get(name) {
            return existing;
        }
        let mut breakers = self
            .breakers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        breakers
            .entry(name.to_string())
            .or_insert_with(|| {
                debug!(breaker = name, "Creating circuit breaker");
                let breaker = CircuitBreaker::new(name, self.config.clone());
                Arc::new(match &self.events {
                    Some(events) => breaker.with_events(events.clone()),
                    None => breaker,
                })
            })
            .clone()
    }

    pub fn get(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    /// Names of all registered breakers, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .breakers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// Stats for every breaker, sorted by name.
    pub fn stats(&self) -> Vec<BreakerStats> {
        let mut stats: Vec<BreakerStats> = self.all().iter().map(|b| b.stats()).collect();
        stats.sort_by(|a, b| a.name.cmp(&b.name));
        stats
    }

    pub fn reset_all(&self) {
        for breaker in self.all() {
            breaker.reset();
        }
    }

    /// Sweep every breaker once.
    pub fn sweep(&self) {
        for breaker in self.all() {
            breaker.sweep();
        }
    }

    /// Sweep all breakers every `cleanup_interval` until cancelled.
    ///
    /// Returns `None` when the interval is zero; calls still prune their
    /// own window, so the breakers stay bounded without the sweeper.
    pub fn spawn_sweeper(self: &Arc<Self>, cancel: CancellationToken) -> Option<JoinHandle<()>> {
        let period = self.config.cleanup_interval();
        if period.is_zero() {
            debug!("Zero cleanup interval, breaker sweeper disabled");
            return None;
        }
        let registry = Arc::clone(self);
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        info!("Breaker sweeper stopped");
                        break;
                    }
                    _ = ticker.tick() => registry.sweep(),
                }
            }
        }))
    }

    fn all(&self) -> Vec<Arc<CircuitBreaker>> {
        self.breakers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use browser_fleet_core::types::CircuitState;

    use super::*;

    fn config() -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            timeout_ms: 1_000,
            cleanup_interval_ms: 500,
            ..CircuitBreakerConfig::default()
        }
    }

    #[test]
    fn test_get_or_create_returns_same_instance() {
        let registry = BreakerRegistry::new(config());
        let a = registry.get_or_create("launch");
        let b = registry.get_or_create("launch");
        assert!(Arc::ptr_eq(&a, &b));
        assert!(registry.get("healthCheck").is_none());
        registry.get_or_create("healthCheck");
        assert_eq!(registry.names(), vec!["healthCheck", "launch"]);
    }

    #[test]
    fn test_reset_all_closes_everything() {
        let registry = BreakerRegistry::new(config());
        registry.get_or_create("a").force_open();
        registry.get_or_create("b").force_open();
        registry.reset_all();
        assert!(
            registry
                .stats()
                .iter()
                .all(|s| s.state == CircuitState::Closed)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_advances_expired_circuits() {
        let registry = Arc::new(BreakerRegistry::new(config()));
        let breaker = registry.get_or_create("launch");
        breaker.force_open();

        let cancel = CancellationToken::new();
        let handle = registry.spawn_sweeper(cancel.clone()).unwrap();

        tokio::time::sleep(Duration::from_millis(1_600)).await;
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_cleanup_interval_disables_sweeper() {
        let registry = Arc::new(BreakerRegistry::new(CircuitBreakerConfig {
            cleanup_interval_ms: 0,
            ..config()
        }));
        let breaker = registry.get_or_create("launch");
        assert!(registry.spawn_sweeper(CancellationToken::new()).is_none());

        // Breakers still advance and prune on their own calls.
        breaker.force_open();
        tokio::time::advance(Duration::from_millis(1_000)).await;
        breaker.call(|| async { Ok(()) }).await.unwrap();
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
    }
}
