//! Circuit breaker: guards a named operation against cascading failures.
//!
//! CLOSED counts outcomes in a sliding window and opens once the window
//! holds at least `minimum_throughput` completed calls and
//! `failure_threshold` failures. OPEN rejects everything until the current
//! timeout elapses, then HALF_OPEN admits one trial at a time:
//! `success_threshold` successes close the circuit, a single failure
//! re-opens it with a longer timeout.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use browser_fleet_core::config::CircuitBreakerConfig;
use browser_fleet_core::error::FleetError;
use browser_fleet_core::events::{EventBus, FleetEvent};
use browser_fleet_core::metrics;
use browser_fleet_core::types::CircuitState;

use crate::cache::ResultCache;

/// Why a guarded call produced no value.
#[derive(Debug, Error)]
pub enum BreakerError {
    #[error("circuit '{name}' is {state}; retry in {retry_in:?}")]
    Open {
        name: String,
        state: CircuitState,
        retry_in: Duration,
    },

    #[error("'{name}' failed (circuit {state}): {error}")]
    Failed {
        name: String,
        state: CircuitState,
        error: anyhow::Error,
    },
}

impl BreakerError {
    /// Circuit state at the time of the failure.
    pub fn state(&self) -> CircuitState {
        match self {
            Self::Open { state, .. } | Self::Failed { state, .. } => *state,
        }
    }

    /// True if the operation was never invoked.
    pub fn is_rejection(&self) -> bool {
        matches!(self, Self::Open { .. })
    }
}

impl From<BreakerError> for FleetError {
    fn from(err: BreakerError) -> Self {
        match err {
            BreakerError::Open { name, state, .. } => FleetError::CircuitOpen { name, state },
            BreakerError::Failed { error, .. } => FleetError::Other(error),
        }
    }
}

/// What produced the value of a successful [`Execution`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Served {
    Operation,
    Fallback,
    Cache,
}

/// A value obtained through the breaker.
#[derive(Debug, Clone)]
pub struct Execution<T> {
    pub value: T,
    pub served_by: Served,
    /// Circuit state after the call.
    pub state: CircuitState,
}

/// Point-in-time view of a breaker.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerStats {
    pub name: String,
    pub state: CircuitState,
    pub current_timeout_ms: u64,
    pub window_successes: usize,
    pub window_failures: usize,
    pub window_rejections: usize,
    pub total_requests: u64,
    pub total_successes: u64,
    pub total_failures: u64,
    pub total_rejections: u64,
    pub total_fallbacks: u64,
    pub total_cache_hits: u64,
    pub state_transitions: u64,
    pub cache_entries: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Success,
    Failure,
    Rejected,
}

#[derive(Debug, Default)]
struct Totals {
    requests: u64,
    successes: u64,
    failures: u64,
    rejections: u64,
    fallbacks: u64,
    cache_hits: u64,
    transitions: u64,
}

struct Inner {
    state: CircuitState,
    window: VecDeque<(Instant, Outcome)>,
    current_timeout: Duration,
    opened_at: Option<Instant>,
    /// OPEN entries since the circuit last closed; drives backoff.
    opens_since_close: u32,
    half_open_successes: u32,
    trial_in_flight: bool,
    totals: Totals,
}

type Transition = (CircuitState, CircuitState);

enum Admission {
    Allowed { trial: bool },
    Rejected { state: CircuitState, retry_in: Duration },
}

/// Circuit breaker for one named operation (e.g. "launch", "healthCheck").
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
    cache: Mutex<ResultCache>,
    events: Option<Arc<EventBus>>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        let cache = ResultCache::new(config.cache_ttl(), config.max_cache_size);
        Self {
            name: name.into(),
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                window: VecDeque::new(),
                current_timeout: config.timeout(),
                opened_at: None,
                opens_since_close: 0,
                half_open_successes: 0,
                trial_in_flight: false,
                totals: Totals::default(),
            }),
            cache: Mutex::new(cache),
            config,
            events: None,
        }
    }

    /// Publish state changes on the given bus.
    pub fn with_events(mut self, events: Arc<EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Current state. Does not advance OPEN to HALF_OPEN; calls and sweeps do that.
    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    /// Run `operation` through the breaker, serving from the cache on failure.
    pub async fn execute<T, F, Fut>(
        &self,
        operation: F,
        cache_key: Option<&str>,
    ) -> Result<Execution<T>, BreakerError>
    where
        T: Clone + Send + Sync + 'static,
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        self.run(
            operation,
            None::<fn() -> std::future::Ready<anyhow::Result<T>>>,
            cache_key,
        )
        .await
    }

    /// Run `operation` through the breaker; on failure or rejection try
    /// `fallback`, then the cache.
    pub async fn execute_with_fallback<T, F, Fut, G, GFut>(
        &self,
        operation: F,
        fallback: G,
        cache_key: Option<&str>,
    ) -> Result<Execution<T>, BreakerError>
    where
        T: Clone + Send + Sync + 'static,
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
        G: FnOnce() -> GFut,
        GFut: Future<Output = anyhow::Result<T>>,
    {
        self.run(operation, Some(fallback), cache_key).await
    }

    /// Run `operation` with no fallback or cache, returning the bare value.
    pub async fn call<T, F, Fut>(&self, operation: F) -> Result<T, BreakerError>
    where
        T: Clone + Send + Sync + 'static,
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        self.execute(operation, None).await.map(|e| e.value)
    }

    async fn run<T, F, Fut, G, GFut>(
        &self,
        operation: F,
        fallback: Option<G>,
        cache_key: Option<&str>,
    ) -> Result<Execution<T>, BreakerError>
    where
        T: Clone + Send + Sync + 'static,
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
        G: FnOnce() -> GFut,
        GFut: Future<Output = anyhow::Result<T>>,
    {
        let error = match self.admit() {
            Admission::Allowed { trial } => {
                let mut guard = TrialGuard {
                    breaker: self,
                    armed: trial,
                };
                let result = operation().await;
                guard.armed = false;

                match result {
                    Ok(value) => {
                        self.on_success(trial);
                        if let Some(key) = cache_key {
                            self.lock_cache().put(key, value.clone(), Instant::now());
                        }
                        return Ok(Execution {
                            value,
                            served_by: Served::Operation,
                            state: self.state(),
                        });
                    }
                    Err(e) => {
                        self.on_failure(trial, &e);
                        BreakerError::Failed {
                            name: self.name.clone(),
                            state: self.state(),
                            error: e,
                        }
                    }
                }
            }
            Admission::Rejected { state, retry_in } => {
                metrics::record_breaker_rejection(&self.name);
                debug!(breaker = %self.name, %state, ?retry_in, "Call rejected");
                BreakerError::Open {
                    name: self.name.clone(),
                    state,
                    retry_in,
                }
            }
        };

        if let Some(fallback) = fallback {
            match fallback().await {
                Ok(value) => {
                    self.lock().totals.fallbacks += 1;
                    debug!(breaker = %self.name, "Served by fallback");
                    return Ok(Execution {
                        value,
                        served_by: Served::Fallback,
                        state: self.state(),
                    });
                }
                Err(e) => {
                    warn!(breaker = %self.name, %e, "Fallback failed");
                }
            }
        }

        if let Some(key) = cache_key {
            let cached = self.lock_cache().get::<T>(key, Instant::now());
            if let Some(value) = cached {
                self.lock().totals.cache_hits += 1;
                debug!(breaker = %self.name, key, "Served from cache");
                return Ok(Execution {
                    value,
                    served_by: Served::Cache,
                    state: self.state(),
                });
            }
        }

        Err(error)
    }

    /// Prune the event window and cache, and move an expired OPEN circuit
    /// to HALF_OPEN.
    pub fn sweep(&self) {
        let now = Instant::now();
        let transition = {
            let mut inner = self.lock();
            self.prune(&mut inner, now);
            self.poll_open_timeout(&mut inner, now)
        };
        let removed = self.lock_cache().sweep(now);
        if removed > 0 {
            debug!(breaker = %self.name, removed, "Expired cache entries swept");
        }
        self.publish(transition);
    }

    /// Force the circuit CLOSED with the base timeout and an empty window.
    pub fn reset(&self) {
        let transition = {
            let mut inner = self.lock();
            inner.window.clear();
            inner.half_open_successes = 0;
            inner.trial_in_flight = false;
            self.close(&mut inner)
        };
        info!(breaker = %self.name, "Circuit breaker reset");
        self.publish(transition);
    }

    /// Trip the circuit manually.
    pub fn force_open(&self) {
        let transition = {
            let mut inner = self.lock();
            self.open(&mut inner, Instant::now())
        };
        self.publish(transition);
    }

    pub fn stats(&self) -> BreakerStats {
        let cache_entries = self.lock_cache().len();
        let inner = self.lock();
        let count = |o: Outcome| inner.window.iter().filter(|(_, x)| *x == o).count();
        BreakerStats {
            name: self.name.clone(),
            state: inner.state,
            current_timeout_ms: inner.current_timeout.as_millis() as u64,
            window_successes: count(Outcome::Success),
            window_failures: count(Outcome::Failure),
            window_rejections: count(Outcome::Rejected),
            total_requests: inner.totals.requests,
            total_successes: inner.totals.successes,
            total_failures: inner.totals.failures,
            total_rejections: inner.totals.rejections,
            total_fallbacks: inner.totals.fallbacks,
            total_cache_hits: inner.totals.cache_hits,
            state_transitions: inner.totals.transitions,
            cache_entries,
        }
    }

    // ========================================================================
    // State machine
    // ========================================================================

    fn admit(&self) -> Admission {
        let now = Instant::now();
        let (admission, transition) = {
            let mut inner = self.lock();
            inner.totals.requests += 1;
            let transition = self.poll_open_timeout(&mut inner, now);

            let admission = match inner.state {
                CircuitState::Closed => Admission::Allowed { trial: false },
                CircuitState::HalfOpen if !inner.trial_in_flight => {
                    inner.trial_in_flight = true;
                    Admission::Allowed { trial: true }
                }
                state => {
                    inner.totals.rejections += 1;
                    inner.window.push_back((now, Outcome::Rejected));
                    self.prune(&mut inner, now);
                    let retry_in = match (state, inner.opened_at) {
                        (CircuitState::Open, Some(at)) => {
                            (at + inner.current_timeout).saturating_duration_since(now)
                        }
                        _ => Duration::ZERO,
                    };
                    Admission::Rejected { state, retry_in }
                }
            };
            (admission, transition)
        };
        self.publish(transition);
        admission
    }

    fn on_success(&self, trial: bool) {
        let now = Instant::now();
        let transition = {
            let mut inner = self.lock();
            inner.totals.successes += 1;
            inner.window.push_back((now, Outcome::Success));
            self.prune(&mut inner, now);
            if trial {
                inner.trial_in_flight = false;
            }

            if inner.state == CircuitState::HalfOpen {
                inner.half_open_successes += 1;
                if inner.half_open_successes >= self.config.success_threshold {
                    inner.window.clear();
                    self.close(&mut inner)
                } else {
                    None
                }
            } else {
                None
            }
        };
        self.publish(transition);
    }

    fn on_failure(&self, trial: bool, error: &anyhow::Error) {
        let now = Instant::now();
        let transition = {
            let mut inner = self.lock();
            inner.totals.failures += 1;
            inner.window.push_back((now, Outcome::Failure));
            if trial {
                inner.trial_in_flight = false;
            }

            match inner.state {
                CircuitState::HalfOpen => {
                    warn!(breaker = %self.name, %error, "Trial call failed, re-opening");
                    self.open(&mut inner, now)
                }
                CircuitState::Closed => {
                    self.prune(&mut inner, now);
                    let failures = inner
                        .window
                        .iter()
                        .filter(|(_, o)| *o == Outcome::Failure)
                        .count();
                    let completed = inner
                        .window
                        .iter()
                        .filter(|(_, o)| *o != Outcome::Rejected)
                        .count();
                    debug!(breaker = %self.name, failures, completed, %error, "Guarded call failed");

                    if completed >= self.config.minimum_throughput as usize
                        && failures >= self.config.failure_threshold as usize
                    {
                        self.open(&mut inner, now)
                    } else {
                        None
                    }
                }
                CircuitState::Open => None,
            }
        };
        self.publish(transition);
    }

    fn poll_open_timeout(&self, inner: &mut Inner, now: Instant) -> Option<Transition> {
        if inner.state != CircuitState::Open {
            return None;
        }
        let opened_at = inner.opened_at?;
        if now.duration_since(opened_at) < inner.current_timeout {
            return None;
        }
        inner.half_open_successes = 0;
        inner.trial_in_flight = false;
        self.set_state(inner, CircuitState::HalfOpen)
    }

    fn open(&self, inner: &mut Inner, now: Instant) -> Option<Transition> {
        if inner.opens_since_close > 0 && self.config.exponential_backoff {
            let grown = inner
                .current_timeout
                .mul_f64(self.config.backoff_multiplier.max(1.0));
            inner.current_timeout = grown.min(self.config.max_timeout());
        } else if inner.opens_since_close == 0 {
            inner.current_timeout = self.config.timeout().min(self.config.max_timeout());
        }
        inner.opens_since_close += 1;
        inner.opened_at = Some(now);
        inner.half_open_successes = 0;
        inner.trial_in_flight = false;
        warn!(
            breaker = %self.name,
            timeout_ms = inner.current_timeout.as_millis() as u64,
            "Circuit breaker opened"
        );
        self.set_state(inner, CircuitState::Open)
    }

    fn close(&self, inner: &mut Inner) -> Option<Transition> {
        inner.current_timeout = self.config.timeout();
        inner.opens_since_close = 0;
        inner.opened_at = None;
        inner.half_open_successes = 0;
        self.set_state(inner, CircuitState::Closed)
    }

    fn set_state(&self, inner: &mut Inner, to: CircuitState) -> Option<Transition> {
        let from = inner.state;
        if from == to {
            return None;
        }
        inner.state = to;
        inner.totals.transitions += 1;
        Some((from, to))
    }

    fn prune(&self, inner: &mut Inner, now: Instant) {
        let window = self.config.time_window();
        while let Some((at, _)) = inner.window.front() {
            if now.duration_since(*at) > window {
                inner.window.pop_front();
            } else {
                break;
            }
        }
        while inner.window.len() > self.config.max_history {
            inner.window.pop_front();
        }
    }

    fn publish(&self, transition: Option<Transition>) {
        let Some((from, to)) = transition else {
            return;
        };
        info!(breaker = %self.name, %from, %to, "Circuit state changed");
        metrics::record_breaker_transition(&self.name, to);
        if let Some(events) = &self.events {
            events.emit(FleetEvent::CircuitStateChanged {
                name: self.name.clone(),
                from,
                to,
            });
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_cache(&self) -> MutexGuard<'_, ResultCache> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Frees the HALF_OPEN trial slot if the guarded future is dropped mid-call.
struct TrialGuard<'a> {
    breaker: &'a CircuitBreaker,
    armed: bool,
}

impl Drop for TrialGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.breaker.lock().trial_in_flight = false;
        }
    }
}
