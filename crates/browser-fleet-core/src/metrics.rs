//! Metrics recording helpers.
//!
//! Everything goes through the `metrics` facade, which is a no-op until a
//! recorder (e.g. the Prometheus exporter in the CLI) is installed.

use crate::types::{CircuitState, ScaleDirection};

/// Record the outcome of an acquire call ("reused", "launched", or an error kind).
pub fn record_acquire(outcome: &str) {
    let labels = [("outcome", outcome.to_string())];
    metrics::counter!("pool_acquire_total", &labels).increment(1);
}

/// Record a release.
pub fn record_release() {
    metrics::counter!("pool_release_total").increment(1);
}

/// Record a browser launch and how long it took.
pub fn record_launch(success: bool, duration_secs: f64) {
    let labels = [("success", success.to_string())];
    metrics::counter!("pool_launch_total", &labels).increment(1);
    metrics::histogram!("pool_launch_duration_seconds", &labels).record(duration_secs);
}

/// Publish the current pool occupancy.
pub fn record_pool_size(total: usize, active: usize, idle: usize) {
    metrics::gauge!("pool_instances_total").set(total as f64);
    metrics::gauge!("pool_instances_active").set(active as f64);
    metrics::gauge!("pool_instances_idle").set(idle as f64);
}

/// Record a page opening or closing.
pub fn record_page(opened: bool) {
    if opened {
        metrics::gauge!("pool_pages_open").increment(1.0);
    } else {
        metrics::gauge!("pool_pages_open").decrement(1.0);
    }
}

/// Record a health probe result.
pub fn record_health_check(healthy: bool) {
    let labels = [("healthy", healthy.to_string())];
    metrics::counter!("pool_health_checks_total", &labels).increment(1);
}

/// Record an instance retirement with its reason.
pub fn record_recycle(reason: &str) {
    let labels = [("reason", reason.to_string())];
    metrics::counter!("pool_recycled_total", &labels).increment(1);
}

/// Record a scaling action.
pub fn record_scaling(direction: ScaleDirection) {
    let labels = [("direction", direction.to_string())];
    metrics::counter!("pool_scaling_total", &labels).increment(1);
}

/// Record a breaker state transition.
pub fn record_breaker_transition(name: &str, to: CircuitState) {
    let labels = [("breaker", name.to_string()), ("state", to.to_string())];
    metrics::counter!("breaker_transitions_total", &labels).increment(1);
}

/// Record a call the breaker short-circuited.
pub fn record_breaker_rejection(name: &str) {
    let labels = [("breaker", name.to_string())];
    metrics::counter!("breaker_rejections_total", &labels).increment(1);
}

/// Record a proxy request outcome.
pub fn record_proxy_request(proxy_id: &str, success: bool) {
    let labels = [
        ("proxy", proxy_id.to_string()),
        ("success", success.to_string()),
    ];
    metrics::counter!("proxy_requests_total", &labels).increment(1);
}

/// Record a context proxy rotation.
pub fn record_proxy_rotation() {
    metrics::counter!("proxy_rotations_total").increment(1);
}

/// Record which pool implementation served a migrated call.
pub fn record_migration_path(path: &str, fallback: bool) {
    let labels = [("path", path.to_string()), ("fallback", fallback.to_string())];
    metrics::counter!("migration_calls_total", &labels).increment(1);
}
