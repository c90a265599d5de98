//! Per-proxy health and performance records.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use browser_fleet_core::config::ProxyConfig;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProxyHealth {
    pub healthy: bool,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
    pub last_checked: Option<DateTime<Utc>>,
}

impl Default for ProxyHealth {
    fn default() -> Self {
        Self {
            healthy: true,
            consecutive_failures: 0,
            last_error: None,
            last_checked: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProxyMetrics {
    /// Times the proxy was handed out by selection.
    pub request_count: u64,
    pub success_count: u64,
    pub failure_count: u64,
    /// Mean response time over successful reports.
    pub average_response_time_ms: f64,
    pub last_used: Option<DateTime<Utc>>,
}

impl ProxyMetrics {
    /// Fraction of reports that were successes; 1.0 before any report.
    pub fn success_rate(&self) -> f64 {
        let reported = self.success_count + self.failure_count;
        if reported == 0 {
            1.0
        } else {
            self.success_count as f64 / reported as f64
        }
    }
}

/// A configured proxy with its live health and metrics.
#[derive(Debug, Clone, Serialize)]
pub struct ProxyInstance {
    pub id: String,
    pub config: ProxyConfig,
    pub health: ProxyHealth,
    pub metrics: ProxyMetrics,
}

impl ProxyInstance {
    pub fn new(config: ProxyConfig) -> Self {
        Self {
            id: config.key(),
            config,
            health: ProxyHealth::default(),
            metrics: ProxyMetrics::default(),
        }
    }

    pub fn mark_used(&mut self, now: DateTime<Utc>) {
        self.metrics.request_count += 1;
        self.metrics.last_used = Some(now);
    }

    /// Record a success. Returns true if the proxy just became healthy.
    pub fn record_success(&mut self, response_time: Duration, now: DateTime<Utc>) -> bool {
        let m = &mut self.metrics;
        m.success_count += 1;
        let sample = response_time.as_secs_f64() * 1000.0;
        m.average_response_time_ms += (sample - m.average_response_time_ms) / m.success_count as f64;

        let recovered = !self.health.healthy;
        self.health.healthy = true;
        self.health.consecutive_failures = 0;
        self.health.last_checked = Some(now);
        recovered
    }

    /// Record a failure. Returns true if this failure marked the proxy unhealthy.
    pub fn record_failure(&mut self, error: &str, threshold: u32, now: DateTime<Utc>) -> bool {
        self.metrics.failure_count += 1;
        self.health.consecutive_failures += 1;
        self.health.last_error = Some(error.to_string());
        self.health.last_checked = Some(now);

        if self.health.healthy && self.health.consecutive_failures >= threshold.max(1) {
            self.health.healthy = false;
            return true;
        }
        false
    }
}
