//! Pool-wide proxy statistics.

use serde::Serialize;

use crate::instance::ProxyInstance;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProxyPoolStats {
    pub total: usize,
    pub healthy: usize,
    pub unhealthy: usize,
    /// Mean of per-proxy averages, over proxies with at least one success.
    pub avg_response_time_ms: f64,
    pub total_requests: u64,
    /// Successes over all reports; 1.0 before any report.
    pub success_rate: f64,
}

impl ProxyPoolStats {
    pub fn from_instances(instances: &[ProxyInstance]) -> Self {
        let healthy = instances.iter().filter(|p| p.health.healthy).count();

        let timed: Vec<f64> = instances
            .iter()
            .filter(|p| p.metrics.success_count > 0)
            .map(|p| p.metrics.average_response_time_ms)
            .collect();
        let avg_response_time_ms = if timed.is_empty() {
            0.0
        } else {
            timed.iter().sum::<f64>() / timed.len() as f64
        };

        let successes: u64 = instances.iter().map(|p| p.metrics.success_count).sum();
        let failures: u64 = instances.iter().map(|p| p.metrics.failure_count).sum();
        let success_rate = if successes + failures == 0 {
            1.0
        } else {
            successes as f64 / (successes + failures) as f64
        };

        Self {
            total: instances.len(),
            healthy,
            unhealthy: instances.len() - healthy,
            avg_response_time_ms,
            total_requests: instances.iter().map(|p| p.metrics.request_count).sum(),
            success_rate,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use browser_fleet_core::config::ProxyConfig;
    use chrono::Utc;

    use super::*;

    #[test]
    fn test_empty_pool() {
        let stats = ProxyPoolStats::from_instances(&[]);
        assert_eq!(stats.total, 0);
        assert_eq!(stats.success_rate, 1.0);
        assert_eq!(stats.avg_response_time_ms, 0.0);
    }

    #[test]
    fn test_aggregates_counts_and_rates() {
        let now = Utc::now();
        let mut a = ProxyInstance::new(ProxyConfig::new("a", 1));
        let mut b = ProxyInstance::new(ProxyConfig::new("b", 1));
        let c = ProxyInstance::new(ProxyConfig::new("c", 1));

        a.mark_used(now);
        a.record_success(Duration::from_millis(100), now);
        b.mark_used(now);
        b.mark_used(now);
        b.record_success(Duration::from_millis(300), now);
        for _ in 0..3 {
            b.record_failure("down", 3, now);
        }

        let stats = ProxyPoolStats::from_instances(&[a, b, c]);
        assert_eq!(stats.total, 3);
        assert_eq!(stats.healthy, 2);
        assert_eq!(stats.unhealthy, 1);
        assert_eq!(stats.total_requests, 3);
        assert!((stats.avg_response_time_ms - 200.0).abs() < 1e-9);
        assert!((stats.success_rate - 0.4).abs() < 1e-9);
    }
}
