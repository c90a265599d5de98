//! Proxy selection strategies.
//!
//! Selection works on indices into the pool's instance list so the caller
//! can mark the winner used under the same lock.

use rand::Rng;

use browser_fleet_core::config::SelectionStrategy;

use crate::instance::ProxyInstance;

const SUCCESS_WEIGHT: f64 = 0.7;
const RESPONSE_WEIGHT: f64 = 0.3;

/// Indices of proxies eligible for selection.
///
/// Excluded ids are never eligible. Unhealthy proxies are dropped unless
/// no healthy proxy remains.
pub fn candidates(instances: &[ProxyInstance], exclude: &[String]) -> Vec<usize> {
    let allowed: Vec<usize> = instances
        .iter()
        .enumerate()
        .filter(|(_, p)| !exclude.contains(&p.id))
        .map(|(i, _)| i)
        .collect();

    let healthy: Vec<usize> = allowed
        .iter()
        .copied()
        .filter(|&i| instances[i].health.healthy)
        .collect();

    if healthy.is_empty() { allowed } else { healthy }
}

/// Stateful selector; holds the round-robin cursor.
#[derive(Debug, Default)]
pub struct ProxySelector {
    cursor: usize,
}

impl ProxySelector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pick one of `candidates` (indices into `instances`).
    pub fn pick(
        &mut self,
        strategy: SelectionStrategy,
        instances: &[ProxyInstance],
        candidates: &[usize],
    ) -> Option<usize> {
        if candidates.is_empty() {
            return None;
        }
        let picked = match strategy {
            SelectionStrategy::RoundRobin => {
                let idx = candidates[self.cursor % candidates.len()];
                self.cursor = self.cursor.wrapping_add(1);
                idx
            }
            SelectionStrategy::LeastUsed => *candidates
                .iter()
                .min_by_key(|&&i| instances[i].metrics.request_count)?,
            SelectionStrategy::HealthBased => health_based(instances, candidates)?,
            SelectionStrategy::Random => {
                candidates[rand::rng().random_range(0..candidates.len())]
            }
            SelectionStrategy::Priority => {
                // max_by_key returns the last maximum; keep config order on ties
                let best = candidates
                    .iter()
                    .map(|&i| instances[i].config.priority)
                    .max()?;
                *candidates
                    .iter()
                    .find(|&&i| instances[i].config.priority == best)?
            }
        };
        Some(picked)
    }
}

/// Weighted score: 0.7 * success rate + 0.3 * normalized response time.
pub fn health_score(instance: &ProxyInstance, max_avg_response_ms: f64) -> f64 {
    let normalized = if max_avg_response_ms > 0.0 {
        1.0 - instance.metrics.average_response_time_ms / max_avg_response_ms
    } else {
        1.0
    };
    SUCCESS_WEIGHT * instance.metrics.success_rate() + RESPONSE_WEIGHT * normalized
}

fn health_based(instances: &[ProxyInstance], candidates: &[usize]) -> Option<usize> {
    let max_avg = candidates
        .iter()
        .map(|&i| instances[i].metrics.average_response_time_ms)
        .fold(0.0_f64, f64::max);

    let mut best: Option<(usize, f64)> = None;
    for &i in candidates {
        let score = health_score(&instances[i], max_avg);
        match best {
            Some((_, s)) if s >= score => {}
            _ => best = Some((i, score)),
        }
    }
    best.map(|(i, _)| i)
}
