//! Recycler: scores idle instances and picks which to retire.
//!
//! Four sub-scores in `[0, 1]`, higher meaning "more in need of recycling":
//! time (age and idle time), usage (acquisitions and pages opened), health
//! (inverse of the probe-derived score) and resource (memory, CPU, handles
//! against their ceilings). The composite is their weighted mean.

use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

use browser_fleet_core::config::{RecyclingConfig, RecyclingStrategy};
use browser_fleet_core::types::InstanceState;

use crate::driver::ResourceUsage;

/// Inputs for scoring one instance.
#[derive(Debug, Clone, Copy)]
pub struct RecycleInput {
    pub age: Duration,
    pub idle: Duration,
    pub use_count: u64,
    pub total_pages: u64,
    pub health_score: f64,
    pub resources: ResourceUsage,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RecycleScore {
    pub time: f64,
    pub usage: f64,
    pub health: f64,
    pub resource: f64,
    pub total: f64,
}

impl RecycleScore {
    /// Name of the largest sub-score.
    pub fn dominant(&self) -> &'static str {
        [
            ("time", self.time),
            ("usage", self.usage),
            ("health", self.health),
            ("resource", self.resource),
        ]
        .into_iter()
        .fold(("time", f64::MIN), |best, cur| if cur.1 > best.1 { cur } else { best })
        .0
    }
}

/// An instance chosen for retirement.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecycleDecision {
    pub instance_id: String,
    pub score: f64,
    pub reason: String,
}

pub struct Recycler {
    config: RecyclingConfig,
    last_batch: Option<Instant>,
}

fn ratio(value: f64, limit: f64) -> f64 {
    if limit <= 0.0 {
        return 0.0;
    }
    (value / limit).clamp(0.0, 1.0)
}

impl Recycler {
    pub fn new(config: RecyclingConfig) -> Self {
        Self {
            config,
            last_batch: None,
        }
    }

    pub fn config(&self) -> &RecyclingConfig {
        &self.config
    }

    pub fn score(&self, input: &RecycleInput) -> RecycleScore {
        let c = &self.config;

        let time = ratio(input.age.as_secs_f64(), c.max_lifetime().as_secs_f64())
            .max(ratio(input.idle.as_secs_f64(), c.max_idle_time().as_secs_f64()));
        let usage = ratio(input.use_count as f64, c.max_use_count as f64)
            .max(ratio(input.total_pages as f64, c.max_pages as f64));
        let health = 1.0 - input.health_score.clamp(0.0, 1.0);
        let resource = ratio(input.resources.memory_mb, c.memory_limit_mb)
            .max(ratio(input.resources.cpu_percent, c.cpu_limit_percent))
            .max(ratio(input.resources.handles as f64, c.max_handles as f64));

        let total = match c.strategy {
            RecyclingStrategy::TimeBased => time,
            RecyclingStrategy::UsageBased => usage,
            RecyclingStrategy::HealthBased => health,
            RecyclingStrategy::ResourceBased => resource,
            RecyclingStrategy::Hybrid => {
                let w = &c.weights;
                let sum = w.sum();
                if sum <= 0.0 {
                    (time + usage + health + resource) / 4.0
                } else {
                    (w.time * time + w.usage * usage + w.health * health + w.resource * resource)
                        / sum
                }
            }
        };

        RecycleScore {
            time,
            usage,
            health,
            resource,
            total,
        }
    }

    /// Limits that force recycling whatever the composite score says.
    pub fn hard_limit(&self, input: &RecycleInput) -> Option<&'static str> {
        let c = &self.config;
        if !c.max_lifetime().is_zero() && input.age >= c.max_lifetime() {
            Some("max_lifetime")
        } else if c.max_use_count > 0 && input.use_count >= c.max_use_count {
            Some("max_use_count")
        } else if input.health_score < c.health_threshold {
            Some("unhealthy")
        } else {
            None
        }
    }

    /// True once the cooldown since the last batch has passed.
    pub fn batch_ready(&self, now: Instant) -> bool {
        self.last_batch
            .is_none_or(|at| now.duration_since(at) >= self.config.batch_cooldown())
    }

    pub fn mark_batch(&mut self, now: Instant) {
        self.last_batch = Some(now);
    }

    /// Pick up to `max_batch_size` idle instances to recycle, worst first.
    pub fn select(&self, candidates: &[(String, InstanceState, RecycleInput)]) -> Vec<RecycleDecision> {
        let mut decisions: Vec<RecycleDecision> = candidates
            .iter()
            .filter(|(_, state, _)| *state == InstanceState::Idle)
            .filter_map(|(id, _, input)| {
                let score = self.score(input);
                let reason = match self.hard_limit(input) {
                    Some(limit) => limit.to_string(),
                    None if score.total > self.config.recycling_threshold => {
                        format!("score:{}", score.dominant())
                    }
                    None => return None,
                };
                Some(RecycleDecision {
                    instance_id: id.clone(),
                    score: score.total,
                    reason,
                })
            })
            .collect();

        decisions.sort_by(|a, b| b.score.total_cmp(&a.score));
        decisions.truncate(self.config.max_batch_size.max(1));
        decisions
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input() -> RecycleInput {
        RecycleInput {
            age: Duration::from_secs(60),
            idle: Duration::from_secs(1),
            use_count: 1,
            total_pages: 1,
            health_score: 1.0,
            resources: ResourceUsage::default(),
        }
    }

    fn recycler() -> Recycler {
        Recycler::new(RecyclingConfig::default())
    }

    #[test]
    fn test_fresh_instance_scores_low() {
        let score = recycler().score(&input());
        assert!(score.total < 0.1, "{score:?}");
        assert!(recycler().hard_limit(&input()).is_none());
    }

    #[test]
    fn test_score_monotonic_in_age_usage_resources_and_health() {
        let r = recycler();
        let base = r.score(&input()).total;

        let mut older = input();
        older.age = Duration::from_secs(900);
        assert!(r.score(&older).total >= base);

        let mut busier = input();
        busier.use_count = 50;
        assert!(r.score(&busier).total >= base);

        let mut heavier = input();
        heavier.resources.memory_mb = 800.0;
        assert!(r.score(&heavier).total >= base);

        let mut sicker = input();
        sicker.health_score = 0.6;
        assert!(r.score(&sicker).total >= base);

        let mut healthier = sicker;
        healthier.health_score = 0.9;
        assert!(r.score(&healthier).total <= r.score(&sicker).total);
    }

    #[test]
    fn test_sub_scores_saturate() {
        let mut worn = input();
        worn.age = Duration::from_secs(100_000);
        worn.use_count = 10_000;
        worn.health_score = 0.0;
        worn.resources = ResourceUsage {
            memory_mb: 10_000.0,
            cpu_percent: 400.0,
            handles: 1_000_000,
        };
        let score = recycler().score(&worn);
        assert_eq!(score.total, 1.0);
    }

    #[test]
    fn test_single_strategy_uses_one_sub_score() {
        let config = RecyclingConfig {
            strategy: RecyclingStrategy::ResourceBased,
            ..RecyclingConfig::default()
        };
        let mut i = input();
        i.resources.cpu_percent = 40.0;
        let score = Recycler::new(config).score(&i);
        assert!((score.total - 0.5).abs() < 1e-9);
        assert_eq!(score.dominant(), "resource");
    }

    #[test]
    fn test_hard_limits() {
        let r = recycler();
        let mut old = input();
        old.age = Duration::from_millis(1_800_000);
        assert_eq!(r.hard_limit(&old), Some("max_lifetime"));

        let mut used = input();
        used.use_count = 100;
        assert_eq!(r.hard_limit(&used), Some("max_use_count"));

        let mut sick = input();
        sick.health_score = 0.25;
        assert_eq!(r.hard_limit(&sick), Some("unhealthy"));
    }

    #[test]
    fn test_zero_limits_are_disabled() {
        let r = Recycler::new(RecyclingConfig {
            max_lifetime_ms: 0,
            max_idle_time_ms: 0,
            max_use_count: 0,
            ..RecyclingConfig::default()
        });
        let mut old = input();
        old.age = Duration::from_secs(86_400);
        old.use_count = 10_000;
        assert_eq!(r.score(&old).time, 0.0);
        assert_eq!(r.hard_limit(&old), None);
        assert!(r.select(&[("a".to_string(), InstanceState::Idle, old)]).is_empty());
    }

    #[test]
    fn test_select_skips_active_and_bounds_batch() {
        let r = recycler();
        let mut worn = input();
        worn.use_count = 500;

        let candidates = vec![
            ("a".to_string(), InstanceState::Active, worn),
            ("b".to_string(), InstanceState::Idle, worn),
            ("c".to_string(), InstanceState::Idle, worn),
            ("d".to_string(), InstanceState::Idle, worn),
            ("e".to_string(), InstanceState::Idle, input()),
        ];
        let picked = r.select(&candidates);
        assert_eq!(picked.len(), 2);
        assert!(picked.iter().all(|d| d.instance_id != "a" && d.instance_id != "e"));
        assert_eq!(picked[0].reason, "max_use_count");
    }

    #[test]
    fn test_threshold_selection() {
        let config = RecyclingConfig {
            recycling_threshold: 0.3,
            health_threshold: 0.0,
            ..RecyclingConfig::default()
        };
        let r = Recycler::new(config);
        let mut sick = input();
        sick.health_score = 0.0;
        sick.resources.memory_mb = 1024.0;
        let picked = r.select(&[("x".into(), InstanceState::Idle, sick)]);
        assert_eq!(picked.len(), 1);
        assert!(picked[0].reason.starts_with("score:"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_cooldown() {
        let mut r = recycler();
        let now = Instant::now();
        assert!(r.batch_ready(now));
        r.mark_batch(now);
        assert!(!r.batch_ready(Instant::now()));
        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(r.batch_ready(Instant::now()));
    }
}
