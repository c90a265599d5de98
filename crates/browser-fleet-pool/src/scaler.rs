//! Scaling controller: sizes the pool from observed utilization.

use std::collections::VecDeque;

use serde::Serialize;
use tokio::time::Instant;
use tracing::debug;

use browser_fleet_core::config::ScalingConfig;
use browser_fleet_core::types::ScaleDirection;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ScalingDecision {
    pub direction: ScaleDirection,
    pub from: usize,
    pub to: usize,
    pub utilization: f64,
}

pub struct ScalingController {
    config: ScalingConfig,
    min_size: usize,
    max_size: usize,
    last_action: Option<Instant>,
    history: VecDeque<f64>,
}

impl ScalingController {
    /// `max_size` is the pool's effective ceiling; `min_size` is clamped under it.
    pub fn new(config: ScalingConfig, max_size: usize) -> Self {
        let min_size = config.min_size.min(max_size);
        Self {
            config,
            min_size,
            max_size,
            last_action: None,
            history: VecDeque::new(),
        }
    }

    pub fn min_size(&self) -> usize {
        self.min_size
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Utilization samples currently held for prediction.
    pub fn history(&self) -> impl Iterator<Item = f64> + '_ {
        self.history.iter().copied()
    }

    /// Decide whether to resize a pool of `total` instances with `active` in use.
    ///
    /// Returns at most one decision per cooldown period, always within
    /// `[min_size, max_size]`.
    pub fn evaluate(&mut self, total: usize, active: usize, now: Instant) -> Option<ScalingDecision> {
        let utilization = if total == 0 {
            0.0
        } else {
            active as f64 / total as f64
        };
        self.history.push_back(utilization);
        while self.history.len() > self.config.prediction_window.max(1) {
            self.history.pop_front();
        }

        if !self.config.enabled {
            return None;
        }
        if let Some(at) = self.last_action {
            if now.duration_since(at) < self.config.cooldown_period() {
                return None;
            }
        }

        let pressure = if self.config.predictive {
            utilization.max(self.predicted())
        } else {
            utilization
        };

        let decision = if total < self.min_size {
            Some((ScaleDirection::Up, self.min_size))
        } else if pressure >= self.config.scale_up_threshold && total < self.max_size {
            let to = (total + self.config.scale_up_step.max(1)).min(self.max_size);
            Some((ScaleDirection::Up, to))
        } else if utilization <= self.config.scale_down_threshold && total > self.min_size {
            let to = total
                .saturating_sub(self.config.scale_down_step.max(1))
                .max(self.min_size);
            Some((ScaleDirection::Down, to))
        } else {
            None
        };

        let (direction, to) = decision?;
        self.last_action = Some(now);
        debug!(%direction, from = total, to, utilization, pressure, "Scaling decision");
        Some(ScalingDecision {
            direction,
            from: total,
            to,
            utilization,
        })
    }

    /// Linear extrapolation one step ahead from the sample history.
    fn predicted(&self) -> f64 {
        let n = self.history.len();
        if n < 2 {
            return self.history.back().copied().unwrap_or(0.0);
        }
        let (Some(first), Some(last)) = (self.history.front(), self.history.back()) else {
            return 0.0;
        };
        let slope = (last - first) / (n - 1) as f64;
        (last + slope).clamp(0.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn config() -> ScalingConfig {
        ScalingConfig {
            enabled: true,
            min_size: 1,
            max_size: 4,
            scale_up_threshold: 0.8,
            scale_down_threshold: 0.3,
            cooldown_period_ms: 10_000,
            scale_up_step: 1,
            scale_down_step: 1,
            predictive: false,
            prediction_window: 5,
            ..ScalingConfig::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_scales_up_under_pressure() {
        let mut s = ScalingController::new(config(), 4);
        let d = s.evaluate(2, 2, Instant::now()).unwrap();
        assert_eq!(d.direction, ScaleDirection::Up);
        assert_eq!((d.from, d.to), (2, 3));
        assert_eq!(d.utilization, 1.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scales_down_when_idle() {
        let mut s = ScalingController::new(config(), 4);
        let d = s.evaluate(3, 0, Instant::now()).unwrap();
        assert_eq!(d.direction, ScaleDirection::Down);
        assert_eq!(d.to, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_respects_bounds() {
        let mut s = ScalingController::new(config(), 4);
        assert!(s.evaluate(4, 4, Instant::now()).is_none(), "already at max");
        assert!(s.evaluate(1, 0, Instant::now()).is_none(), "already at min");

        let mut big_step = config();
        big_step.scale_up_step = 10;
        big_step.scale_down_step = 10;
        let mut s = ScalingController::new(big_step.clone(), 4);
        assert_eq!(s.evaluate(2, 2, Instant::now()).unwrap().to, 4);
        let mut s = ScalingController::new(big_step, 4);
        assert_eq!(s.evaluate(3, 0, Instant::now()).unwrap().to, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restores_floor() {
        let mut cfg = config();
        cfg.min_size = 2;
        let mut s = ScalingController::new(cfg, 4);
        let d = s.evaluate(0, 0, Instant::now()).unwrap();
        assert_eq!((d.direction, d.to), (ScaleDirection::Up, 2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cooldown_blocks_repeat_actions() {
        let mut s = ScalingController::new(config(), 4);
        assert!(s.evaluate(2, 2, Instant::now()).is_some());
        assert!(s.evaluate(3, 3, Instant::now()).is_none());

        tokio::time::advance(Duration::from_millis(9_999)).await;
        assert!(s.evaluate(3, 3, Instant::now()).is_none());
        tokio::time::advance(Duration::from_millis(1)).await;
        assert!(s.evaluate(3, 3, Instant::now()).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabled_never_decides() {
        let mut cfg = config();
        cfg.enabled = false;
        let mut s = ScalingController::new(cfg, 4);
        assert!(s.evaluate(0, 0, Instant::now()).is_none());
        assert!(s.evaluate(2, 2, Instant::now()).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_predictive_scales_ahead_of_threshold() {
        let mut cfg = config();
        cfg.predictive = true;
        cfg.cooldown_period_ms = 0;
        let mut s = ScalingController::new(cfg, 4);

        // 0.5 → 0.75 trends toward 1.0
        assert!(s.evaluate(4, 2, Instant::now()).is_none());
        s.max_size = 8;
        let d = s.evaluate(4, 3, Instant::now()).unwrap();
        assert_eq!(d.direction, ScaleDirection::Up);
        assert_eq!(d.utilization, 0.75);
    }

    #[tokio::test(start_paused = true)]
    async fn test_history_is_bounded() {
        let mut s = ScalingController::new(config(), 4);
        for _ in 0..20 {
            s.evaluate(2, 1, Instant::now());
        }
        assert_eq!(s.history().count(), 5);
    }
}
