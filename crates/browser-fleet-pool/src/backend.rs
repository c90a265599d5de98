//! The pool operations every backend implements.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::Serialize;

use browser_fleet_core::error::Result;

use crate::driver::PageId;
use crate::instance::AcquiredInstance;

/// Occupancy of a pool.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PoolStats {
    pub total: usize,
    pub idle: usize,
    pub active: usize,
    pub launching: usize,
    pub draining: usize,
    pub crashed: usize,
    pub acquisitions: usize,
    pub max_size: usize,
    /// `active / total`, 0 for an empty pool.
    pub utilization: f64,
}

impl PoolStats {
    /// Sum of two pools' stats, utilization recomputed.
    pub fn merge(&self, other: &PoolStats) -> PoolStats {
        let total = self.total + other.total;
        let active = self.active + other.active;
        PoolStats {
            total,
            idle: self.idle + other.idle,
            active,
            launching: self.launching + other.launching,
            draining: self.draining + other.draining,
            crashed: self.crashed + other.crashed,
            acquisitions: self.acquisitions + other.acquisitions,
            max_size: self.max_size + other.max_size,
            utilization: if total == 0 {
                0.0
            } else {
                active as f64 / total as f64
            },
        }
    }
}

/// A browser instance pool.
#[async_trait]
pub trait PoolBackend: Send + Sync {
    /// Short name used in logs and metrics.
    fn name(&self) -> &'static str;

    async fn acquire(&self, session_id: &str) -> Result<AcquiredInstance>;

    async fn release(&self, instance_id: &str, session_id: &str) -> Result<()>;

    async fn create_page(&self, instance_id: &str, session_id: &str) -> Result<PageId>;

    async fn close_page(&self, instance_id: &str, session_id: &str, page_id: &PageId) -> Result<()>;

    /// Probe every instance; `true` means healthy.
    async fn health_check(&self) -> HashMap<String, bool>;

    fn stats(&self) -> PoolStats;

    async fn shutdown(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_recomputes_utilization() {
        let a = PoolStats {
            total: 2,
            active: 2,
            max_size: 2,
            utilization: 1.0,
            ..PoolStats::default()
        };
        let b = PoolStats {
            total: 2,
            idle: 2,
            max_size: 3,
            ..PoolStats::default()
        };
        let merged = a.merge(&b);
        assert_eq!(merged.total, 4);
        assert_eq!(merged.max_size, 5);
        assert_eq!(merged.utilization, 0.5);
    }
}
