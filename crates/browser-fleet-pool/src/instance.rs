//! Instance and acquisition records.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::Instant;

use browser_fleet_core::types::InstanceState;

use crate::driver::{BrowserHandle, PageId, ResourceUsage};
use crate::recycler::RecycleInput;

/// A launched browser tracked by the pool.
pub(crate) struct Instance {
    pub id: String,
    pub handle: Arc<dyn BrowserHandle>,
    pub state: InstanceState,
    pub launched_at: Instant,
    pub launched_at_utc: DateTime<Utc>,
    pub last_used: Instant,
    pub use_count: u64,
    /// Open pages and the session that owns each.
    pub pages: HashMap<PageId, String>,
    /// Page creations in flight; count against the page ceiling.
    pub pending_pages: usize,
    pub total_pages: u64,
    pub health_score: f64,
    pub consecutive_failures: u32,
    pub resources: ResourceUsage,
    pub proxy_id: Option<String>,
}

impl Instance {
    pub fn new(
        id: String,
        handle: Arc<dyn BrowserHandle>,
        state: InstanceState,
        proxy_id: Option<String>,
    ) -> Self {
        let now = Instant::now();
        Self {
            id,
            handle,
            state,
            launched_at: now,
            launched_at_utc: Utc::now(),
            last_used: now,
            use_count: 0,
            pages: HashMap::new(),
            pending_pages: 0,
            total_pages: 0,
            health_score: 1.0,
            consecutive_failures: 0,
            resources: ResourceUsage::default(),
            proxy_id,
        }
    }

    pub fn page_load(&self) -> usize {
        self.pages.len() + self.pending_pages
    }

    pub fn recycle_input(&self, now: Instant) -> RecycleInput {
        RecycleInput {
            age: now.duration_since(self.launched_at),
            idle: now.duration_since(self.last_used),
            use_count: self.use_count,
            total_pages: self.total_pages,
            health_score: self.health_score,
            resources: self.resources,
        }
    }

    pub fn snapshot(&self, now: Instant, session_id: Option<&str>) -> InstanceSnapshot {
        InstanceSnapshot {
            id: self.id.clone(),
            state: self.state,
            session_id: session_id.map(str::to_string),
            launched_at: self.launched_at_utc,
            age_ms: now.duration_since(self.launched_at).as_millis() as u64,
            idle_ms: now.duration_since(self.last_used).as_millis() as u64,
            use_count: self.use_count,
            open_pages: self.pages.len(),
            total_pages: self.total_pages,
            health_score: self.health_score,
            consecutive_failures: self.consecutive_failures,
            resources: self.resources,
            proxy_id: self.proxy_id.clone(),
        }
    }
}

/// Serializable view of one instance.
#[derive(Debug, Clone, Serialize)]
pub struct InstanceSnapshot {
    pub id: String,
    pub state: InstanceState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub launched_at: DateTime<Utc>,
    pub age_ms: u64,
    pub idle_ms: u64,
    pub use_count: u64,
    pub open_pages: usize,
    pub total_pages: u64,
    pub health_score: f64,
    pub consecutive_failures: u32,
    pub resources: ResourceUsage,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proxy_id: Option<String>,
}

/// A session's hold on an instance.
#[derive(Debug, Clone, Serialize)]
pub struct Acquisition {
    pub session_id: String,
    pub instance_id: String,
    pub acquired_at: DateTime<Utc>,
}

/// What `acquire` hands back: the acquisition plus the browser to drive.
#[derive(Clone)]
pub struct AcquiredInstance {
    pub instance_id: String,
    pub session_id: String,
    pub acquired_at: DateTime<Utc>,
    pub handle: Arc<dyn BrowserHandle>,
}

impl fmt::Debug for AcquiredInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AcquiredInstance")
            .field("instance_id", &self.instance_id)
            .field("session_id", &self.session_id)
            .field("acquired_at", &self.acquired_at)
            .finish_non_exhaustive()
    }
}
