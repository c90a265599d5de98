//! Browser instance pool.
//!
//! [`PoolManager`] is the optimized pool: circuit-protected launches and
//! health probes, score-based recycling and adaptive scaling. [`SimplePool`]
//! is the legacy pool, and [`MigrationPool`] routes between the two.
//! The Chromium driver requires the `browser` feature flag and
//! Chrome/Chromium installed.

pub mod backend;
#[cfg(feature = "browser")]
pub mod chromium;
pub mod driver;
pub mod instance;
pub mod legacy;
pub mod manager;
pub mod migration;
pub mod recycler;
pub mod scaler;

pub use backend::{PoolBackend, PoolStats};
#[cfg(feature = "browser")]
pub use chromium::ChromiumDriver;
pub use driver::{BrowserDriver, BrowserHandle, LaunchOptions, PageId, ResourceUsage};
pub use instance::{AcquiredInstance, Acquisition, InstanceSnapshot};
pub use legacy::SimplePool;
pub use manager::{PoolManager, PoolManagerBuilder};
pub use migration::{MigrationPool, MigrationStats, Path};
pub use recycler::{RecycleDecision, RecycleScore, Recycler};
pub use scaler::{ScalingController, ScalingDecision};
