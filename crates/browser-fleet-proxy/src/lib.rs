//! Outbound proxy management: health, selection, bypass, and per-context rotation.

pub mod bypass;
pub mod context;
pub mod instance;
pub mod manager;
pub mod pool;
pub mod probe;
pub mod selector;
pub mod stats;

pub use bypass::BypassRules;
pub use context::{ContextBinding, ContextProxyManager};
pub use instance::{ProxyHealth, ProxyInstance, ProxyMetrics};
pub use manager::ProxyManager;
pub use pool::{ProbeReport, ProxyPool};
pub use probe::{ConnectivityProbe, TcpProbe};
pub use selector::ProxySelector;
pub use stats::ProxyPoolStats;
