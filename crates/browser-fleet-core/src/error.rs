use thiserror::Error;

use crate::types::CircuitState;

#[derive(Debug, Error)]
pub enum FleetError {
    #[error("Pool exhausted: {active} of {max} instances in use")]
    PoolExhausted { active: usize, max: usize },

    #[error("Launch failed: {0}")]
    LaunchFailure(String),

    #[error("Instance not found: {0}")]
    InstanceNotFound(String),

    #[error("Instance {instance_id} is not acquired by session {session_id}")]
    NotAcquired {
        instance_id: String,
        session_id: String,
    },

    #[error("Instance {instance_id} reached its page limit ({max})")]
    PageLimit { instance_id: String, max: usize },

    #[error("Page {page_id} not found on instance {instance_id}")]
    PageNotFound { instance_id: String, page_id: String },

    #[error("Health check failed for {instance_id}: {reason}")]
    HealthCheckFailure { instance_id: String, reason: String },

    #[error("Circuit '{name}' rejected the call (state: {state})")]
    CircuitOpen { name: String, state: CircuitState },

    #[error("No proxy available: {0}")]
    ProxyPoolEmpty(String),

    #[error("Proxy not found: {0}")]
    ProxyNotFound(String),

    #[error("Recycling failed for {instance_id}: {reason}")]
    RecyclingFailure { instance_id: String, reason: String },

    #[error("Pool is shutting down")]
    ShuttingDown,

    #[error("Acquire timed out after {0}ms")]
    AcquireTimeout(u64),

    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl FleetError {
    /// Short, stable label used for metrics and migration accounting.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::PoolExhausted { .. } => "pool_exhausted",
            Self::LaunchFailure(_) => "launch_failure",
            Self::InstanceNotFound(_) => "instance_not_found",
            Self::NotAcquired { .. } => "not_acquired",
            Self::PageLimit { .. } => "page_limit",
            Self::PageNotFound { .. } => "page_not_found",
            Self::HealthCheckFailure { .. } => "health_check_failure",
            Self::CircuitOpen { .. } => "circuit_open",
            Self::ProxyPoolEmpty(_) => "proxy_pool_empty",
            Self::ProxyNotFound(_) => "proxy_not_found",
            Self::RecyclingFailure { .. } => "recycling_failure",
            Self::ShuttingDown => "shutting_down",
            Self::AcquireTimeout(_) => "acquire_timeout",
            Self::Config(_) => "config",
            Self::Io(_) => "io",
            Self::Json(_) => "json",
            Self::Other(_) => "other",
        }
    }
}

pub type Result<T> = std::result::Result<T, FleetError>;
