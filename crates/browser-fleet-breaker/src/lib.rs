//! Circuit breakers for pool operations.

mod cache;

pub mod breaker;
pub mod registry;

pub use breaker::{BreakerError, BreakerStats, CircuitBreaker, Execution, Served};
pub use registry::BreakerRegistry;
