//! Shared config, errors, state types, events, and metrics for browser-fleet.

pub mod config;
pub mod error;
pub mod events;
pub mod metrics;
pub mod types;
