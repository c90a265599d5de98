//! State enums shared across the breaker, proxy, and pool crates.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Calls pass through; failures are counted.
    Closed,
    /// Calls are rejected without reaching the guarded operation.
    Open,
    /// One trial call at a time is let through.
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Closed => "CLOSED",
            Self::Open => "OPEN",
            Self::HalfOpen => "HALF_OPEN",
        })
    }
}

/// Lifecycle of a pooled browser instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceState {
    Launching,
    Idle,
    Active,
    Draining,
    Recycling,
    Crashed,
    Closed,
}

impl InstanceState {
    /// Whether the instance may be handed to a new session.
    pub fn is_available(self) -> bool {
        self == Self::Idle
    }

    /// Whether the instance is on its way out of the pool.
    pub fn is_retiring(self) -> bool {
        matches!(
            self,
            Self::Draining | Self::Recycling | Self::Crashed | Self::Closed
        )
    }
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Launching => "launching",
            Self::Idle => "idle",
            Self::Active => "active",
            Self::Draining => "draining",
            Self::Recycling => "recycling",
            Self::Crashed => "crashed",
            Self::Closed => "closed",
        })
    }
}

/// Direction of a scaling decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScaleDirection {
    Up,
    Down,
}

impl fmt::Display for ScaleDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Up => "up",
            Self::Down => "down",
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_circuit_state_serde() {
        let json = serde_json::to_string(&CircuitState::HalfOpen).unwrap();
        assert_eq!(json, r#""HALF_OPEN""#);
        let back: CircuitState = serde_json::from_str(&json).unwrap();
        assert_eq!(back, CircuitState::HalfOpen);
    }

    #[test]
    fn test_instance_state_availability() {
        assert!(InstanceState::Idle.is_available());
        assert!(!InstanceState::Active.is_available());
        assert!(!InstanceState::Draining.is_available());
        assert!(InstanceState::Crashed.is_retiring());
        assert!(!InstanceState::Launching.is_retiring());
    }
}
