//! Circuit breaker states.

use serde::{Deserialize, Serialize};

/// Circuit breaker state machine position.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Default,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumIter,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum CircuitState {
    /// Calls flow through; outcomes feed the rolling window
    #[default]
    Closed,
    /// Calls fail fast without reaching the upstream
    Open,
    /// A single probe call is testing whether the upstream recovered
    HalfOpen,
}

impl CircuitState {
    /// Numeric value for gauges (0=Closed, 1=Open, 2=HalfOpen).
    pub fn as_metric_value(self) -> f64 {
        match self {
            CircuitState::Closed => 0.0,
            CircuitState::Open => 1.0,
            CircuitState::HalfOpen => 2.0,
        }
    }

    /// Rank for picking the least healthy of several circuits (Open highest).
    pub fn severity(self) -> u8 {
        match self {
            CircuitState::Closed => 0,
            CircuitState::HalfOpen => 1,
            CircuitState::Open => 2,
        }
    }
}
