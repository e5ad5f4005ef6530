//! Write-once record of a finished call.

use derive_getters::Getters;
use gatekeeper_error::ErrorClass;
use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime};

/// Outcome of one logical call, consumed by the metrics recorder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Getters)]
pub struct OutcomeRecord {
    /// Upstream method
    method: String,
    /// Rate-limit and circuit key
    key: String,
    /// Time from `execute` entry to settlement
    duration: Duration,
    /// Time spent waiting for rate-limit admission or a batch flush
    wait: Duration,
    /// Whether the call produced a value
    success: bool,
    /// Failure classification, `None` on success
    error_kind: Option<ErrorClass>,
    /// Upstream attempts made
    attempts: u32,
    /// Wall-clock time the outcome was recorded
    timestamp: SystemTime,
}

impl OutcomeRecord {
    /// Record for a successful call.
    pub fn succeeded(
        method: impl Into<String>,
        key: impl Into<String>,
        duration: Duration,
        wait: Duration,
        attempts: u32,
    ) -> Self {
        Self {
            method: method.into(),
            key: key.into(),
            duration,
            wait,
            success: true,
            error_kind: None,
            attempts,
            timestamp: SystemTime::now(),
        }
    }

    /// Record for a failed call.
    pub fn failed(
        method: impl Into<String>,
        key: impl Into<String>,
        duration: Duration,
        wait: Duration,
        attempts: u32,
        error_kind: ErrorClass,
    ) -> Self {
        Self {
            method: method.into(),
            key: key.into(),
            duration,
            wait,
            success: false,
            error_kind: Some(error_kind),
            attempts,
            timestamp: SystemTime::now(),
        }
    }
}
