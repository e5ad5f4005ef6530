//! Serializable health views.

use crate::MethodStats;
use derive_getters::Getters;
use gatekeeper_core::{CallPhase, CircuitState};
use gatekeeper_error::ErrorClass;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Health of one method, readable without calling the upstream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Getters)]
pub struct MethodSnapshot {
    /// Upstream method
    method: String,
    /// Fewest units left in any bucket the method uses, `None` before first use
    tokens_available: Option<f64>,
    /// Least healthy circuit among the method's keys
    circuit_state: CircuitState,
    /// Calls settled with a value
    success_count: u64,
    /// Calls settled with an error other than `Cancelled`
    failure_count: u64,
    /// Calls withdrawn before dispatch
    cancelled_count: u64,
    /// Mean admission wait in milliseconds
    avg_wait_ms: f64,
    /// Mean end-to-end duration in milliseconds
    avg_latency_ms: f64,
    /// Settled errors per class
    errors_by_kind: BTreeMap<ErrorClass, u64>,
    /// Phase transitions observed
    phase_counts: BTreeMap<CallPhase, u64>,
}

impl MethodSnapshot {
    /// Combine recorded counters with live limiter and circuit state.
    pub fn new(
        method: impl Into<String>,
        stats: &MethodStats,
        tokens_available: Option<f64>,
        circuit_state: CircuitState,
    ) -> Self {
        Self {
            method: method.into(),
            tokens_available,
            circuit_state,
            success_count: *stats.success_count(),
            failure_count: *stats.failure_count(),
            cancelled_count: *stats.cancelled_count(),
            avg_wait_ms: stats.avg_wait_ms(),
            avg_latency_ms: stats.avg_latency_ms(),
            errors_by_kind: stats.errors_by_kind().clone(),
            phase_counts: stats.phase_counts().clone(),
        }
    }

    /// Whether the method can currently reach the upstream.
    pub fn is_reachable(&self) -> bool {
        self.circuit_state != CircuitState::Open
    }
}

/// Health of every method seen so far.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, Getters)]
pub struct MetricsSnapshot {
    /// Per-method snapshots keyed by method name
    methods: BTreeMap<String, MethodSnapshot>,
}

impl MetricsSnapshot {
    /// Build from per-method snapshots.
    pub fn from_methods(methods: impl IntoIterator<Item = MethodSnapshot>) -> Self {
        Self {
            methods: methods
                .into_iter()
                .map(|m| (m.method.clone(), m))
                .collect(),
        }
    }

    /// Snapshot of one method.
    pub fn method(&self, method: &str) -> Option<&MethodSnapshot> {
        self.methods.get(method)
    }

    /// True when no method has an open circuit.
    pub fn all_reachable(&self) -> bool {
        self.methods.values().all(MethodSnapshot::is_reachable)
    }
}
