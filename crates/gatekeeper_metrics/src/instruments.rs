//! OpenTelemetry instruments.

use gatekeeper_core::{CircuitState, OutcomeRecord};
use opentelemetry::{
    KeyValue, global,
    metrics::{Counter, Histogram, Meter},
};
use std::sync::OnceLock;

static METRICS: OnceLock<GatekeeperMetrics> = OnceLock::new();

/// OpenTelemetry instruments for guarded calls.
///
/// Labeled with the upstream method; errors additionally carry the
/// `error_kind` label from [`gatekeeper_error::ErrorClass`].
#[derive(Clone)]
pub struct GatekeeperMetrics {
    /// Meter handle kept alive for metric instruments
    _meter: Meter,
    /// Settled calls
    pub calls: Counter<u64>,
    /// Failed calls
    pub errors: Counter<u64>,
    /// Flushed batch dispatches
    pub batches: Counter<u64>,
    /// Circuit state transitions
    pub circuit_transitions: Counter<u64>,
    /// End-to-end call duration in seconds
    pub call_duration: Histogram<f64>,
    /// Admission wait in seconds
    pub rate_limit_wait: Histogram<f64>,
}

impl GatekeeperMetrics {
    fn init() -> Self {
        let meter = global::meter("gatekeeper");

        Self {
            _meter: meter.clone(),
            calls: meter
                .u64_counter("gatekeeper.calls")
                .with_description("Settled upstream calls")
                .build(),
            errors: meter
                .u64_counter("gatekeeper.errors")
                .with_description("Failed upstream calls by error kind")
                .build(),
            batches: meter
                .u64_counter("gatekeeper.batches")
                .with_description("Flushed batch dispatches")
                .build(),
            circuit_transitions: meter
                .u64_counter("gatekeeper.circuit.transitions")
                .with_description("Circuit breaker state transitions")
                .build(),
            call_duration: meter
                .f64_histogram("gatekeeper.call.duration")
                .with_unit("seconds")
                .with_description("Time from submission to settlement")
                .build(),
            rate_limit_wait: meter
                .f64_histogram("gatekeeper.rate_limit.wait")
                .with_unit("seconds")
                .with_description("Time spent waiting for admission")
                .build(),
        }
    }

    /// Get the global instance.
    pub fn get() -> &'static Self {
        METRICS.get_or_init(Self::init)
    }

    /// Record a settled call.
    pub fn record_outcome(&self, record: &OutcomeRecord) {
        let outcome = if *record.success() { "success" } else { "failure" };
        let labels = &[
            KeyValue::new("method", record.method().clone()),
            KeyValue::new("outcome", outcome),
        ];
        self.calls.add(1, labels);
        self.call_duration
            .record(record.duration().as_secs_f64(), labels);
        self.rate_limit_wait.record(
            record.wait().as_secs_f64(),
            &[KeyValue::new("method", record.method().clone())],
        );

        if let Some(kind) = record.error_kind() {
            self.errors.add(
                1,
                &[
                    KeyValue::new("method", record.method().clone()),
                    KeyValue::new("error_kind", kind.as_ref().to_string()),
                ],
            );
        }
    }

    /// Record a flushed batch dispatch.
    pub fn record_batch(&self, method: &str) {
        self.batches
            .add(1, &[KeyValue::new("method", method.to_string())]);
    }

    /// Record a circuit transition.
    pub fn record_transition(&self, key: &str, from: CircuitState, to: CircuitState) {
        self.circuit_transitions.add(
            1,
            &[
                KeyValue::new("key", key.to_string()),
                KeyValue::new("from", from.to_string()),
                KeyValue::new("to", to.to_string()),
            ],
        );
    }
}

impl Default for GatekeeperMetrics {
    fn default() -> Self {
        Self::get().clone()
    }
}
