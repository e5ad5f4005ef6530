//! In-process outcome counters.

use crate::GatekeeperMetrics;
use derive_getters::Getters;
use gatekeeper_core::{CallPhase, OutcomeRecord, PhaseEvent};
use gatekeeper_error::ErrorClass;
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::debug;

/// Number of outcome records kept for [`MetricsRecorder::recent`].
pub const RECENT_CAPACITY: usize = 256;

/// Accumulated counters for one method.
#[derive(Debug, Clone, Default, PartialEq, Getters)]
pub struct MethodStats {
    /// Calls settled with a value
    success_count: u64,
    /// Calls settled with any error other than `Cancelled`
    failure_count: u64,
    /// Calls withdrawn before dispatch
    cancelled_count: u64,
    /// Sum of admission and batch-window waits
    total_wait: Duration,
    /// Sum of end-to-end durations
    total_latency: Duration,
    /// Settled errors per class
    errors_by_kind: BTreeMap<ErrorClass, u64>,
    /// Phase transitions observed
    phase_counts: BTreeMap<CallPhase, u64>,
    /// Batch dispatches flushed
    batches: u64,
    /// Sub-requests carried by flushed batches
    batched_requests: u64,
}

impl MethodStats {
    /// Calls settled in any way.
    pub fn settled(&self) -> u64 {
        self.success_count + self.failure_count + self.cancelled_count
    }

    /// Mean wait per settled call in milliseconds.
    pub fn avg_wait_ms(&self) -> f64 {
        mean_ms(self.total_wait, self.settled())
    }

    /// Mean end-to-end duration per settled call in milliseconds.
    pub fn avg_latency_ms(&self) -> f64 {
        mean_ms(self.total_latency, self.settled())
    }

    fn record(&mut self, record: &OutcomeRecord) {
        match record.error_kind() {
            None => self.success_count += 1,
            Some(ErrorClass::Cancelled) => self.cancelled_count += 1,
            Some(_) => self.failure_count += 1,
        }
        if let Some(kind) = record.error_kind() {
            *self.errors_by_kind.entry(*kind).or_default() += 1;
        }
        self.total_wait += *record.wait();
        self.total_latency += *record.duration();
    }
}

fn mean_ms(total: Duration, count: u64) -> f64 {
    if count == 0 {
        0.0
    } else {
        total.as_secs_f64() * 1000.0 / count as f64
    }
}

#[derive(Debug, Default)]
struct RecorderState {
    methods: BTreeMap<String, MethodStats>,
    recent: VecDeque<OutcomeRecord>,
}

/// Collects outcome records and phase events per method.
///
/// Every record is also forwarded to the global [`GatekeeperMetrics`]
/// instruments.
#[derive(Debug, Default)]
pub struct MetricsRecorder {
    state: Mutex<RecorderState>,
}

impl MetricsRecorder {
    /// Create an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, RecorderState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record a settled call.
    pub fn record(&self, record: &OutcomeRecord) {
        debug!(
            method = %record.method(),
            success = record.success(),
            error_kind = ?record.error_kind(),
            attempts = record.attempts(),
            duration_ms = record.duration().as_millis() as u64,
            "Recording outcome"
        );
        {
            let mut state = self.lock();
            state
                .methods
                .entry(record.method().clone())
                .or_default()
                .record(record);
            if state.recent.len() == RECENT_CAPACITY {
                state.recent.pop_front();
            }
            state.recent.push_back(record.clone());
        }
        GatekeeperMetrics::get().record_outcome(record);
    }

    /// Count a phase transition.
    pub fn record_phase(&self, event: &PhaseEvent) {
        let mut state = self.lock();
        let stats = state.methods.entry(event.method().clone()).or_default();
        *stats.phase_counts.entry(*event.phase()).or_default() += 1;
    }

    /// Count a flushed batch of `size` sub-requests.
    pub fn record_batch(&self, method: &str, size: usize) {
        {
            let mut state = self.lock();
            let stats = state.methods.entry(method.to_string()).or_default();
            stats.batches += 1;
            stats.batched_requests += size as u64;
        }
        GatekeeperMetrics::get().record_batch(method);
    }

    /// Counters for `method`, if anything was recorded for it.
    pub fn stats(&self, method: &str) -> Option<MethodStats> {
        self.lock().methods.get(method).cloned()
    }

    /// Methods with recorded activity, sorted.
    pub fn methods(&self) -> Vec<String> {
        self.lock().methods.keys().cloned().collect()
    }

    /// The last `n` outcome records, oldest first.
    pub fn recent(&self, n: usize) -> Vec<OutcomeRecord> {
        let state = self.lock();
        let skip = state.recent.len().saturating_sub(n);
        state.recent.iter().skip(skip).cloned().collect()
    }
}
