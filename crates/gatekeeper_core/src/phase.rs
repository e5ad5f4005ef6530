//! Explicit lifecycle phases of a guarded call.

use derive_getters::Getters;
use serde::{Deserialize, Serialize};

/// Where a call is in its lifecycle.
///
/// ```text
/// Queued → RateLimited → Dispatched → (Retrying → RateLimited → Dispatched)* → Succeeded | Failed
/// ```
///
/// `RateLimited` is only reported when admission actually has to wait.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumIter,
    strum::AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum CallPhase {
    /// Accepted by the manager
    Queued,
    /// Waiting for rate-limit admission
    RateLimited,
    /// Handed to the upstream
    Dispatched,
    /// A retryable failure is being retried
    Retrying,
    /// Settled with a value
    Succeeded,
    /// Settled with an error
    Failed,
}

impl CallPhase {
    /// Terminal phases end a call.
    pub fn is_terminal(self) -> bool {
        matches!(self, CallPhase::Succeeded | CallPhase::Failed)
    }
}

/// A phase transition of one call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Getters)]
pub struct PhaseEvent {
    /// Process-unique call identifier
    call_id: u64,
    /// Upstream method
    method: String,
    /// Rate-limit and circuit key
    key: String,
    /// Phase entered
    phase: CallPhase,
    /// Attempt number (0 before the first dispatch)
    attempt: u32,
}

impl PhaseEvent {
    /// Create a phase event.
    pub fn new(
        call_id: u64,
        method: impl Into<String>,
        key: impl Into<String>,
        phase: CallPhase,
        attempt: u32,
    ) -> Self {
        Self {
            call_id,
            method: method.into(),
            key: key.into(),
            phase,
            attempt,
        }
    }
}

/// Hook receiving every phase transition.
///
/// Observers run inline on the caller's task and must not block.
pub trait PhaseObserver: Send + Sync {
    /// Called for each transition.
    fn on_phase(&self, event: &PhaseEvent);
}
