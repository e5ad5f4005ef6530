//! Batches and their settlement slots.

use derive_getters::Getters;
use gatekeeper_error::{CallError, CallResult};
use serde_json::Value as JsonValue;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::warn;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One caller's share of a dispatched batch.
#[derive(Debug, Clone, PartialEq, Getters)]
pub struct BatchReply {
    /// Response for this sub-request
    value: JsonValue,
    /// Upstream dispatches the batch needed, retries included
    dispatches: u32,
}

impl BatchReply {
    /// The response, discarding the dispatch count.
    pub fn into_value(self) -> JsonValue {
        self.value
    }
}

/// One queued sub-request and the slot its outcome is delivered to.
#[derive(Debug)]
pub(crate) struct QueuedRequest {
    pub(crate) slot_id: u64,
    pub(crate) params: JsonValue,
    pub(crate) settle: oneshot::Sender<CallResult<BatchReply>>,
}

#[derive(Debug, Default)]
struct Slots {
    queued: Vec<QueuedRequest>,
    taken: bool,
    dispatches: u32,
}

/// Sub-requests collected for one `(method, key)` pair, in arrival order.
///
/// Callers may withdraw until the flush calls [`take`](Self::take), which
/// happens only once the dispatch has been admitted. A batch left by every
/// caller before that point fires [`abandoned`](Self::abandoned).
#[derive(Debug)]
pub struct PendingBatch {
    id: u64,
    method: String,
    key: String,
    deadline: Instant,
    abandoned: CancellationToken,
    slots: Mutex<Slots>,
}

impl PendingBatch {
    pub(crate) fn new(id: u64, method: &str, key: &str, deadline: Instant) -> Self {
        Self {
            id,
            method: method.to_string(),
            key: key.to_string(),
            deadline,
            abandoned: CancellationToken::new(),
            slots: Mutex::new(Slots::default()),
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    /// Upstream method of every sub-request.
    pub fn method(&self) -> &str {
        &self.method
    }

    /// Rate-limit and circuit key the flush is charged to.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// When the window closes.
    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Fires when the last caller withdraws before the batch is taken.
    pub fn abandoned(&self) -> &CancellationToken {
        &self.abandoned
    }

    /// Queued sub-requests.
    pub fn len(&self) -> usize {
        lock(&self.slots).queued.len()
    }

    /// True when no sub-request is queued.
    pub fn is_empty(&self) -> bool {
        lock(&self.slots).queued.is_empty()
    }

    /// Whether the sub-requests have been committed to a dispatch.
    pub fn is_taken(&self) -> bool {
        lock(&self.slots).taken
    }

    pub(crate) fn push(&self, request: QueuedRequest) -> usize {
        let mut slots = lock(&self.slots);
        slots.queued.push(request);
        slots.queued.len()
    }

    /// Drop the slot of a caller who left; true if it was still withdrawable.
    pub(crate) fn withdraw(&self, slot_id: u64) -> bool {
        let mut slots = lock(&self.slots);
        if slots.taken {
            return false;
        }
        let before = slots.queued.len();
        slots.queued.retain(|slot| slot.slot_id != slot_id);
        let withdrawn = slots.queued.len() != before;
        if withdrawn && slots.queued.is_empty() {
            self.abandoned.cancel();
        }
        withdrawn
    }

    /// Commit the queued sub-requests to a dispatch and return their params.
    ///
    /// The first call closes the batch to withdrawals and drops callers
    /// whose receivers are gone. Each call counts as one upstream dispatch,
    /// so retries call it again and get the same params.
    pub fn take(&self) -> Vec<JsonValue> {
        let mut slots = lock(&self.slots);
        if !slots.taken {
            slots.taken = true;
            slots.queued.retain(|slot| !slot.settle.is_closed());
        }
        slots.dispatches += 1;
        slots.queued.iter().map(|slot| slot.params.clone()).collect()
    }

    /// Deliver the flush outcome to every remaining caller, by position.
    pub(crate) fn settle(&self, result: CallResult<Vec<JsonValue>>) {
        let (queued, dispatches) = {
            let mut slots = lock(&self.slots);
            slots.taken = true;
            (std::mem::take(&mut slots.queued), slots.dispatches)
        };
        let count = queued.len();

        match result {
            Ok(responses) if responses.len() == count => {
                for (slot, value) in queued.into_iter().zip(responses) {
                    let _ = slot.settle.send(Ok(BatchReply { value, dispatches }));
                }
            }
            Ok(responses) => {
                warn!(
                    method = %self.method,
                    expected = count,
                    received = responses.len(),
                    "Batch response count does not match request count"
                );
                let err = CallError::upstream(
                    format!(
                        "batch for {} returned {} responses for {} requests",
                        self.method,
                        responses.len(),
                        count
                    ),
                    false,
                )
                .with_attempts(dispatches);
                for slot in queued {
                    let _ = slot.settle.send(Err(err.clone()));
                }
            }
            Err(e) => {
                for slot in queued {
                    let _ = slot.settle.send(Err(e.clone()));
                }
            }
        }
    }
}
