//! Window management and positional demultiplexing.

use crate::pending::{BatchReply, PendingBatch, QueuedRequest};
use futures::future::BoxFuture;
use gatekeeper_core::GatekeeperConfig;
use gatekeeper_error::{CallError, CallResult};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Performs one combined dispatch for a flushed batch.
///
/// The flush admits the dispatch first and only then calls
/// [`PendingBatch::take`] for the sub-request params, returning one
/// response per taken sub-request in the same order. Callers may withdraw
/// until `take`; when all of them do, [`PendingBatch::abandoned`] fires.
pub type BatchFlush =
    Arc<dyn Fn(Arc<PendingBatch>) -> BoxFuture<'static, CallResult<Vec<JsonValue>>> + Send + Sync>;

type BatchKey = (String, String);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct Inner {
    config: Arc<GatekeeperConfig>,
    flush: BatchFlush,
    pending: Mutex<HashMap<BatchKey, Arc<PendingBatch>>>,
    next_id: AtomicU64,
}

impl Inner {
    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Close the window of the batch for `batch_key` if it is still the one numbered `batch_id`.
    fn take(&self, batch_key: &BatchKey, batch_id: u64) -> Option<Arc<PendingBatch>> {
        let mut pending = lock(&self.pending);
        match pending.get(batch_key) {
            Some(batch) if batch.id() == batch_id => pending.remove(batch_key),
            _ => None,
        }
    }

    fn withdraw(&self, batch_key: &BatchKey, batch: &Arc<PendingBatch>, slot_id: u64) -> bool {
        // Held so nobody joins a batch between its last caller leaving and its removal.
        let mut pending = lock(&self.pending);
        let withdrawn = batch.withdraw(slot_id);
        if withdrawn && batch.is_empty() {
            debug!(method = %batch.method(), key = %batch.key(), "Last caller left, discarding batch");
            if pending
                .get(batch_key)
                .is_some_and(|open| Arc::ptr_eq(open, batch))
            {
                pending.remove(batch_key);
            }
        }
        withdrawn
    }

    async fn dispatch(self: Arc<Self>, batch: Arc<PendingBatch>) {
        if batch.abandoned().is_cancelled() {
            debug!(method = %batch.method(), key = %batch.key(), "Every caller left before flush, skipping dispatch");
            return;
        }

        info!(method = %batch.method(), key = %batch.key(), size = batch.len(), "Flushing batch");

        let result = (self.flush)(Arc::clone(&batch)).await;
        if let Err(e) = &result {
            if batch.is_taken() {
                warn!(method = %batch.method(), size = batch.len(), error = %e.kind(), "Batch dispatch failed");
            } else {
                debug!(method = %batch.method(), error = %e.kind(), "Batch ended before dispatch");
            }
        }
        batch.settle(result);
    }
}

/// Coalesces batchable calls per `(method, key)`.
///
/// Flushes run on their own task, so a caller leaving never interrupts a
/// dispatch other callers depend on.
#[derive(Clone)]
pub struct BatchingCoordinator {
    inner: Arc<Inner>,
}

impl BatchingCoordinator {
    /// Create a coordinator dispatching flushed batches through `flush`.
    pub fn new(config: Arc<GatekeeperConfig>, flush: BatchFlush) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                flush,
                pending: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(0),
            }),
        }
    }

    /// Queue `params` and wait for this sub-request's share of the response.
    ///
    /// # Errors
    ///
    /// Returns the dispatch error shared by the whole batch, or a terminal
    /// `Upstream` error when the response count does not match.
    pub async fn submit(
        &self,
        method: &str,
        key: &str,
        params: JsonValue,
    ) -> CallResult<BatchReply> {
        self.submit_with_cancel(method, key, params, &CancellationToken::new())
            .await
    }

    /// Like [`submit`](Self::submit), withdrawing the sub-request with
    /// `Cancelled` if `cancel` fires before its batch is taken for dispatch.
    ///
    /// That includes the time a flushed batch spends waiting for admission.
    /// Once taken the dispatch cannot be recalled and the caller receives
    /// its response as usual.
    ///
    /// # Errors
    ///
    /// As for [`submit`](Self::submit), plus `Cancelled`.
    #[instrument(skip(self, params, cancel))]
    pub async fn submit_with_cancel(
        &self,
        method: &str,
        key: &str,
        params: JsonValue,
        cancel: &CancellationToken,
    ) -> CallResult<BatchReply> {
        if cancel.is_cancelled() {
            return Err(CallError::cancelled());
        }

        let policy = self.inner.config.for_method(method).batch().clone();
        let batch_key: BatchKey = (method.to_string(), key.to_string());
        let (settle, mut settled) = oneshot::channel();
        let slot_id = self.inner.next_id();

        let (batch, opened, full) = {
            let mut pending = lock(&self.inner.pending);
            let batch = Arc::clone(pending.entry(batch_key.clone()).or_insert_with(|| {
                Arc::new(PendingBatch::new(
                    self.inner.next_id(),
                    method,
                    key,
                    Instant::now() + policy.window(),
                ))
            }));
            let opened = batch.is_empty();
            let size = batch.push(QueuedRequest {
                slot_id,
                params,
                settle,
            });
            debug!(batch_id = batch.id(), size, "Queued sub-request");

            let full = size >= *policy.max_batch_size();
            if full {
                pending.remove(&batch_key);
            }
            (batch, opened, full)
        };
        let batch_id = batch.id();

        if full {
            debug!(batch_id, "Batch full, flushing");
            tokio::spawn(Arc::clone(&self.inner).dispatch(Arc::clone(&batch)));
        } else if opened {
            self.spawn_window(batch_key.clone(), batch_id, batch.deadline());
        }

        let mut slot = SlotGuard {
            inner: &self.inner,
            batch_key,
            batch,
            slot_id,
            queued: true,
        };

        let received = loop {
            tokio::select! {
                result = &mut settled => break result,
                _ = cancel.cancelled(), if slot.queued => {
                    if slot.withdraw() {
                        debug!(batch_id, "Caller withdrew before dispatch");
                        return Err(CallError::cancelled());
                    }
                }
            }
        };
        slot.queued = false;

        received.unwrap_or_else(|_| {
            Err(CallError::upstream(
                "batch dispatch ended without settling this request",
                false,
            ))
        })
    }

    fn spawn_window(&self, batch_key: BatchKey, batch_id: u64, deadline: Instant) {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            if let Some(batch) = inner.take(&batch_key, batch_id) {
                debug!(batch_id, "Window elapsed, flushing");
                inner.dispatch(batch).await;
            }
        });
    }

    /// Sub-requests currently waiting for `(method, key)`.
    pub fn queued(&self, method: &str, key: &str) -> usize {
        lock(&self.inner.pending)
            .get(&(method.to_string(), key.to_string()))
            .map_or(0, |batch| batch.len())
    }
}

/// Withdraws a caller's slot if its future is dropped while still queued.
struct SlotGuard<'a> {
    inner: &'a Arc<Inner>,
    batch_key: BatchKey,
    batch: Arc<PendingBatch>,
    slot_id: u64,
    queued: bool,
}

impl SlotGuard<'_> {
    fn withdraw(&mut self) -> bool {
        self.queued = false;
        self.inner
            .withdraw(&self.batch_key, &self.batch, self.slot_id)
    }
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        if self.queued {
            self.withdraw();
        }
    }
}
