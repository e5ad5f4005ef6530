//! Coalescing of compatible calls into one upstream dispatch.
//!
//! The first sub-request for a `(method, key)` pair opens a
//! [`PendingBatch`]. Further sub-requests join it until the coalescing
//! window elapses or `max_batch_size` is reached, whichever comes first.
//! The batch is then flushed exactly once through a [`BatchFlush`] and the
//! combined response is handed back to each caller by position.
//!
//! A flushed batch stays open to withdrawals until the flush admits its
//! dispatch and calls [`PendingBatch::take`]. Callers who cancel while the
//! flush waits for admission are left out, and a batch nobody is left in
//! is never dispatched.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod coordinator;
mod pending;

pub use coordinator::{BatchFlush, BatchingCoordinator};
pub use pending::{BatchReply, PendingBatch};
