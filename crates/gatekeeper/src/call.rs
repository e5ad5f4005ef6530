//! Per-call bookkeeping shared by the attempts of one logical call.

use gatekeeper_core::{CallDescriptor, MethodPolicy};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;

/// Whether a call is one caller's request or the shared dispatch of a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CallKind {
    Logical,
    BatchDispatch,
}

#[derive(Debug)]
pub(crate) struct CallContext {
    pub(crate) id: u64,
    pub(crate) kind: CallKind,
    pub(crate) method: String,
    pub(crate) key: String,
    pub(crate) units: u32,
    pub(crate) deadline: Duration,
    pub(crate) policy: MethodPolicy,
    pub(crate) started: Instant,
    waited_nanos: AtomicU64,
    dispatches: AtomicU32,
}

impl CallContext {
    pub(crate) fn new(
        id: u64,
        kind: CallKind,
        descriptor: &CallDescriptor,
        policy: MethodPolicy,
    ) -> Self {
        Self {
            id,
            kind,
            method: descriptor.method().clone(),
            key: descriptor.key().clone(),
            units: descriptor.units(),
            deadline: descriptor.deadline().unwrap_or_else(|| policy.deadline()),
            policy,
            started: Instant::now(),
            waited_nanos: AtomicU64::new(0),
            dispatches: AtomicU32::new(0),
        }
    }

    pub(crate) fn add_wait(&self, wait: Duration) {
        let nanos = u64::try_from(wait.as_nanos()).unwrap_or(u64::MAX);
        self.waited_nanos.fetch_add(nanos, Ordering::Relaxed);
    }

    pub(crate) fn waited(&self) -> Duration {
        Duration::from_nanos(self.waited_nanos.load(Ordering::Relaxed))
    }

    pub(crate) fn dispatched(&self) -> u32 {
        self.dispatches.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub(crate) fn dispatches(&self) -> u32 {
        self.dispatches.load(Ordering::Relaxed)
    }
}
