//! Gatekeeper - resilience layer for rate-limited upstream APIs
//!
//! Every outbound call to the upstream goes through one [`RequestManager`],
//! which composes the per-key components:
//!
//! - **Circuit breaker**: fail fast while an upstream key is unhealthy
//! - **Rate limiter**: token bucket admission with FIFO waiting
//! - **Retry executor**: bounded exponential backoff for retryable failures
//! - **Batching coordinator**: coalesce compatible calls into one dispatch
//! - **Metrics recorder**: per-method outcome, wait and latency counters
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use gatekeeper::{ApiError, ApiErrorKind, CallDescriptor, RequestManager};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let manager = RequestManager::load()?;
//!
//!     let friends = manager
//!         .execute(&CallDescriptor::new("friends.get"), || async {
//!             // Call the upstream here.
//!             Ok::<_, ApiError>(vec![1u64, 2, 3])
//!         })
//!         .await?;
//!
//!     println!("{} friends", friends.len());
//!     println!("{}", serde_json::to_string_pretty(&manager.metrics_snapshot())?);
//!     Ok(())
//! }
//! ```
//!
//! # Cargo Features
//!
//! - `observability` - OpenTelemetry stdout export of spans and metrics
//!
//! # Architecture
//!
//! Gatekeeper is organized as a workspace with focused crates:
//!
//! - `gatekeeper_error` - Error types and the retry classification trait
//! - `gatekeeper_core` - Descriptors, outcome records, phases, policies, configuration
//! - `gatekeeper_rate_limit` - Token bucket admission control
//! - `gatekeeper_circuit` - Failure-ratio circuit breaker
//! - `gatekeeper_retry` - Retry with backoff
//! - `gatekeeper_batch` - Request coalescing
//! - `gatekeeper_metrics` - Metrics recorder and OpenTelemetry instruments
//!
//! This crate (`gatekeeper`) re-exports everything for convenience.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod call;
mod handler;
mod manager;

#[cfg(feature = "observability")]
pub mod observability;

pub use handler::BatchHandler;
pub use manager::RequestManager;

// Re-export workspace crates
pub use gatekeeper_batch::{BatchFlush, BatchReply, BatchingCoordinator, PendingBatch};
pub use gatekeeper_circuit::{CircuitBreaker, CircuitPermit, CircuitSnapshot};
pub use gatekeeper_core::*;
pub use gatekeeper_error::*;
pub use gatekeeper_metrics::{
    GatekeeperMetrics, MethodSnapshot, MethodStats, MetricsRecorder, MetricsSnapshot,
};
pub use gatekeeper_rate_limit::{
    Admission, BudgetSnapshot, Grant, MethodBudget, RateLimiter, Reservation,
};
pub use gatekeeper_retry::RetryExecutor;

pub use tokio_util::sync::CancellationToken;
