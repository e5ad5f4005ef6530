//! Metrics for guarded upstream calls.
//!
//! Two layers are provided:
//! - [`MetricsRecorder`]: in-process counters per method, read back through
//!   snapshots for health and readiness checks.
//! - [`GatekeeperMetrics`]: OpenTelemetry instruments fed with the same
//!   records. They are no-ops until a meter provider is installed.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod instruments;
mod recorder;
mod snapshot;

pub use instruments::GatekeeperMetrics;
pub use recorder::{MethodStats, MetricsRecorder, RECENT_CAPACITY};
pub use snapshot::{MethodSnapshot, MetricsSnapshot};
