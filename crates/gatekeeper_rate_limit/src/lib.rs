//! Per-method token bucket admission control.
//!
//! Every rate-limit key owns a [`MethodBudget`] that refills lazily from
//! elapsed time. Callers that cannot be served immediately reserve their
//! units and queue FIFO behind earlier waiters; the reservation is released
//! if the waiting caller goes away.
//!
//! ```text
//! reserve(units)
//!     → free ≥ units          → Admission::Granted
//!     → wait ≤ max_wait       → Admission::Pending(Reservation) → ready().await → Grant
//!     → wait > max_wait       → CallErrorKind::RateLimited
//! ```
//!
//! Admission is local to the process: several instances each enforce their
//! own budget.

mod budget;
mod limiter;

pub use budget::{BudgetSnapshot, MethodBudget};
pub use limiter::{Admission, Grant, RateLimiter, Reservation};
