//! Per-key failure-ratio circuit breaker.
//!
//! ```text
//!            failures ≥ threshold and ratio ≥ failure_ratio
//!   Closed ───────────────────────────────────────────────▶ Open
//!     ▲                                                    │  ▲
//!     │ probe succeeds                     cooldown elapsed │  │ probe fails
//!     │                                                    ▼  │ (cooldown grows)
//!     └──────────────────────────────────────────────── HalfOpen
//! ```
//!
//! Callers take a [`CircuitPermit`] before each upstream attempt and report
//! the attempt's outcome through it. In the half-open state exactly one
//! permit (the probe) is outstanding at a time.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod breaker;
mod window;

pub use breaker::{CircuitBreaker, CircuitPermit, CircuitSnapshot};
