//! Error types for the Gatekeeper workspace.
//!
//! This crate provides the foundation error types used by every Gatekeeper crate.
//!
//! # Error Hierarchy
//!
//! All errors follow the `ErrorKind` + wrapper struct pattern:
//! - `*ErrorKind` enum defines specific error conditions
//! - `*Error` struct wraps the kind with source location tracking
//! - All errors use `#[track_caller]` for automatic location capture
//!
//! Outbound calls fail with a [`CallError`], whose [`CallErrorKind`] is the closed
//! set of outcomes a caller has to handle. Upstream failures are classified into
//! that set at the boundary through the [`RetryableError`] trait, so no other
//! component ever inspects raw upstream error shapes.
//!
//! # Examples
//!
//! ```
//! use gatekeeper_error::{CallError, CallErrorKind, ErrorClass};
//!
//! let err = CallError::upstream("502 bad gateway", true);
//! assert!(err.is_retryable());
//! assert_eq!(err.class(), ErrorClass::Upstream);
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod api;
mod call;
mod config;
mod error;

pub use api::{ApiError, ApiErrorKind, RetryableError};
pub use call::{CallError, CallErrorKind, CallResult, ErrorClass};
pub use config::{ConfigError, ConfigErrorKind};
pub use error::{GatekeeperError, GatekeeperErrorKind, GatekeeperResult};
