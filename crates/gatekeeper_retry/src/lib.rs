//! Bounded retry for classified failures.
//!
//! Only errors whose kind is retryable (`Timeout` and retryable `Upstream`)
//! are attempted again. `RateLimited`, `CircuitOpen` and `Cancelled` are
//! returned on first sight. When an upstream names a `retry_after` delay it
//! replaces the computed backoff for that retry.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod executor;

pub use executor::RetryExecutor;
