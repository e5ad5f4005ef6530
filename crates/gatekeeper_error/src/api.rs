//! Upstream API error types and the retry classification trait.

use crate::CallError;
use std::time::Duration;

/// Upstream API failure conditions.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, derive_more::Display)]
pub enum ApiErrorKind {
    /// HTTP error with status code and message
    #[display("HTTP {} error: {}", status_code, message)]
    Http {
        /// HTTP status code
        status_code: u16,
        /// Error message
        message: String,
    },
    /// Connection reset, DNS failure or other transport problem
    #[display("Transport failure: {}", _0)]
    Transport(String),
    /// Request parameters rejected by the upstream
    #[display("Validation failed: {}", _0)]
    Validation(String),
    /// Credentials missing, expired or revoked
    #[display("Unauthorized: {}", _0)]
    Unauthorized(String),
    /// Requested object does not exist
    #[display("Not found: {}", _0)]
    NotFound(String),
}

impl ApiErrorKind {
    /// Check if this error type should be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            ApiErrorKind::Http { status_code, .. } => {
                matches!(*status_code, 408 | 429 | 500 | 502 | 503 | 504)
            }
            ApiErrorKind::Transport(_) => true,
            _ => false,
        }
    }
}

/// Upstream API error with source location tracking.
///
/// # Examples
///
/// ```
/// use gatekeeper_error::{ApiError, ApiErrorKind, RetryableError};
///
/// let err = ApiError::new(ApiErrorKind::Http {
///     status_code: 503,
///     message: "Service unavailable".to_string(),
/// });
/// assert!(err.is_retryable());
///
/// let err = ApiError::new(ApiErrorKind::NotFound("group 42".to_string()));
/// assert!(!err.is_retryable());
/// ```
#[derive(Debug, Clone, derive_more::Display, derive_more::Error)]
#[display("API Error: {} at line {} in {}", kind, line, file)]
pub struct ApiError {
    /// The kind of error that occurred
    pub kind: ApiErrorKind,
    /// Delay the upstream asked for (e.g. a `Retry-After` header)
    pub retry_after: Option<Duration>,
    /// Line number where error was created
    pub line: u32,
    /// File where error was created
    pub file: &'static str,
}

impl ApiError {
    /// Create a new ApiError with automatic location tracking.
    #[track_caller]
    pub fn new(kind: ApiErrorKind) -> Self {
        let location = std::panic::Location::caller();
        Self {
            kind,
            retry_after: None,
            line: location.line(),
            file: location.file(),
        }
    }

    /// Attach the delay the upstream asked for.
    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = Some(retry_after);
        self
    }
}

/// Trait for errors that support retry logic.
///
/// This is the classification boundary: the error returned by an upstream
/// operation is turned into a [`CallError`] through this trait the moment the
/// operation returns.
///
/// # Examples
///
/// ```
/// use gatekeeper_error::RetryableError;
///
/// #[derive(Debug)]
/// struct Flaky;
///
/// impl std::fmt::Display for Flaky {
///     fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
///         write!(f, "connection reset")
///     }
/// }
///
/// impl RetryableError for Flaky {
///     fn is_retryable(&self) -> bool {
///         true
///     }
/// }
///
/// let err = Flaky.classify();
/// assert!(err.is_retryable());
/// assert!(err.to_string().contains("connection reset"));
/// ```
pub trait RetryableError: std::fmt::Display {
    /// Returns true if this error should trigger a retry.
    ///
    /// Transient errors like 503 (service unavailable), 429 (rate limit),
    /// or network timeouts should return true. Permanent errors like 401
    /// (unauthorized) or 400 (bad request) should return false.
    fn is_retryable(&self) -> bool;

    /// Delay the upstream asked for before the next attempt.
    fn retry_after(&self) -> Option<Duration> {
        None
    }

    /// Convert into the closed call error taxonomy.
    #[track_caller]
    fn classify(&self) -> CallError {
        CallError::new(crate::CallErrorKind::Upstream {
            message: self.to_string(),
            retryable: self.is_retryable(),
            retry_after: self.retry_after(),
        })
    }
}

impl RetryableError for ApiError {
    fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }

    fn retry_after(&self) -> Option<Duration> {
        self.retry_after
    }
}

impl RetryableError for CallError {
    fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }

    fn retry_after(&self) -> Option<Duration> {
        CallError::retry_after(self)
    }

    #[track_caller]
    fn classify(&self) -> CallError {
        self.clone()
    }
}
