//! Classified outcomes of a guarded upstream call.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Closed classification of call failures, used for labels and outcome records.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumIter,
    strum::AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ErrorClass {
    /// Admission wait exceeded the configured maximum.
    RateLimited,
    /// Circuit was open; no upstream attempt was made.
    CircuitOpen,
    /// The upstream operation itself failed.
    Upstream,
    /// The dispatch deadline elapsed.
    Timeout,
    /// The caller withdrew before dispatch.
    Cancelled,
}

/// Specific failure conditions of a guarded call.
#[derive(Debug, Clone, PartialEq, Eq, Hash, derive_more::Display)]
pub enum CallErrorKind {
    /// Waiting for a rate-limit slot would exceed the configured maximum.
    #[display("rate limited on {}: wait of {:?} exceeds maximum {:?}", key, wait, max_wait)]
    RateLimited {
        /// Rate-limit key
        key: String,
        /// Wait that would have been required
        wait: Duration,
        /// Configured maximum wait
        max_wait: Duration,
    },
    /// The circuit for this key is open.
    #[display("circuit open for {}, next probe in {:?}", key, retry_in)]
    CircuitOpen {
        /// Circuit key
        key: String,
        /// Time until the circuit admits a probe
        retry_in: Duration,
    },
    /// The upstream operation failed.
    #[display("upstream error (retryable: {}): {}", retryable, message)]
    Upstream {
        /// Message of the underlying failure
        message: String,
        /// Whether the failure is transient
        retryable: bool,
        /// Delay the upstream asked for before the next attempt
        retry_after: Option<Duration>,
    },
    /// The dispatch exceeded its deadline.
    #[display("deadline of {:?} exceeded", deadline)]
    Timeout {
        /// Deadline that elapsed
        deadline: Duration,
    },
    /// The caller withdrew before the call was dispatched.
    #[display("call cancelled before dispatch")]
    Cancelled,
}

impl CallErrorKind {
    /// Classification of this failure.
    pub fn class(&self) -> ErrorClass {
        match self {
            CallErrorKind::RateLimited { .. } => ErrorClass::RateLimited,
            CallErrorKind::CircuitOpen { .. } => ErrorClass::CircuitOpen,
            CallErrorKind::Upstream { .. } => ErrorClass::Upstream,
            CallErrorKind::Timeout { .. } => ErrorClass::Timeout,
            CallErrorKind::Cancelled => ErrorClass::Cancelled,
        }
    }

    /// Check if this failure should be retried.
    ///
    /// `RateLimited`, `CircuitOpen` and `Cancelled` are policy decisions, never faults.
    pub fn is_retryable(&self) -> bool {
        match self {
            CallErrorKind::Upstream { retryable, .. } => *retryable,
            CallErrorKind::Timeout { .. } => true,
            _ => false,
        }
    }

    /// Check if this failure is evidence that the upstream is unhealthy.
    pub fn counts_against_circuit(&self) -> bool {
        self.is_retryable()
    }
}

/// Call error with attempt count and source location tracking.
///
/// # Examples
///
/// ```
/// use gatekeeper_error::{CallError, CallErrorKind};
/// use std::time::Duration;
///
/// let err = CallError::new(CallErrorKind::Timeout {
///     deadline: Duration::from_secs(5),
/// })
/// .with_attempts(3);
///
/// assert!(err.is_retryable());
/// assert_eq!(err.attempts, 3);
/// ```
#[derive(Debug, Clone, derive_more::Display, derive_more::Error)]
#[display("Call Error: {} after {} attempt(s) at line {} in {}", kind, attempts, line, file)]
pub struct CallError {
    /// The kind of error that occurred
    pub kind: CallErrorKind,
    /// Number of upstream attempts made before giving up
    pub attempts: u32,
    /// Line number where error was created
    pub line: u32,
    /// File where error was created
    pub file: &'static str,
}

impl CallError {
    /// Create a new CallError with automatic location tracking.
    #[track_caller]
    pub fn new(kind: CallErrorKind) -> Self {
        let location = std::panic::Location::caller();
        Self {
            kind,
            attempts: 0,
            line: location.line(),
            file: location.file(),
        }
    }

    /// Upstream failure with the given classification.
    #[track_caller]
    pub fn upstream(message: impl Into<String>, retryable: bool) -> Self {
        Self::new(CallErrorKind::Upstream {
            message: message.into(),
            retryable,
            retry_after: None,
        })
    }

    /// Deadline exceeded.
    #[track_caller]
    pub fn timeout(deadline: Duration) -> Self {
        Self::new(CallErrorKind::Timeout { deadline })
    }

    /// Caller withdrew before dispatch.
    #[track_caller]
    pub fn cancelled() -> Self {
        Self::new(CallErrorKind::Cancelled)
    }

    /// Circuit open for `key`.
    #[track_caller]
    pub fn circuit_open(key: impl Into<String>, retry_in: Duration) -> Self {
        Self::new(CallErrorKind::CircuitOpen {
            key: key.into(),
            retry_in,
        })
    }

    /// Admission wait above the configured maximum.
    #[track_caller]
    pub fn rate_limited(key: impl Into<String>, wait: Duration, max_wait: Duration) -> Self {
        Self::new(CallErrorKind::RateLimited {
            key: key.into(),
            wait,
            max_wait,
        })
    }

    /// Annotate the error with the number of attempts made.
    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    /// Get the error kind.
    pub fn kind(&self) -> &CallErrorKind {
        &self.kind
    }

    /// Classification of this error.
    pub fn class(&self) -> ErrorClass {
        self.kind.class()
    }

    /// Check if this error should trigger a retry.
    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }

    /// Check if this error should be recorded as a circuit failure.
    pub fn counts_against_circuit(&self) -> bool {
        self.kind.counts_against_circuit()
    }

    /// Delay requested by the upstream before retrying, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match &self.kind {
            CallErrorKind::Upstream { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

/// Result type for guarded calls.
pub type CallResult<T> = std::result::Result<T, CallError>;
