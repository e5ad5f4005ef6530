//! Failures while loading or checking policy configuration.

/// Why a policy configuration was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Hash, derive_more::Display)]
pub enum ConfigErrorKind {
    /// A configuration source could not be read or merged.
    #[display("cannot read policy configuration: {}", _0)]
    Unreadable(String),
    /// The merged sources do not match the policy schema.
    #[display("cannot parse policy configuration: {}", _0)]
    Malformed(String),
    /// A method override has no method name.
    #[display("method override without a name")]
    UnnamedOverride,
    /// A resolved policy value is out of range.
    #[display("invalid policy for {}: {}", method, reason)]
    InvalidPolicy {
        /// Method whose resolved policy failed, `<defaults>` for the defaults
        method: String,
        /// The offending value and the range it must fall in
        reason: String,
    },
}

/// Configuration error with source location tracking.
///
/// # Examples
///
/// ```
/// use gatekeeper_error::{ConfigError, ConfigErrorKind};
///
/// let err = ConfigError::invalid_policy("friends.get", "capacity must be greater than 0");
/// assert!(matches!(err.kind(), ConfigErrorKind::InvalidPolicy { method, .. } if method == "friends.get"));
/// assert!(err.to_string().contains("invalid policy for friends.get"));
/// ```
#[derive(Debug, Clone, derive_more::Display, derive_more::Error)]
#[display("Config Error: {} at line {} in {}", kind, line, file)]
pub struct ConfigError {
    /// The kind of error that occurred
    pub kind: ConfigErrorKind,
    /// Line number where the error occurred
    pub line: u32,
    /// File where the error occurred
    pub file: &'static str,
}

impl ConfigError {
    /// Create an error of `kind` at the current location.
    #[track_caller]
    pub fn new(kind: ConfigErrorKind) -> Self {
        let location = std::panic::Location::caller();
        Self {
            kind,
            line: location.line(),
            file: location.file(),
        }
    }

    /// A source that could not be read.
    #[track_caller]
    pub fn unreadable(message: impl Into<String>) -> Self {
        Self::new(ConfigErrorKind::Unreadable(message.into()))
    }

    /// Sources that do not deserialize into a configuration.
    #[track_caller]
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::new(ConfigErrorKind::Malformed(message.into()))
    }

    /// An out-of-range value in the resolved policy of `method`.
    #[track_caller]
    pub fn invalid_policy(method: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::new(ConfigErrorKind::InvalidPolicy {
            method: method.into(),
            reason: reason.into(),
        })
    }

    /// Get the error kind.
    pub fn kind(&self) -> &ConfigErrorKind {
        &self.kind
    }
}
