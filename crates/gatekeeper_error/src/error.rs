//! Top-level error wrapper types.

use crate::{CallError, ConfigError};

/// Every error the Gatekeeper crates can surface.
///
/// # Examples
///
/// ```
/// use gatekeeper_error::{ConfigError, GatekeeperError};
///
/// let err: GatekeeperError = ConfigError::invalid_policy("users.get", "bad window").into();
/// assert!(format!("{}", err).contains("Config Error: invalid policy for users.get"));
/// ```
#[derive(Debug, derive_more::From, derive_more::Display, derive_more::Error)]
pub enum GatekeeperErrorKind {
    /// Outbound call failed
    #[from(CallError)]
    Call(CallError),
    /// Configuration could not be loaded or is invalid
    #[from(ConfigError)]
    Config(ConfigError),
}

/// Gatekeeper error with kind discrimination.
///
/// # Examples
///
/// ```
/// use gatekeeper_error::{ConfigError, GatekeeperResult};
///
/// fn load() -> GatekeeperResult<()> {
///     Err(ConfigError::malformed("missing [defaults] table"))?
/// }
///
/// assert!(load().is_err());
/// ```
#[derive(Debug, derive_more::Display, derive_more::Error)]
#[display("Gatekeeper Error: {}", _0)]
pub struct GatekeeperError(Box<GatekeeperErrorKind>);

impl GatekeeperError {
    /// Create a new error from a kind.
    pub fn new(kind: GatekeeperErrorKind) -> Self {
        Self(Box::new(kind))
    }

    /// Get the error kind.
    pub fn kind(&self) -> &GatekeeperErrorKind {
        &self.0
    }
}

// Generic From implementation for any type that converts to GatekeeperErrorKind
impl<T> From<T> for GatekeeperError
where
    T: Into<GatekeeperErrorKind>,
{
    fn from(err: T) -> Self {
        Self::new(err.into())
    }
}

/// Result type for Gatekeeper configuration and setup operations.
pub type GatekeeperResult<T> = std::result::Result<T, GatekeeperError>;
