//! Descriptor of a single outbound call.

use derive_getters::Getters;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// What business code tells the request manager about a call.
///
/// The `key` selects both the token bucket and the circuit; it defaults to
/// the method name. Policies are always resolved by method.
///
/// # Examples
///
/// ```
/// use gatekeeper_core::CallDescriptor;
///
/// let descriptor = CallDescriptor::new("users.get")
///     .with_batchable(true)
///     .with_weight(2u32);
///
/// assert_eq!(descriptor.method(), "users.get");
/// assert_eq!(descriptor.key(), "users.get");
/// assert!(*descriptor.batchable());
/// assert_eq!(descriptor.units(), 2);
/// ```
#[derive(
    Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Getters, derive_setters::Setters,
)]
#[setters(prefix = "with_", into)]
pub struct CallDescriptor {
    /// Upstream method name, e.g. `friends.get`
    method: String,
    /// Rate-limit and circuit key
    key: String,
    /// Whether compatible calls may be coalesced into one dispatch
    #[serde(default)]
    batchable: bool,
    /// Rate-limit units this call consumes
    #[serde(default = "default_weight")]
    weight: u32,
    /// Per-call dispatch deadline overriding the method policy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    deadline: Option<Duration>,
}

fn default_weight() -> u32 {
    1
}

impl CallDescriptor {
    /// Descriptor for `method`, keyed by the method itself.
    pub fn new(method: impl Into<String>) -> Self {
        let method = method.into();
        Self {
            key: method.clone(),
            method,
            batchable: false,
            weight: default_weight(),
            deadline: None,
        }
    }

    /// Rate-limit units, never less than one.
    pub fn units(&self) -> u32 {
        self.weight.max(1)
    }
}
