//! Combined dispatch for batchable methods.

use async_trait::async_trait;
use gatekeeper_error::CallResult;
use serde_json::Value as JsonValue;

/// Performs the upstream round-trip for a flushed batch.
///
/// Implementations send every sub-request of `requests` in one upstream
/// call and return exactly one response per sub-request, in the same order.
/// Failures should be classified at this boundary, e.g. with
/// [`RetryableError::classify`](gatekeeper_error::RetryableError::classify).
///
/// # Example
///
/// ```rust
/// use async_trait::async_trait;
/// use gatekeeper::{BatchHandler, CallResult};
/// use serde_json::{json, Value};
///
/// struct UsersGet;
///
/// #[async_trait]
/// impl BatchHandler for UsersGet {
///     async fn dispatch(&self, _method: &str, requests: Vec<Value>) -> CallResult<Vec<Value>> {
///         Ok(requests.into_iter().map(|id| json!({ "id": id })).collect())
///     }
/// }
/// ```
#[async_trait]
pub trait BatchHandler: Send + Sync {
    /// Dispatch `requests` for `method` as one upstream call.
    async fn dispatch(&self, method: &str, requests: Vec<JsonValue>) -> CallResult<Vec<JsonValue>>;
}
