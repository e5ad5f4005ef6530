//! Retry loop driven by `tokio-retry2`.

use derive_getters::Getters;
use gatekeeper_core::RetryPolicy;
use gatekeeper_error::{CallError, CallResult};
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio_retry2::{Retry, RetryError, strategy::jitter};
use tracing::{debug, instrument, warn};

/// Runs one logical call up to `max_attempts` times.
///
/// # Example
///
/// ```rust
/// use gatekeeper_core::RetryPolicy;
/// use gatekeeper_error::CallError;
/// use gatekeeper_retry::RetryExecutor;
///
/// # async fn example() {
/// let executor = RetryExecutor::new(RetryPolicy::default());
/// let value = executor
///     .run(|attempt| async move {
///         if attempt < 2 {
///             Err(CallError::upstream("503 Service Unavailable", true))
///         } else {
///             Ok(attempt)
///         }
///     })
///     .await;
/// assert_eq!(value.unwrap(), 2);
/// # }
/// ```
#[derive(Debug, Clone, Getters)]
pub struct RetryExecutor {
    policy: RetryPolicy,
}

impl RetryExecutor {
    /// Create an executor for `policy`.
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    /// Delays before the second through last attempt, before jitter.
    pub fn schedule(&self) -> Vec<Duration> {
        (1..*self.policy.max_attempts())
            .map(|retry| self.policy.backoff(retry))
            .collect()
    }

    /// Run `attempt` until it succeeds, fails terminally, or attempts run out.
    ///
    /// `attempt` receives the 1-based attempt number. Every attempt must go
    /// back through admission control itself; this loop only decides whether
    /// and when to try again.
    ///
    /// # Errors
    ///
    /// Returns the last observed error annotated with the number of
    /// attempts made.
    #[instrument(skip_all, fields(max_attempts = self.policy.max_attempts()))]
    pub async fn run<T, F, Fut>(&self, mut attempt: F) -> CallResult<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = CallResult<T>>,
    {
        let use_jitter = *self.policy.jitter();
        let strategy = self
            .schedule()
            .into_iter()
            .map(move |delay| if use_jitter { jitter(delay) } else { delay });

        let attempts = AtomicU32::new(0);
        let max_attempts = *self.policy.max_attempts();

        let result = Retry::spawn(strategy, || {
            let n = attempts.fetch_add(1, Ordering::SeqCst) + 1;
            let call = attempt(n);
            async move {
                match call.await {
                    Ok(value) => {
                        debug!(attempt = n, "Attempt succeeded");
                        Ok(value)
                    }
                    Err(e) if e.is_retryable() && n < max_attempts => {
                        warn!(attempt = n, error = %e.kind(), "Transient failure, will retry");
                        Err(RetryError::Transient {
                            retry_after: e.retry_after(),
                            err: e,
                        })
                    }
                    Err(e) => {
                        if e.is_retryable() {
                            warn!(attempt = n, error = %e.kind(), "Retries exhausted");
                        } else {
                            debug!(attempt = n, error = %e.kind(), "Terminal failure, not retrying");
                        }
                        Err(RetryError::Permanent(e))
                    }
                }
            }
        })
        .await;

        let made = attempts.load(Ordering::SeqCst);
        result.map_err(|e: CallError| e.with_attempts(made))
    }
}
