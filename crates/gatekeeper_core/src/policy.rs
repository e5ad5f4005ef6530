//! Per-method resilience policies.
//!
//! Each policy carries serde defaults for every field so a configuration
//! file only has to name the values it changes.

use derive_getters::Getters;
use gatekeeper_error::ConfigError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Token bucket limits for one method.
///
/// # Example
///
/// ```toml
/// [defaults.rate_limit]
/// capacity = 3
/// refill_per_sec = 3.0
/// max_wait_ms = 30_000
/// ```
#[derive(
    Debug, Clone, PartialEq, Serialize, Deserialize, Getters, derive_builder::Builder,
)]
#[builder(default, setter(into))]
pub struct RateLimitPolicy {
    /// Bucket capacity (burst size) in units
    #[serde(default = "default_capacity")]
    pub(crate) capacity: u32,

    /// Units added per second
    #[serde(default = "default_refill_per_sec")]
    pub(crate) refill_per_sec: f64,

    /// Longest a caller may be queued before failing with `RateLimited`
    #[serde(default = "default_max_wait_ms")]
    pub(crate) max_wait_ms: u64,
}

fn default_capacity() -> u32 {
    3
}

fn default_refill_per_sec() -> f64 {
    3.0
}

fn default_max_wait_ms() -> u64 {
    30_000
}

impl Default for RateLimitPolicy {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            refill_per_sec: default_refill_per_sec(),
            max_wait_ms: default_max_wait_ms(),
        }
    }
}

impl RateLimitPolicy {
    /// Maximum admission wait.
    pub fn max_wait(&self) -> Duration {
        Duration::from_millis(self.max_wait_ms)
    }
}

/// Failure-ratio circuit breaker settings.
#[derive(
    Debug, Clone, PartialEq, Serialize, Deserialize, Getters, derive_builder::Builder,
)]
#[builder(default, setter(into))]
#[serde(default)]
pub struct CircuitPolicy {
    /// Minimum failures inside the window before the circuit may open
    pub(crate) failure_threshold: u32,
    /// Failure ratio (failures / calls in window) that opens the circuit
    pub(crate) failure_ratio: f64,
    /// Rolling window length in seconds
    pub(crate) window_secs: u64,
    /// Maximum number of recent calls kept in the window
    pub(crate) window_size: usize,
    /// Initial open-state cooldown before a probe is admitted
    pub(crate) cooldown_ms: u64,
    /// Cooldown growth after each failed probe
    pub(crate) cooldown_multiplier: f64,
    /// Upper bound for the grown cooldown
    pub(crate) max_cooldown_ms: u64,
}

impl Default for CircuitPolicy {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            failure_ratio: 0.5,
            window_secs: 10,
            window_size: 50,
            cooldown_ms: 5_000,
            cooldown_multiplier: 2.0,
            max_cooldown_ms: 60_000,
        }
    }
}

impl CircuitPolicy {
    /// Rolling window length.
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    /// Initial cooldown.
    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }

    /// Cooldown cap.
    pub fn max_cooldown(&self) -> Duration {
        Duration::from_millis(self.max_cooldown_ms)
    }
}

/// Bounded retry with exponential backoff.
#[derive(
    Debug, Clone, PartialEq, Serialize, Deserialize, Getters, derive_builder::Builder,
)]
#[builder(default, setter(into))]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub(crate) max_attempts: u32,
    /// Delay before the second attempt
    pub(crate) initial_backoff_ms: u64,
    /// Growth factor per attempt
    pub(crate) backoff_factor: f64,
    /// Cap for a single delay
    pub(crate) max_backoff_ms: u64,
    /// Randomize delays to avoid synchronized retry storms
    pub(crate) jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 200,
            backoff_factor: 2.0,
            max_backoff_ms: 10_000,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Delay before attempt `retry + 1`, where `retry` starts at 1.
    ///
    /// The first retry waits `initial_backoff_ms`, each following one grows by
    /// `backoff_factor`, capped at `max_backoff_ms`. Jitter is applied by the
    /// executor, not here.
    pub fn backoff(&self, retry: u32) -> Duration {
        if retry == 0 {
            return Duration::ZERO;
        }
        let exponent = (retry - 1).min(64) as i32;
        let delay_ms = self.initial_backoff_ms as f64 * self.backoff_factor.powi(exponent);
        let capped = delay_ms.min(self.max_backoff_ms as f64).max(0.0);
        Duration::from_millis(capped as u64)
    }
}

/// Coalescing window for batchable methods.
#[derive(
    Debug, Clone, PartialEq, Serialize, Deserialize, Getters, derive_builder::Builder,
)]
#[builder(default, setter(into))]
#[serde(default)]
pub struct BatchPolicy {
    /// Time a batch stays open after its first sub-request
    pub(crate) window_ms: u64,
    /// Sub-requests that trigger an immediate flush
    pub(crate) max_batch_size: usize,
    /// Rate-limit units one flushed dispatch consumes
    pub(crate) weight: u32,
}

impl Default for BatchPolicy {
    fn default() -> Self {
        Self {
            window_ms: 50,
            max_batch_size: 25,
            weight: 1,
        }
    }
}

impl BatchPolicy {
    /// Coalescing window.
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }
}

/// Fully resolved policy set for one method.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Getters)]
pub struct MethodPolicy {
    /// Method these policies apply to
    method: String,
    /// Token bucket limits
    rate_limit: RateLimitPolicy,
    /// Circuit breaker settings
    circuit: CircuitPolicy,
    /// Retry settings
    retry: RetryPolicy,
    /// Batch window settings
    batch: BatchPolicy,
    /// Dispatch deadline in milliseconds
    deadline_ms: u64,
}

impl MethodPolicy {
    /// Assemble a policy set.
    pub fn new(
        method: impl Into<String>,
        rate_limit: RateLimitPolicy,
        circuit: CircuitPolicy,
        retry: RetryPolicy,
        batch: BatchPolicy,
        deadline_ms: u64,
    ) -> Self {
        Self {
            method: method.into(),
            rate_limit,
            circuit,
            retry,
            batch,
            deadline_ms,
        }
    }

    /// Dispatch deadline.
    pub fn deadline(&self) -> Duration {
        Duration::from_millis(self.deadline_ms)
    }

    /// Validate every value of this policy set.
    ///
    /// # Errors
    ///
    /// Returns an `InvalidPolicy` error describing the first invalid value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |reason: String| Err(ConfigError::invalid_policy(&self.method, reason));

        let rl = &self.rate_limit;
        if rl.capacity == 0 {
            return invalid("capacity must be greater than 0".to_string());
        }
        if !rl.refill_per_sec.is_finite() || rl.refill_per_sec <= 0.0 {
            return invalid(format!(
                "refill_per_sec must be a positive number, got {}",
                rl.refill_per_sec
            ));
        }

        let cb = &self.circuit;
        if cb.failure_threshold == 0 {
            return invalid("failure_threshold must be greater than 0".to_string());
        }
        if !(cb.failure_ratio > 0.0 && cb.failure_ratio <= 1.0) {
            return invalid(format!(
                "failure_ratio must be in (0.0, 1.0], got {}",
                cb.failure_ratio
            ));
        }
        if cb.window_secs == 0 || cb.window_size == 0 {
            return invalid("circuit window must not be empty".to_string());
        }
        if !cb.cooldown_multiplier.is_finite() || cb.cooldown_multiplier < 1.0 {
            return invalid(format!(
                "cooldown_multiplier must be a finite number of at least 1.0, got {}",
                cb.cooldown_multiplier
            ));
        }
        if cb.max_cooldown_ms < cb.cooldown_ms {
            return invalid(format!(
                "max_cooldown_ms ({}) must not be below cooldown_ms ({})",
                cb.max_cooldown_ms, cb.cooldown_ms
            ));
        }

        let retry = &self.retry;
        if retry.max_attempts == 0 {
            return invalid("max_attempts must be at least 1".to_string());
        }
        if !retry.backoff_factor.is_finite() || retry.backoff_factor < 1.0 {
            return invalid(format!(
                "backoff_factor must be a finite number of at least 1.0, got {}",
                retry.backoff_factor
            ));
        }

        let batch = &self.batch;
        if batch.max_batch_size == 0 {
            return invalid("max_batch_size must be greater than 0".to_string());
        }
        if batch.weight == 0 {
            return invalid("batch weight must be greater than 0".to_string());
        }

        if self.deadline_ms == 0 {
            return invalid("deadline_ms must be greater than 0".to_string());
        }
        Ok(())
    }
}
