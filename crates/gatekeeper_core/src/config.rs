//! Configuration loading.
//!
//! Policies are read from TOML through the `config` crate. Sources, in
//! increasing precedence:
//! - Bundled defaults (include_str! from gatekeeper.toml)
//! - `~/.config/gatekeeper/gatekeeper.toml`
//! - `./gatekeeper.toml`
//!
//! Later sources override earlier ones table by table; the `[[methods]]`
//! array is replaced as a whole by the highest-precedence source that
//! defines it.

use crate::{BatchPolicy, CircuitPolicy, MethodPolicy, RateLimitPolicy, RetryPolicy};
use config::{Config, File, FileFormat};
use derive_getters::Getters;
use gatekeeper_error::{ConfigError, ConfigErrorKind, GatekeeperError, GatekeeperResult};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

/// Policies applied to every method without an override.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Getters)]
pub struct Defaults {
    /// Dispatch deadline in milliseconds
    #[serde(default = "default_deadline_ms")]
    deadline_ms: u64,

    /// Token bucket limits
    #[serde(default)]
    rate_limit: RateLimitPolicy,

    /// Circuit breaker settings
    #[serde(default)]
    circuit: CircuitPolicy,

    /// Retry settings
    #[serde(default)]
    retry: RetryPolicy,

    /// Batch window settings
    #[serde(default)]
    batch: BatchPolicy,
}

fn default_deadline_ms() -> u64 {
    10_000
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            deadline_ms: default_deadline_ms(),
            rate_limit: RateLimitPolicy::default(),
            circuit: CircuitPolicy::default(),
            retry: RetryPolicy::default(),
            batch: BatchPolicy::default(),
        }
    }
}

/// Method-specific overrides.
///
/// All fields are optional - only specified fields override the defaults.
///
/// # Example
///
/// ```toml
/// [[methods]]
/// name = "friends.get"
/// capacity = 3
/// refill_per_sec = 3.0
/// failure_threshold = 5
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct MethodOverrides {
    /// Upstream method name
    pub name: String,

    /// Bucket capacity (overrides default)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capacity: Option<u32>,

    /// Refill rate per second (overrides default)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refill_per_sec: Option<f64>,

    /// Maximum admission wait (overrides default)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_wait_ms: Option<u64>,

    /// Failures needed to open the circuit (overrides default)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_threshold: Option<u32>,

    /// Failure ratio that opens the circuit (overrides default)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_ratio: Option<f64>,

    /// Circuit window length (overrides default)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window_secs: Option<u64>,

    /// Open-state cooldown (overrides default)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cooldown_ms: Option<u64>,

    /// Total attempts (overrides default)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,

    /// Batch coalescing window (overrides default)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_window_ms: Option<u64>,

    /// Batch size flush threshold (overrides default)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_batch_size: Option<usize>,

    /// Rate-limit units per flushed batch (overrides default)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_weight: Option<u32>,

    /// Dispatch deadline (overrides default)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline_ms: Option<u64>,
}

/// Top-level Gatekeeper configuration.
///
/// # Example
///
/// ```no_run
/// use gatekeeper_core::GatekeeperConfig;
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let config = GatekeeperConfig::load()?;
/// let policy = config.for_method("friends.get");
/// println!("friends.get capacity: {}", policy.rate_limit().capacity());
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct GatekeeperConfig {
    /// Policies for methods without overrides
    #[serde(default)]
    pub defaults: Defaults,

    /// Per-method overrides
    #[serde(default)]
    pub methods: Vec<MethodOverrides>,
}

impl GatekeeperConfig {
    /// Load configuration from a specific file path.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    #[instrument(skip(path), fields(path = %path.as_ref().display()))]
    pub fn from_file(path: impl AsRef<std::path::Path>) -> GatekeeperResult<Self> {
        debug!("Loading configuration from file");

        let config: Self = Config::builder()
            .add_source(File::from(path.as_ref()))
            .build()
            .map_err(|e| {
                GatekeeperError::from(ConfigError::unreadable(format!(
                    "{}: {}",
                    path.as_ref().display(),
                    e
                )))
            })?
            .try_deserialize()
            .map_err(|e| {
                GatekeeperError::from(ConfigError::malformed(e.to_string()))
            })?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration with precedence: current dir > home dir > bundled defaults.
    ///
    /// User config files are optional and silently skipped if not found.
    ///
    /// # Errors
    ///
    /// Returns an error if a present file cannot be parsed or the merged
    /// configuration is invalid.
    #[instrument]
    pub fn load() -> GatekeeperResult<Self> {
        debug!("Loading configuration with precedence: current dir > home dir > bundled defaults");

        const DEFAULT_CONFIG: &str = include_str!("../../../gatekeeper.toml");

        let mut builder =
            Config::builder().add_source(File::from_str(DEFAULT_CONFIG, FileFormat::Toml));

        if let Some(home) = dirs::home_dir() {
            let home_config = home.join(".config/gatekeeper/gatekeeper.toml");
            builder = builder.add_source(File::from(home_config).required(false));
        }

        builder = builder.add_source(File::with_name("gatekeeper").required(false));

        let config: Self = builder
            .build()
            .map_err(|e| {
                GatekeeperError::from(ConfigError::unreadable(e.to_string()))
            })?
            .try_deserialize()
            .map_err(|e| {
                GatekeeperError::from(ConfigError::malformed(e.to_string()))
            })?;

        config.validate()?;
        Ok(config)
    }

    /// Resolve the policy set for `method`, applying its overrides.
    pub fn for_method(&self, method: &str) -> MethodPolicy {
        let d = &self.defaults;
        let Some(o) = self.methods.iter().find(|o| o.name == method) else {
            return MethodPolicy::new(
                method,
                d.rate_limit.clone(),
                d.circuit.clone(),
                d.retry.clone(),
                d.batch.clone(),
                d.deadline_ms,
            );
        };

        let rate_limit = RateLimitPolicy {
            capacity: o.capacity.unwrap_or(d.rate_limit.capacity),
            refill_per_sec: o.refill_per_sec.unwrap_or(d.rate_limit.refill_per_sec),
            max_wait_ms: o.max_wait_ms.unwrap_or(d.rate_limit.max_wait_ms),
        };

        let circuit = CircuitPolicy {
            failure_threshold: o.failure_threshold.unwrap_or(d.circuit.failure_threshold),
            failure_ratio: o.failure_ratio.unwrap_or(d.circuit.failure_ratio),
            window_secs: o.window_secs.unwrap_or(d.circuit.window_secs),
            cooldown_ms: o.cooldown_ms.unwrap_or(d.circuit.cooldown_ms),
            ..d.circuit.clone()
        };

        let retry = RetryPolicy {
            max_attempts: o.max_attempts.unwrap_or(d.retry.max_attempts),
            ..d.retry.clone()
        };

        let batch = BatchPolicy {
            window_ms: o.batch_window_ms.unwrap_or(d.batch.window_ms),
            max_batch_size: o.max_batch_size.unwrap_or(d.batch.max_batch_size),
            weight: o.batch_weight.unwrap_or(d.batch.weight),
        };

        MethodPolicy::new(
            method,
            rate_limit,
            circuit,
            retry,
            batch,
            o.deadline_ms.unwrap_or(d.deadline_ms),
        )
    }

    /// Validate the defaults and every method override.
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` naming the first invalid value.
    pub fn validate(&self) -> GatekeeperResult<()> {
        self.for_method("<defaults>").validate()?;

        for overrides in &self.methods {
            if overrides.name.is_empty() {
                return Err(ConfigError::new(ConfigErrorKind::UnnamedOverride).into());
            }
            self.for_method(&overrides.name).validate()?;
        }
        Ok(())
    }
}
