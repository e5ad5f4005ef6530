//! Core data types for the Gatekeeper upstream resilience layer.
//!
//! This crate provides the types shared by every component: the call
//! descriptor handed in by business code, the write-once outcome record,
//! the explicit call phase model, circuit states, and the policy
//! configuration loaded from TOML.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod circuit_state;
mod config;
mod descriptor;
mod outcome;
mod phase;
mod policy;

pub use circuit_state::CircuitState;
pub use config::{Defaults, GatekeeperConfig, MethodOverrides};
pub use descriptor::CallDescriptor;
pub use outcome::OutcomeRecord;
pub use phase::{CallPhase, PhaseEvent, PhaseObserver};
pub use policy::{
    BatchPolicy, BatchPolicyBuilder, CircuitPolicy, CircuitPolicyBuilder, MethodPolicy,
    RateLimitPolicy, RateLimitPolicyBuilder, RetryPolicy, RetryPolicyBuilder,
};
