//! Command-line interface module.
//!
//! This module provides the CLI structure and command handlers for the gatekeeper binary.

mod commands;
mod policy;
mod simulate;

pub use commands::{Cli, Commands, SimulateOptions};
pub use policy::{load_config, print_policies};
pub use simulate::run_simulation;
