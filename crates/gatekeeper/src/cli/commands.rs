//! CLI command definitions.

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// Gatekeeper - resilience layer for rate-limited upstream APIs
#[derive(Parser, Debug)]
#[command(name = "gatekeeper")]
#[command(about = "Inspect and exercise upstream resilience policies", long_about = None)]
#[command(version)]
pub struct Cli {
    /// Command to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Print the resolved policies as JSON
    Policy {
        /// Configuration file (default: layered gatekeeper.toml lookup)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Methods to resolve (default: every configured method)
        methods: Vec<String>,
    },

    /// Drive concurrent calls against a simulated upstream
    Simulate(SimulateOptions),
}

/// Options for the simulate command
#[derive(Args, Debug, Clone)]
pub struct SimulateOptions {
    /// Configuration file (default: layered gatekeeper.toml lookup)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Upstream method to call
    #[arg(long, default_value = "friends.get")]
    pub method: String,

    /// Number of concurrent calls
    #[arg(long, default_value = "10")]
    pub calls: u64,

    /// Fraction of upstream attempts that fail with HTTP 503 (0.0 - 1.0)
    #[arg(long, default_value = "0.0")]
    pub failure_rate: f64,

    /// Simulated upstream latency per dispatch
    #[arg(long, default_value = "50")]
    pub latency_ms: u64,

    /// Submit calls as batchable sub-requests
    #[arg(long)]
    pub batch: bool,
}
