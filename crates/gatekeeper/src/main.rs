//! Gatekeeper CLI binary.
//!
//! This binary provides command-line access to Gatekeeper's functionality:
//! - Inspect the resolved per-method policies
//! - Drive a simulated upstream to observe limiter, circuit and retry behaviour

use clap::Parser;

mod cli;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    use cli::{Cli, Commands, print_policies, run_simulation};

    // Parse command-line arguments
    let cli = Cli::parse();

    let log_level = if cli.verbose { "debug" } else { "info" };

    #[cfg(feature = "observability")]
    let observability = gatekeeper::observability::init_observability_with_config(
        gatekeeper::observability::ObservabilityConfig::default().with_log_level(log_level),
    )?;

    #[cfg(not(feature = "observability"))]
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(log_level))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    // Execute the requested command
    match cli.command {
        Commands::Policy { config, methods } => {
            print_policies(config.as_deref(), &methods)?;
        }

        Commands::Simulate(options) => {
            run_simulation(options).await?;
        }
    }

    #[cfg(feature = "observability")]
    observability.shutdown();

    Ok(())
}
