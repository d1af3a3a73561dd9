//! CLI for gpucorr
//!
//! Commands:
//! - simulate: Drive a synthetic multi-threaded GPU workload through the
//!   correlation pipeline and report where its metrics landed

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod commands;
mod output;

#[derive(Parser)]
#[command(name = "gpucorr")]
#[command(about = "gpucorr - GPU activity correlation pipeline", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a synthetic workload through the correlation engine
    Simulate(commands::simulate::SimulateArgs),
}

fn main() -> Result<()> {
    color_eyre::install().map_err(|e| anyhow::anyhow!("{}", e))?;

    let cli = Cli::parse();

    match cli.command {
        Commands::Simulate(args) => {
            init_tracing(args.verbose);
            commands::simulate::run(args)
        }
    }
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();
}
