//! layersync: versioned geospatial layer updates.
//!
//! # Usage
//!
//! ```text
//! layersync run <layer>
//! layersync run --due [--day N]
//! layersync due [--day N]
//! layersync status [--json]
//! layersync store init <destination> --wkid N [--unique-field F]
//! layersync store versions
//! layersync store drop-version <name>
//! ```

mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};

use commands::{due::DueArgs, run::RunArgs, status::StatusArgs, store::StoreCommand};

// ---------------------------------------------------------------------------
// CLI entry point
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(
    name = "layersync",
    version,
    about = "Update versioned geospatial layers and propagate the results",
    long_about = None,
)]
struct Cli {
    /// Log at debug level (overridden by RUST_LOG).
    #[arg(long, short = 'v', global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the update pipeline for one layer, or every layer due today.
    Run(RunArgs),

    /// List layers scheduled for a day of the month.
    Due(DueArgs),

    /// Show the latest run of every registered layer.
    Status(StatusArgs),

    /// Manage the file-backed versioned store.
    Store {
        #[command(subcommand)]
        command: StoreCommand,
    },
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    match cli.command {
        Commands::Run(args) => args.run(),
        Commands::Due(args) => args.run(),
        Commands::Status(args) => args.run(),
        Commands::Store { command } => commands::store::run(command),
    }
}

fn init_tracing(verbose: bool) {
    use tracing_subscriber::{fmt, EnvFilter};

    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}
