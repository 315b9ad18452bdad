//! Watershed Mosaic CLI - batch watersheds, run models, stitch mosaics.

mod commands;
mod error;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::info;
use watershed_mosaic::logging::{default_log_dir, default_log_file, init_logging};

use crate::error::CliError;

#[derive(Parser)]
#[command(name = "watershed-mosaic")]
#[command(version = watershed_mosaic::VERSION)]
#[command(about = "Run watershed models in batches and stitch their outputs into global mosaics", long_about = None)]
struct Cli {
    /// Directory for the log file
    #[arg(long, global = true, default_value = default_log_dir())]
    log_dir: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Group watersheds into batches and print the plan
    Batch {
        /// Scenario config files or glob patterns
        #[arg(required = true)]
        configs: Vec<String>,

        /// Minimum batch area, overriding the scenario files
        #[arg(long)]
        min_area: Option<f64>,
    },

    /// Batch, then run every enabled model of each scenario
    Run {
        /// Scenario config files or glob patterns
        #[arg(required = true)]
        configs: Vec<String>,

        /// Minimum batch area, overriding the scenario files
        #[arg(long)]
        min_area: Option<f64>,
    },
}

fn main() {
    let cli = Cli::parse();

    let _guard = match init_logging(&cli.log_dir, default_log_file()) {
        Ok(guard) => guard,
        Err(e) => CliError::LoggingInit(e).exit(),
    };
    info!(version = watershed_mosaic::VERSION, "watershed-mosaic starting");

    let result = match cli.command {
        Commands::Batch { configs, min_area } => {
            commands::batch::run(commands::batch::BatchArgs { configs, min_area })
        }
        Commands::Run { configs, min_area } => {
            commands::run::run(commands::run::RunArgs { configs, min_area })
        }
    };

    if let Err(e) = result {
        e.exit();
    }
}
