//! The statsdaemon binary.

use std::path::PathBuf;
use std::process;

use clap::Parser;
use statsdaemon::config::Configuration;
use statsdaemon::logging::initialize_logging;
use statsdaemon::StatsDaemon;
use tracing::{error, info};

/// StatsD-protocol metric aggregation daemon.
#[derive(Parser)]
#[command(name = "statsdaemon", version, about)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(e) = initialize_logging() {
        eprintln!("failed to initialize logging: {}", e);
        process::exit(1);
    }

    let configuration = match Configuration::load(cli.config.as_deref()) {
        Ok(configuration) => configuration,
        Err(e) => {
            error!("{}", e);
            process::exit(1);
        }
    };

    match StatsDaemon::new(configuration).run().await {
        Ok(()) => info!("statsdaemon stopped."),
        Err(e) => {
            error!("{:?}", e);
            process::exit(1);
        }
    }
}
