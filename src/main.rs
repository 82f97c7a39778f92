// src/main.rs — sciloop entry point

use clap::Parser;

use sciloop::cli::{Cli, Commands, RunArgs};
use sciloop::infra::config::Config;
use sciloop::infra::logger;

#[tokio::main]
async fn main() {
    // Initialize logging (respects RUST_LOG / SCILOOP_LOG)
    logger::init_logging("warn");

    if let Err(e) = run().await {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load config (falls back to defaults if no config.toml)
    let config = if let Some(ref path) = cli.config {
        Config::load_from(std::path::Path::new(path))?
    } else {
        Config::load()?
    };

    match cli.command {
        Some(Commands::Run(args)) => sciloop::cli::run::run_cycles(&config, &args).await,
        Some(Commands::Status { history }) => {
            sciloop::cli::status::show_status(&config, history).await
        }
        Some(Commands::Front { stratum, json }) => {
            sciloop::cli::report::show_front(&config, stratum.as_deref(), json).await
        }
        Some(Commands::Insights { cycle, limit }) => {
            sciloop::cli::report::show_insights(&config, cycle, limit).await
        }
        None => sciloop::cli::run::run_cycles(&config, &RunArgs::default()).await,
    }
}
