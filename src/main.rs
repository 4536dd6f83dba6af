//! jobserver - shared package resolution for concurrent builds
//!
//! CLI entry point that dispatches to subcommands.

use clap::Parser;
use console::style;
use jobserver::cli::{Cli, Commands};
use jobserver::config::ConfigManager;
use jobserver::error::JobServerResult;
use std::process::ExitCode;
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{} {}", style("Error:").red().bold(), e);
            if let Some(hint) = e.hint() {
                eprintln!("{} {}", style("Hint:").yellow(), hint);
            }
            ExitCode::FAILURE
        }
    }
}

async fn run() -> JobServerResult<()> {
    let cli = Cli::parse();

    let config_manager = match cli.config {
        Some(ref path) => ConfigManager::with_path(path.clone()),
        None => ConfigManager::new(),
    };
    let config = config_manager.load().await?;

    // 0 = warn, 1 = info, 2+ = debug
    let filter = match cli.verbose {
        0 => EnvFilter::new("jobserver=warn"),
        1 => EnvFilter::new("jobserver=info"),
        _ => EnvFilter::new("jobserver=debug"),
    };
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);
    if config.general.json_logs() {
        subscriber.json().init();
    } else {
        subscriber.without_time().init();
    }
    debug!("Using config {}", config_manager.path().display());

    match cli.command {
        Commands::Serve(args) => jobserver::cli::commands::serve(args, &config).await,
        Commands::Resolve(args) => jobserver::cli::commands::resolve(args, &config).await,
        Commands::Stats(args) => jobserver::cli::commands::stats(args, &config).await,
    }
}
