//! CLI argument definitions using clap derive

use clap::{ArgAction, Parser, Subcommand};
use std::path::PathBuf;

/// jobserver - shared package resolution for concurrent builds
///
/// Runs a job server that resolves each package once per build and answers
/// every compiler process that asks for it.
#[derive(Parser, Debug)]
#[command(name = "jobserver")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Increase verbosity (-v info, -vv debug)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,

    /// Configuration file path
    #[arg(short, long, global = true, env = "JOBSERVER_CONFIG")]
    pub config: Option<PathBuf>,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start a job server and serve until interrupted
    Serve(ServeArgs),

    /// Resolve one package through a running job server
    Resolve(ResolveArgs),

    /// Show cache statistics of a running job server
    Stats(StatsArgs),
}

/// Arguments for the serve command
#[derive(Parser, Debug)]
pub struct ServeArgs {
    /// Address to listen on (overrides server.listen)
    #[arg(short, long)]
    pub listen: Option<String>,
}

/// Arguments for the resolve command
#[derive(Parser, Debug)]
pub struct ResolveArgs {
    /// Job server URL
    #[arg(long, env = "JOBSERVER_URL")]
    pub url: String,

    /// Target operating system (defaults to the host)
    #[arg(long)]
    pub goos: Option<String>,

    /// Target architecture (defaults to the host)
    #[arg(long)]
    pub goarch: Option<String>,

    /// Build tag (repeatable)
    #[arg(short, long = "tag")]
    pub tags: Vec<String>,

    /// Directory to resolve from
    #[arg(short, long)]
    pub dir: Option<PathBuf>,

    /// Seconds to wait for the result (overrides server.request_timeout_secs)
    #[arg(long)]
    pub timeout: Option<u64>,

    /// Import path of the package to resolve
    pub import_path: String,
}

/// Arguments for the stats command
#[derive(Parser, Debug)]
pub struct StatsArgs {
    /// Job server URL
    #[arg(long, env = "JOBSERVER_URL")]
    pub url: String,

    /// Print the raw JSON report
    #[arg(long)]
    pub json: bool,
}
