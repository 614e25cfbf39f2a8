//! Command-line interface definitions using clap.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use tusk::config::CONFIG_FILE;
use tusk::version;

/// Application server that runs PHP workers behind an HTTP gateway.
#[derive(Parser, Debug)]
#[command(name = "tusk")]
#[command(author, about, long_about = None)]
#[command(version = version::clap_version(), long_version = version::long_version())]
pub struct Cli {
    /// Path to the project configuration file.
    #[arg(long, env = "TUSK_CONFIG", default_value = CONFIG_FILE, global = true)]
    pub config: PathBuf,

    /// Enable verbose output (-v for debug, -vv for trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress all output except errors.
    #[arg(short, long, conflicts_with = "verbose", global = true)]
    pub quiet: bool,

    /// Disable colored output.
    #[arg(long, env = "NO_COLOR", global = true)]
    pub no_color: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available subcommands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the worker pool and the HTTP gateway.
    #[command(visible_alias = "dev")]
    Start(StartArgs),

    /// Show the resolved PHP runtime and worker entry point.
    Setup,

    /// Write a default configuration file.
    Init,
}

/// Arguments for the start command.
#[derive(Parser, Debug, Default)]
pub struct StartArgs {
    /// Worker script to run (overrides `worker_command`; must be a .php file).
    pub worker_file: Option<PathBuf>,

    /// Port to listen on.
    #[arg(short, long, env = "TUSK_PORT")]
    pub port: Option<u16>,

    /// Address to bind.
    #[arg(short, long, env = "TUSK_ADDRESS")]
    pub address: Option<String>,

    /// Number of worker processes.
    #[arg(short, long, env = "TUSK_WORKERS")]
    pub workers: Option<usize>,
}
