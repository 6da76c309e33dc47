//! Command line argument parsing.
//!
//! Subcommands:
//! - `drain`: run-once mode, process a backlog file then stop
//! - `run`: continuous mode, poll a spool directory for task packets
//! - `check`: validate configuration and probe provider availability
//! - `show-config`: print the effective configuration

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "foreman")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Routes task packets to execution backends with failover and load-aware selection")]
#[command(arg_required_else_help = true)]
pub struct Args {
    /// Configuration file path (default: ./foreman.toml, ~/.foreman/config.toml)
    #[arg(short = 'c', long = "config", global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Process a backlog file of task packets, then stop
    Drain {
        /// JSON file containing an array of task packets
        backlog: PathBuf,
    },
    /// Keep cycling: poll a spool directory for task packet files
    Run {
        /// Directory containing `*.json` task packet files
        spool: PathBuf,
    },
    /// Validate the configuration and probe each provider
    Check,
    /// Print the effective configuration
    ShowConfig,
}
