//! CLI definitions for Vigil.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Vigil CLI.
#[derive(Parser)]
#[command(name = "vigil")]
#[command(about = "Dependency health monitor with automated recovery and alerting")]
#[command(version)]
pub(crate) struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "config/default.toml", global = true, env = "VIGIL_CONFIG")]
    pub config: PathBuf,

    /// Directory for daily-rotated log files (console only when omitted)
    #[arg(long, global = true, env = "VIGIL_LOG_DIR")]
    pub log_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub(crate) enum Commands {
    /// Run the monitor and its HTTP surface in foreground (default)
    Run {
        /// Override the configured host
        #[arg(long)]
        host: Option<String>,

        /// Override the configured port
        #[arg(long)]
        port: Option<u16>,
    },

    /// Probe every configured service once and print the results as JSON
    Check {
        /// Only check this service
        #[arg(long)]
        service: Option<String>,
    },

    /// Load and validate the configuration, then exit
    Validate,
}
