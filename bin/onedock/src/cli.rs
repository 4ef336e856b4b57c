use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Single-host container orchestrator with per-port reverse proxies
#[derive(Parser)]
#[command(name = "onedock")]
#[command(version, about = "Single-host container orchestrator")]
pub(crate) struct Cli {
    /// Path to the YAML configuration file
    #[arg(short, long, global = true)]
    pub(crate) config: Option<PathBuf>,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub(crate) verbose: u8,

    #[command(subcommand)]
    pub(crate) command: Commands,
}

/// CLI subcommands
#[derive(Subcommand)]
pub(crate) enum Commands {
    /// Run the daemon: recover proxies, then serve the management API
    Serve {
        /// Override the configured listen address
        #[arg(long)]
        listen: Option<String>,
    },
}
