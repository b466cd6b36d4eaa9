//! Command-line surface of the agent binary.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "warden-agent", about = "Warden endpoint agent", version)]
pub struct Cli {
    /// Base configuration file.
    #[arg(long, default_value = "/etc/warden/warden.yml")]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the agent in the foreground (default).
    Run,
    /// Ask a running agent to reload its modules.
    Reload {
        /// Reload only the named module.
        #[arg(long)]
        module: Option<String>,
    },
    /// Check whether a local agent is listening.
    Status,
}
