//! Command-line interface definitions and parsing

use clap::{Parser, Subcommand};

use crate::config::Backend;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Configuration file path
    #[arg(short, long)]
    pub config: Option<String>,

    /// Radio backend, overriding the configuration file
    #[arg(long, value_enum)]
    pub backend: Option<Backend>,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Commands {
    /// Host a chat and wait for a guest to join
    Host {
        /// Name advertised to nearby guests
        #[arg(short, long)]
        name: Option<String>,
    },
    /// Join the first nearby chat that matches
    Join {
        /// Only join a chat whose name contains this text
        #[arg(short, long)]
        name: Option<String>,
        /// Give up scanning after this many seconds
        #[arg(long, default_value_t = 30)]
        timeout_secs: u64,
    },
    /// Run a host and a guest on the simulated radio in one process
    Demo,
}
