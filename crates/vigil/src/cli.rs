//! Command-line interface definitions

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(author, version, about = "VPN tunnel control plane tools", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the connection tester against a live interface
    Probe {
        /// Tunnel interface to test through
        #[arg(short, long)]
        interface: String,
        /// Stop after this many results
        #[arg(short = 'n', long, default_value_t = 4)]
        count: usize,
        /// Settings file (TOML)
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// Show which server each selection method picks
    Servers {
        /// Server list (.toml or .json)
        file: PathBuf,
        /// Avoid this server
        #[arg(long, conflicts_with = "prefer")]
        avoid: Option<String>,
        /// Prefer this server
        #[arg(long)]
        prefer: Option<String>,
    },
    /// Print the default settings as TOML
    Defaults,
}
