//! CLI argument definitions using clap
//!
//! Commands:
//! - revdb pull --config <path>
//! - revdb check-config --config <path>

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// revdb - multi-version document store with pull replication
#[derive(Parser, Debug)]
#[command(name = "revdb")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Lowest log severity written to stdout/stderr
    #[arg(long, global = true, default_value = "info")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Pull a remote database into a fresh store and print a summary
    Pull {
        /// Path to configuration file
        #[arg(long, default_value = "./revdb.json")]
        config: PathBuf,
    },

    /// Validate a configuration file and print it with secrets masked
    CheckConfig {
        /// Path to configuration file
        #[arg(long, default_value = "./revdb.json")]
        config: PathBuf,
    },
}

impl Cli {
    /// Parse command line arguments
    pub fn parse_args() -> Self {
        Cli::parse()
    }
}
