//! CLI module for revdb
//!
//! Provides command-line interface for:
//! - pull: One-shot pull of a remote database, JSON summary on stdout
//! - check-config: Validate a configuration file

mod args;
mod commands;
mod errors;
mod io;

pub use args::{Cli, Command};
pub use commands::{check_config, pull, pull_into, run_command, store_summary, Config};
pub use errors::{CliError, CliErrorCode, CliResult};
pub use io::{error_envelope, response_envelope, write_error, write_response};

use std::str::FromStr;

use crate::observability::{Logger, Severity};

/// Parse arguments, configure logging and run the command.
pub fn run() -> CliResult<()> {
    let cli = Cli::parse_args();
    let severity = Severity::from_str(&cli.log_level).map_err(CliError::config_error)?;
    Logger::set_min_severity(severity);

    let result = run_command(cli.command);
    if let Err(err) = &result {
        write_error(err.code_str(), err.message())?;
    }
    result
}
