//! CLI-specific error types
//!
//! Every CLI error ends the process with a non-zero exit code.

use std::io;

use thiserror::Error;

use crate::replication::ReplicationError;
use crate::store::StoreError;

/// CLI error codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CliErrorCode {
    /// Configuration file missing or invalid
    ConfigError,
    /// I/O error (files, stdout)
    IoError,
    /// Store could not be opened or failed fatally
    StoreError,
    /// Pull ended with an error
    ReplicationFailed,
    /// Async runtime could not start
    RuntimeError,
}

impl CliErrorCode {
    /// Get the error code string
    pub fn code(&self) -> &'static str {
        match self {
            Self::ConfigError => "REV_CLI_CONFIG_ERROR",
            Self::IoError => "REV_CLI_IO_ERROR",
            Self::StoreError => "REV_CLI_STORE_ERROR",
            Self::ReplicationFailed => "REV_CLI_REPLICATION_FAILED",
            Self::RuntimeError => "REV_CLI_RUNTIME_ERROR",
        }
    }
}

/// CLI error
#[derive(Debug, Error)]
#[error("{}: {message}", .code.code())]
pub struct CliError {
    code: CliErrorCode,
    message: String,
}

impl CliError {
    pub fn new(code: CliErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn config_error(msg: impl Into<String>) -> Self {
        Self::new(CliErrorCode::ConfigError, msg)
    }

    pub fn io_error(msg: impl Into<String>) -> Self {
        Self::new(CliErrorCode::IoError, msg)
    }

    pub fn replication_failed(msg: impl Into<String>) -> Self {
        Self::new(CliErrorCode::ReplicationFailed, msg)
    }

    pub fn runtime_error(msg: impl Into<String>) -> Self {
        Self::new(CliErrorCode::RuntimeError, msg)
    }

    /// Get the error code
    pub fn code(&self) -> CliErrorCode {
        self.code
    }

    /// Get the error code string
    pub fn code_str(&self) -> &'static str {
        self.code.code()
    }

    /// Get the error message
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<io::Error> for CliError {
    fn from(e: io::Error) -> Self {
        Self::io_error(e.to_string())
    }
}

impl From<serde_json::Error> for CliError {
    fn from(e: serde_json::Error) -> Self {
        Self::io_error(format!("JSON error: {}", e))
    }
}

impl From<StoreError> for CliError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Config(msg) => Self::config_error(msg),
            other => Self::new(CliErrorCode::StoreError, format!("{}: {}", other.code(), other)),
        }
    }
}

impl From<ReplicationError> for CliError {
    fn from(e: ReplicationError) -> Self {
        match e {
            ReplicationError::Config(msg) => Self::config_error(msg),
            other => Self::replication_failed(format!("{}: {}", other.code(), other)),
        }
    }
}

/// CLI result type
pub type CliResult<T> = Result<T, CliError>;
