//! CLI error type.

use std::fmt;

use envmount::config::ConfigError;
use envmount::dynload::DylinkError;
use envmount::package::LockError;
use envmount::stream::StreamError;

/// Errors reported by CLI commands.
#[derive(Debug)]
pub enum CliError {
    /// Configuration could not be read or written.
    Config(String),
    /// A lock file could not be loaded.
    Lock(LockError),
    /// A file could not be read.
    Read { path: String, reason: String },
    /// A library had no usable dylink metadata.
    Dylink { path: String, source: DylinkError },
    /// Remote image access failed.
    Stream(StreamError),
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CliError::Config(msg) => write!(f, "Configuration error: {}", msg),
            CliError::Lock(e) => write!(f, "Lock file error: {}", e),
            CliError::Read { path, reason } => write!(f, "Failed to read {}: {}", path, reason),
            CliError::Dylink { path, source } => write!(f, "{}: {}", path, source),
            CliError::Stream(e) => write!(f, "Stream error: {}", e),
        }
    }
}

impl std::error::Error for CliError {}

impl From<ConfigError> for CliError {
    fn from(e: ConfigError) -> Self {
        CliError::Config(e.to_string())
    }
}

impl From<LockError> for CliError {
    fn from(e: LockError) -> Self {
        CliError::Lock(e)
    }
}

impl From<StreamError> for CliError {
    fn from(e: StreamError) -> Self {
        CliError::Stream(e)
    }
}
