//! Error handling for the nearchat CLI

use nearchat_core::{ChatError, ConnectError, RadioError};
use thiserror::Error;

/// CLI-specific error types
#[derive(Error, Debug)]
pub enum CliError {
    #[error("nearchat error: {0}")]
    Chat(#[from] ChatError),

    #[error("Connect failed: {0}")]
    Connect(#[from] ConnectError),

    #[error("Radio error: {0}")]
    Radio(#[from] RadioError),

    #[error("Backend not available: {0}")]
    BackendUnavailable(String),

    #[error("No chat found within {0} seconds")]
    NoHostFound(u64),

    #[error("Timed out {0}")]
    Timeout(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    TomlParsing(#[from] toml::de::Error),
}

/// Result type for CLI operations
pub type Result<T> = std::result::Result<T, CliError>;
