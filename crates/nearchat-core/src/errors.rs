//! Error types for the nearchat protocol
//!
//! Radio failures, stream and framing failures, the caller-facing connect
//! taxonomy, and the `ChatError` type that unifies them.

use thiserror::Error;
use uuid::Uuid;

use crate::types::{PeerIdentity, ScannerState};

// ----------------------------------------------------------------------------
// Specific Error Types
// ----------------------------------------------------------------------------

/// Failures reported by the radio stack
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RadioError {
    #[error("Radio is powered off")]
    PoweredOff,

    #[error("Radio use is not authorised")]
    Unauthorized,

    #[error("Peer is not connected")]
    NotConnected,

    #[error("Attribute not found: {uuid}")]
    AttributeNotFound { uuid: Uuid },

    #[error("Radio operation timed out")]
    Timeout,

    #[error("Radio error: {0}")]
    Platform(String),
}

/// Failures decoding the socket channel's framed byte stream
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FramingError {
    #[error("Frame too large: {size} bytes (max: {max})")]
    FrameTooLarge { size: usize, max: usize },
}

/// Failures of a socket channel's byte stream
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("Stream I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Write made no progress after {written} bytes, {remaining} bytes aborted")]
    Stalled { written: usize, remaining: usize },

    #[error("Stream is closed")]
    Closed,

    #[error("Framing error: {0}")]
    Framing(#[from] FramingError),
}

/// Outcome of a failed `connect` request
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConnectError {
    #[error("Cannot connect while scanner is {state}")]
    InvalidState { state: ScannerState },

    #[error("Unknown peripheral: {identity}")]
    UnknownPeripheral { identity: PeerIdentity },

    #[error("Connection failed: {reason}")]
    ConnectionFailure { reason: String },

    #[error("Radio error: {0}")]
    Radio(#[from] RadioError),
}

impl ConnectError {
    pub fn connection_failure<T: Into<String>>(reason: T) -> Self {
        ConnectError::ConnectionFailure {
            reason: reason.into(),
        }
    }
}

/// Protocol-level status answered to a remote attribute request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttStatus {
    Success,
    InvalidOffset,
    ReadNotPermitted,
    WriteNotPermitted,
    RequestNotSupported,
    UnlikelyError,
}

impl AttStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, AttStatus::Success)
    }
}

// ----------------------------------------------------------------------------
// Unified Error
// ----------------------------------------------------------------------------

/// Core error type for nearchat
#[derive(Debug, Error)]
pub enum ChatError {
    #[error("Radio error: {0}")]
    Radio(#[from] RadioError),

    #[error("Stream error: {0}")]
    Stream(#[from] StreamError),

    #[error("Framing error: {0}")]
    Framing(#[from] FramingError),

    #[error("Connect error: {0}")]
    Connect(#[from] ConnectError),

    /// Engine mailbox or observable channel closed
    #[error("Channel error: {message}")]
    Channel { message: String },

    #[error("Configuration error: {reason}")]
    Configuration { reason: String },
}

// ----------------------------------------------------------------------------
// Convenience Error Constructors
// ----------------------------------------------------------------------------

impl ChatError {
    /// Create a channel error with a message
    pub fn channel_error<T: Into<String>>(message: T) -> Self {
        ChatError::Channel {
            message: message.into(),
        }
    }

    /// Create a configuration error with a reason
    pub fn config_error<T: Into<String>>(reason: T) -> Self {
        ChatError::Configuration {
            reason: reason.into(),
        }
    }
}

// ----------------------------------------------------------------------------
// Type Aliases
// ----------------------------------------------------------------------------

pub type Result<T> = core::result::Result<T, ChatError>;
