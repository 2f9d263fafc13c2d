//! Engine configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::ChatError;

// ----------------------------------------------------------------------------
// Configuration
// ----------------------------------------------------------------------------

/// Configuration shared by the host, scanner and connection engines
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatConfig {
    /// Local name advertised alongside the service UUID
    pub chat_name: String,
    /// Request link-layer encryption for the socket channel
    pub encrypted_socket: bool,
    /// Fixed read buffer used by the stream transport per read call
    pub read_buffer_size: usize,
    /// Outbound buffer capacity of a pumped byte channel
    pub write_buffer_size: usize,
    /// Largest framed message accepted from a peer
    pub max_frame_size: usize,
    /// Capacity of the broadcast channels behind each observable
    pub event_capacity: usize,
    /// Give up on a handshake that has not finished after this long
    pub handshake_timeout_ms: Option<u64>,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            chat_name: "nearchat".to_string(),
            encrypted_socket: true,
            read_buffer_size: 512,
            write_buffer_size: 4096,
            max_frame_size: 64 * 1024,
            event_capacity: 64,
            handshake_timeout_ms: Some(15_000),
        }
    }
}

impl ChatConfig {
    /// Create a new configuration with default settings
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the advertised chat name
    pub fn with_chat_name(mut self, name: impl Into<String>) -> Self {
        self.chat_name = name.into();
        self
    }

    /// Enable or disable socket encryption
    pub fn with_encrypted_socket(mut self, enabled: bool) -> Self {
        self.encrypted_socket = enabled;
        self
    }

    /// Set the stream transport read buffer size
    pub fn with_read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size;
        self
    }

    /// Set the pumped channel outbound capacity
    pub fn with_write_buffer_size(mut self, size: usize) -> Self {
        self.write_buffer_size = size;
        self
    }

    /// Set the maximum inbound frame size
    pub fn with_max_frame_size(mut self, size: usize) -> Self {
        self.max_frame_size = size;
        self
    }

    /// Set the observable channel capacity
    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    /// Set or clear the handshake timeout
    pub fn with_handshake_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.handshake_timeout_ms = timeout.map(|t| t.as_millis() as u64);
        self
    }

    /// Handshake timeout as a duration
    pub fn handshake_timeout(&self) -> Option<Duration> {
        self.handshake_timeout_ms.map(Duration::from_millis)
    }

    /// Check the configuration for values the engines cannot run with
    pub fn validate(&self) -> Result<(), ChatError> {
        if self.chat_name.is_empty() {
            return Err(ChatError::config_error("chat_name must not be empty"));
        }
        if self.read_buffer_size == 0 || self.write_buffer_size == 0 {
            return Err(ChatError::config_error("buffer sizes must be non-zero"));
        }
        if self.max_frame_size == 0 || self.max_frame_size > u32::MAX as usize {
            return Err(ChatError::config_error(
                "max_frame_size must fit a 32-bit length prefix",
            ));
        }
        if self.event_capacity == 0 {
            return Err(ChatError::config_error("event_capacity must be non-zero"));
        }
        if self.handshake_timeout_ms == Some(0) {
            return Err(ChatError::config_error(
                "handshake_timeout_ms must be positive; omit it to disable the timeout",
            ));
        }
        Ok(())
    }
}
