//! Error types for protocol operations

use thiserror::Error;

/// Protocol-specific errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The peer closed the stream or an I/O operation on it failed
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    /// An outbound message contained the framing delimiter
    #[error("Message contains an embedded newline")]
    EmbeddedNewline,

    /// The registration block did not follow the expected layout
    #[error("Malformed registration: {0}")]
    MalformedRegistration(String),
}

impl ProtocolError {
    /// Build a `ConnectionLost` error from an I/O failure
    pub fn lost(err: std::io::Error) -> Self {
        Self::ConnectionLost(err.to_string())
    }

    /// Whether this error means the underlying stream is unusable
    pub fn is_connection_lost(&self) -> bool {
        matches!(self, Self::ConnectionLost(_))
    }
}
