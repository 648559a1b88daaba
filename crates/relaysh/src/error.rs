//! Error types for the relaysh controller

use relaysh_proto::ProtocolError;
use thiserror::Error;

use crate::session::SessionId;

/// Main error type for controller operations
#[derive(Debug, Error)]
pub enum RelayError {
    /// The operator referenced a session that is not registered
    #[error("No agent with id {0}")]
    UnknownSessionId(SessionId),

    /// An operator command was missing or had malformed arguments
    #[error("Malformed command: {0}")]
    MalformedCommand(String),

    /// An agent's registration block was missing or malformed
    #[error("Invalid registration: {0}")]
    Registration(String),

    /// A session's stream failed
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    /// The listening socket could not be bound
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        /// Address that was requested
        addr: String,
        /// Underlying failure
        #[source]
        source: std::io::Error,
    },

    /// Configuration could not be loaded
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<ProtocolError> for RelayError {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::ConnectionLost(msg) => Self::ConnectionLost(msg),
            other => Self::ConnectionLost(other.to_string()),
        }
    }
}

impl RelayError {
    /// Build a bind error for the requested address
    pub fn bind(addr: impl Into<String>, source: std::io::Error) -> Self {
        Self::Bind {
            addr: addr.into(),
            source,
        }
    }
}
