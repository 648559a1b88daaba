//! Error types for the agent

use relaysh_proto::ProtocolError;
use thiserror::Error;

/// Agent errors. None of them stop the agent; the reconnect loop absorbs them.
#[derive(Debug, Error)]
pub enum AgentError {
    /// The controller could not be reached
    #[error("Failed to reach controller at {addr}: {reason}")]
    Dial {
        /// Address that was dialed
        addr: String,
        /// Why the dial failed
        reason: String,
    },

    /// Reading from or writing to the controller failed
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// The command interpreter could not be started
    #[error("Failed to spawn command: {0}")]
    Spawn(String),

    /// Configuration could not be loaded
    #[error("Configuration error: {0}")]
    Config(String),
}

impl AgentError {
    /// Whether the control connection is gone
    pub fn is_connection_lost(&self) -> bool {
        matches!(self, Self::Protocol(e) if e.is_connection_lost())
    }
}
