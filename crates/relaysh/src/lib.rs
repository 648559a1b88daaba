//! # relaysh
//!
//! Controller side of relaysh: accepts agent connections, keeps them alive
//! with a heartbeat, and lets an operator run shell commands on one agent at
//! a time with the output streamed back over a newline-framed protocol.

#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub use relaysh_proto as proto;

/// Error types for the controller
pub mod error;

/// Controller configuration
pub mod config;

/// Sessions and the session registry
pub mod session;

/// Heartbeat probing
pub mod liveness;

/// Command queues and the single-flight dispatcher
pub mod dispatch;

/// Parsed agent metadata
pub mod metadata;

/// Listing and search over agent metadata
pub mod directory;

/// Listener, accept loop, and registration handshake
pub mod server;

/// Operator console
pub mod console;

pub use config::ControllerConfig;
pub use console::{Console, OperatorCommand};
pub use dispatch::{CommandOutcome, CommandQueue, Dispatcher};
pub use error::RelayError;
pub use liveness::LivenessMonitor;
pub use metadata::SystemInfo;
pub use server::Controller;
pub use session::{Session, SessionId, SessionRegistry};

/// Result type alias for controller operations
pub type Result<T> = std::result::Result<T, RelayError>;
