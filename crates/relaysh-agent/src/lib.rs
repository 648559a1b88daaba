//! # relaysh agent
//!
//! Client side of relaysh: dials the controller, registers host metadata, and
//! executes the commands it receives, streaming their output back.

#![warn(missing_docs)]

/// Reconnect loop and control-line processing
pub mod agent;

/// Sentinel-framed command execution
pub mod executor;

/// Host inspection for the registration block
pub mod inspect;

/// Agent configuration
pub mod config;

/// Error types for the agent
pub mod error;

pub use agent::{AgentRuntime, AgentState};
pub use config::AgentConfig;
pub use error::AgentError;
pub use executor::{ExecutionSummary, ShellExecutor};
pub use inspect::{HostInspector, MetadataSource, StaticMetadata};
