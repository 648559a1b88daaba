//! # relaysh protocol
//!
//! Newline-framed wire protocol shared by the relaysh controller and agent.

#![warn(missing_docs)]

/// Newline-framed reader and writer
pub mod channel;

/// Control literals, sentinels, and the registration block
pub mod message;

/// Error types for protocol operations
pub mod error;

pub use channel::{split, split_boxed, BoxedReader, BoxedWriter, LineReader, LineWriter, MAX_LINE_LENGTH};
pub use message::{AgentLine, ControlLine, Registration};
pub use error::ProtocolError;
