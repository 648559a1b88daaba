//! Wire vocabulary shared by the controller and the agent

use crate::channel::{LineReader, LineWriter};
use crate::ProtocolError;
use tokio::io::{AsyncRead, AsyncWrite};

/// Heartbeat sent by the controller
pub const PING: &str = "PING";

/// Liveness reply sent by the agent
pub const PONG: &str = "PONG";

/// Accepted by either side as a local no-op
pub const EXIT: &str = "exit";

/// First line of the registration block
pub const SYSTEM_INFO_HEADER: &str = "SYSTEM_INFO:";

/// Marks the beginning of one command's output
pub const START_SENTINEL: &str = "SERVERANDCLIENTSTB";

/// Marks the end of one command's output
pub const END_SENTINEL: &str = "<SERVERANDCLIENTEOF>";

/// A line travelling from the controller to the agent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlLine<'a> {
    /// Heartbeat
    Ping,
    /// Operator left the shell; nothing to do
    Exit,
    /// Blank line; ignored
    Empty,
    /// Shell command to execute
    Command(&'a str),
}

impl<'a> ControlLine<'a> {
    /// Classify an already trimmed line
    pub fn parse(line: &'a str) -> Self {
        match line {
            "" => Self::Empty,
            PING => Self::Ping,
            EXIT => Self::Exit,
            command => Self::Command(command),
        }
    }
}

/// A line travelling from the agent to the controller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentLine<'a> {
    /// Liveness reply
    Pong,
    /// Start of a command's output
    Start,
    /// End of a command's output
    End,
    /// Any other line, usually command output
    Output(&'a str),
}

impl<'a> AgentLine<'a> {
    /// Classify an already trimmed line
    pub fn parse(line: &'a str) -> Self {
        match line {
            PONG => Self::Pong,
            START_SENTINEL => Self::Start,
            END_SENTINEL => Self::End,
            other => Self::Output(other),
        }
    }
}

/// One-time block an agent sends after connecting
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Registration {
    metadata: String,
}

impl Registration {
    /// Wrap a metadata blob
    pub fn new(metadata: impl Into<String>) -> Self {
        Self {
            metadata: metadata.into(),
        }
    }

    /// The metadata blob, one record per line
    pub fn metadata(&self) -> &str {
        &self.metadata
    }

    /// Consume the registration and return the blob
    pub fn into_metadata(self) -> String {
        self.metadata
    }

    /// Lines as they appear on the wire, terminator included.
    ///
    /// Blank metadata lines are dropped since a blank line ends the block.
    pub fn wire_lines(&self) -> Vec<&str> {
        let mut lines = vec![SYSTEM_INFO_HEADER];
        lines.extend(
            self.metadata
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty()),
        );
        lines.push("");
        lines
    }

    /// Write the registration block
    pub async fn send<W>(&self, writer: &mut LineWriter<W>) -> Result<(), ProtocolError>
    where
        W: AsyncWrite + Unpin,
    {
        for line in self.wire_lines() {
            writer.send_line(line).await?;
        }
        Ok(())
    }

    /// Read a registration block.
    ///
    /// Blank lines and `PONG` replies before the header are skipped; any other
    /// line in that position is rejected.
    pub async fn receive<R>(reader: &mut LineReader<R>) -> Result<Self, ProtocolError>
    where
        R: AsyncRead + Unpin,
    {
        loop {
            let line = reader.receive_line().await?;
            match line.as_str() {
                "" | PONG => continue,
                SYSTEM_INFO_HEADER => break,
                other => {
                    return Err(ProtocolError::MalformedRegistration(format!(
                        "expected {} header, got {:?}",
                        SYSTEM_INFO_HEADER, other
                    )))
                }
            }
        }

        let mut metadata = String::new();
        loop {
            let line = reader.receive_line().await?;
            if line.is_empty() {
                break;
            }
            metadata.push_str(&line);
            metadata.push('\n');
        }

        Ok(Self { metadata })
    }
}
