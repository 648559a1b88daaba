//! Sentinel-framed command execution

use crate::AgentError;
use relaysh_proto::message::{END_SENTINEL, START_SENTINEL};
use relaysh_proto::{BoxedWriter, LineWriter, ProtocolError};
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Writer shared between the control loop and every running command
pub type SharedWriter = Arc<Mutex<LineWriter<BoxedWriter>>>;

/// What happened to one executed command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionSummary {
    /// Exit code, if the process exited normally
    pub exit_code: Option<i32>,
    /// Output lines forwarded to the controller
    pub lines_sent: u64,
}

/// Runs commands through the configured interpreter and streams their output
#[derive(Debug, Clone)]
pub struct ShellExecutor {
    /// Interpreter program followed by its arguments
    shell: Vec<String>,
}

impl ShellExecutor {
    /// Create an executor for the given interpreter, e.g. `["sh", "-c"]`
    pub fn new(shell: Vec<String>) -> Self {
        Self { shell }
    }

    /// Build the process for a command
    fn command_for(&self, command: &str) -> Result<Command, AgentError> {
        let (program, args) = self
            .shell
            .split_first()
            .ok_or_else(|| AgentError::Spawn("no interpreter configured".to_string()))?;

        let mut cmd = Command::new(program);
        cmd.args(args)
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        Ok(cmd)
    }

    /// Execute one command, framing its output with the start and end sentinels.
    ///
    /// The end sentinel is written on every path where the connection is still
    /// usable, including spawn failures.
    pub async fn execute(&self, command: &str, writer: &SharedWriter) -> Result<ExecutionSummary, AgentError> {
        send(writer, START_SENTINEL).await?;

        let spawned = self.command_for(command).and_then(|mut cmd| {
            cmd.spawn().map_err(|e| AgentError::Spawn(e.to_string()))
        });

        let mut child = match spawned {
            Ok(child) => child,
            Err(e) => {
                warn!("Failed to start command {:?}: {}", command, e);
                send(writer, &e.to_string()).await?;
                send(writer, END_SENTINEL).await?;
                return Err(e);
            }
        };

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        // Both pipes are drained concurrently and joined before the end sentinel
        let (stdout_result, stderr_result) = tokio::join!(
            forward_lines(stdout, writer),
            forward_lines(stderr, writer),
        );

        let exit_code = match child.wait().await {
            Ok(status) => {
                debug!("Command {:?} exited with {}", command, status);
                status.code()
            }
            Err(e) => {
                warn!("Failed to wait for command {:?}: {}", command, e);
                None
            }
        };

        let lines_sent = stdout_result? + stderr_result?;
        send(writer, END_SENTINEL).await?;

        Ok(ExecutionSummary { exit_code, lines_sent })
    }
}

async fn send(writer: &SharedWriter, line: &str) -> Result<(), ProtocolError> {
    writer.lock().await.send_line(line).await
}

/// Copy a pipe to the controller line by line.
///
/// After a send failure the pipe is still drained so the child never blocks
/// on a full pipe; the failure is reported once the pipe closes.
async fn forward_lines<R>(pipe: Option<R>, writer: &SharedWriter) -> Result<u64, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let Some(pipe) = pipe else {
        return Ok(0);
    };

    let mut reader = BufReader::new(pipe);
    let mut buf = Vec::new();
    let mut sent = 0;
    let mut failure = None;

    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                debug!("Pipe read failed: {}", e);
                break;
            }
        }

        if failure.is_some() {
            continue;
        }

        let text = String::from_utf8_lossy(&buf);
        let line = text.trim_end_matches(['\n', '\r']);
        match send(writer, line).await {
            Ok(()) => sent += 1,
            Err(e) => failure = Some(e),
        }
    }

    match failure {
        Some(e) => Err(e),
        None => Ok(sent),
    }
}
