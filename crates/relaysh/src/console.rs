//! Operator command loop and the interactive shell sub-mode

use crate::directory;
use crate::dispatch::{CommandOutcome, Dispatcher};
use crate::session::{SessionId, SessionRegistry};
use crate::{RelayError, Result};
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, Lines};
use tokio::sync::mpsc;
use tracing::debug;

/// Top-level prompt
pub const PROMPT: &str = "> ";

const HELP: &str = "\
Available commands:
  list              - list connected agents
  connect <id>      - open a shell on an agent
  search <keyword>  - find agents whose metadata contains a keyword
  help              - show this help
  exit              - stop the controller
";

/// A parsed top-level operator command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperatorCommand {
    /// Show every connected agent
    List,
    /// Enter the shell sub-mode for an agent
    Connect(SessionId),
    /// Search agent metadata
    Search(String),
    /// Show usage
    Help,
    /// Stop the controller
    Exit,
}

impl OperatorCommand {
    /// Parse one trimmed, non-empty input line
    pub fn parse(line: &str) -> Result<Self> {
        let line = line.trim();
        let (verb, rest) = match line.split_once(char::is_whitespace) {
            Some((verb, rest)) => (verb, rest.trim()),
            None => (line, ""),
        };

        match verb {
            "list" if rest.is_empty() => Ok(Self::List),
            "help" if rest.is_empty() => Ok(Self::Help),
            "exit" if rest.is_empty() => Ok(Self::Exit),
            "connect" => {
                let mut args = rest.split_whitespace();
                match (args.next(), args.next()) {
                    (Some(id), None) => id
                        .parse()
                        .map(Self::Connect)
                        .map_err(|_| RelayError::MalformedCommand("agent id must be an integer".to_string())),
                    _ => Err(RelayError::MalformedCommand("usage: connect <id>".to_string())),
                }
            }
            "search" if !rest.is_empty() => Ok(Self::Search(rest.to_string())),
            "search" => Err(RelayError::MalformedCommand("usage: search <keyword>".to_string())),
            "list" | "help" | "exit" => Err(RelayError::MalformedCommand(format!("'{}' takes no arguments", verb))),
            _ => Err(RelayError::MalformedCommand(format!(
                "unknown command '{}', type 'help' for a list",
                verb
            ))),
        }
    }
}

/// Operator console over any line-oriented input and output.
///
/// Interrupts (Ctrl-C) arrive on a channel: while a command is in flight
/// they cancel it, at a prompt they print a hint.
pub struct Console<R, W> {
    input: Lines<R>,
    output: W,
    registry: Arc<SessionRegistry>,
    dispatcher: Dispatcher,
    interrupts: mpsc::Receiver<()>,
}

impl<R, W> Console<R, W>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    /// Create a console
    pub fn new(
        input: R,
        output: W,
        registry: Arc<SessionRegistry>,
        dispatcher: Dispatcher,
        interrupts: mpsc::Receiver<()>,
    ) -> Self {
        Self {
            input: input.lines(),
            output,
            registry,
            dispatcher,
            interrupts,
        }
    }

    /// Consume the console and return its output sink
    pub fn into_output(self) -> W {
        self.output
    }

    /// Run until `exit` or end of input
    pub async fn run(&mut self) -> Result<()> {
        loop {
            let line = match self.read_line(PROMPT, "(type 'exit' to stop the controller)").await? {
                Some(line) => line,
                None => break,
            };
            if line.is_empty() {
                continue;
            }

            let command = match OperatorCommand::parse(&line) {
                Ok(command) => command,
                Err(e) => {
                    self.write(&format!("{}\n", e)).await?;
                    continue;
                }
            };

            match command {
                OperatorCommand::List => {
                    let summaries = directory::list(&self.registry).await;
                    self.write(&directory::render_list(&summaries)).await?;
                }
                OperatorCommand::Search(keyword) => {
                    let summaries = directory::search(&self.registry, &keyword).await;
                    self.write(&directory::render_search(&keyword, &summaries)).await?;
                }
                OperatorCommand::Help => self.write(HELP).await?,
                OperatorCommand::Connect(id) => {
                    if !self.shell(id).await? {
                        break;
                    }
                }
                OperatorCommand::Exit => break,
            }
        }

        self.write("Controller exiting\n").await
    }

    /// Shell sub-mode. Returns `false` when input ended.
    async fn shell(&mut self, id: SessionId) -> Result<bool> {
        let peer = match self.registry.lookup(id).await {
            Ok(session) => session.peer().to_string(),
            Err(e) => {
                self.write(&format!("{}\n", e)).await?;
                return Ok(true);
            }
        };
        self.write(&format!("Interacting with agent {} ({}), type 'exit' to leave\n", id, peer))
            .await?;
        let prompt = format!("shell {}> ", peer);

        loop {
            let line = match self.read_line(&prompt, "(type 'exit' to leave the shell)").await? {
                Some(line) => line,
                None => return Ok(false),
            };
            if line == "exit" {
                self.write(&format!("Left agent {} ({})\n", id, peer)).await?;
                return Ok(true);
            }
            if line.is_empty() {
                continue;
            }

            self.dispatcher.queue().enqueue(id, &line).await;
            if !self.run_queue(id).await? {
                self.dispatcher.queue().clear(id).await;
                return Ok(true);
            }
        }
    }

    /// Dispatch everything queued for `id`. Returns `false` once the
    /// session is gone.
    async fn run_queue(&mut self, id: SessionId) -> Result<bool> {
        loop {
            match self.dispatcher.dispatch_next(id, &mut self.interrupts).await {
                Ok(None) => return Ok(true),
                Ok(Some(CommandOutcome::Completed { command, response })) => {
                    self.write(&format!("Response from agent {} ({}):\n{}", id, command, response))
                        .await?;
                }
                Ok(Some(CommandOutcome::Cancelled { command })) => {
                    debug!("Interrupted '{}' on agent {}", command, id);
                    self.write("\ncommand interrupted\n").await?;
                }
                Ok(Some(CommandOutcome::SessionLost { command, reason })) => {
                    self.write(&format!("Lost agent {} while running '{}': {}\n", id, command, reason))
                        .await?;
                    return Ok(false);
                }
                Err(e) => {
                    self.write(&format!("{}\n", e)).await?;
                    return Ok(false);
                }
            }
        }
    }

    /// Print `prompt` and read one trimmed line; `None` at end of input
    async fn read_line(&mut self, prompt: &str, hint: &str) -> Result<Option<String>> {
        self.write(prompt).await?;
        loop {
            tokio::select! {
                line = self.input.next_line() => {
                    return Ok(line?.map(|line| line.trim().to_string()));
                }
                Some(()) = self.interrupts.recv() => {
                    self.write(&format!("\n{}\n{}", hint, prompt)).await?;
                }
            }
        }
    }

    async fn write(&mut self, text: &str) -> Result<()> {
        self.output.write_all(text.as_bytes()).await?;
        self.output.flush().await?;
        Ok(())
    }
}
