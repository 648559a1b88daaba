//! Per-session command queues and the single-flight dispatcher

use crate::session::{Session, SessionId, SessionRegistry};
use crate::{RelayError, Result};
use relaysh_proto::AgentLine;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Pending commands for every session, in insertion order
#[derive(Debug, Default)]
pub struct CommandQueue {
    queues: Mutex<HashMap<SessionId, VecDeque<String>>>,
}

impl CommandQueue {
    /// Create an empty queue map
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue operator text for a session.
    ///
    /// Text is split on newlines into one command per line; trailing `\r`
    /// is stripped and blank pieces are dropped. Returns how many commands
    /// were queued.
    pub async fn enqueue(&self, id: SessionId, text: &str) -> usize {
        let commands: Vec<String> = text
            .split('\n')
            .map(|piece| piece.trim_end_matches('\r'))
            .filter(|piece| !piece.trim().is_empty())
            .map(str::to_string)
            .collect();
        let count = commands.len();
        if count > 0 {
            self.queues.lock().await.entry(id).or_default().extend(commands);
        }
        count
    }

    /// Take the oldest pending command for a session
    pub async fn pop(&self, id: SessionId) -> Option<String> {
        self.queues.lock().await.get_mut(&id)?.pop_front()
    }

    /// Number of pending commands for a session
    pub async fn len(&self, id: SessionId) -> usize {
        self.queues.lock().await.get(&id).map_or(0, VecDeque::len)
    }

    /// Whether a session has nothing pending
    pub async fn is_empty(&self, id: SessionId) -> bool {
        self.len(id).await == 0
    }

    /// Drop everything pending for a session
    pub async fn clear(&self, id: SessionId) -> usize {
        self.queues.lock().await.remove(&id).map_or(0, |q| q.len())
    }
}

/// Result of dispatching one command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandOutcome {
    /// The agent framed a full response
    Completed {
        /// Command that was sent
        command: String,
        /// Output lines, each terminated by `\n`
        response: String,
    },
    /// The operator interrupted the wait
    Cancelled {
        /// Command that was sent
        command: String,
    },
    /// The session failed while sending or collecting; it has been removed
    SessionLost {
        /// Command that was being handled
        command: String,
        /// What went wrong
        reason: String,
    },
}

impl CommandOutcome {
    /// Command this outcome belongs to
    pub fn command(&self) -> &str {
        match self {
            Self::Completed { command, .. }
            | Self::Cancelled { command }
            | Self::SessionLost { command, .. } => command,
        }
    }
}

/// Executes queued commands strictly one at a time per session
pub struct Dispatcher {
    registry: Arc<SessionRegistry>,
    queue: Arc<CommandQueue>,
}

impl Dispatcher {
    /// Create a dispatcher over a registry and its command queue
    pub fn new(registry: Arc<SessionRegistry>, queue: Arc<CommandQueue>) -> Self {
        Self { registry, queue }
    }

    /// The command queue this dispatcher drains
    pub fn queue(&self) -> &Arc<CommandQueue> {
        &self.queue
    }

    /// Send the next queued command and wait for its response.
    ///
    /// Returns `Ok(None)` once the queue is empty. The session is looked up
    /// afresh on every call, so a session removed in the meantime yields
    /// [`RelayError::UnknownSessionId`]. A message on `interrupts` cancels the
    /// wait for this command only; interrupts received before the command
    /// was sent are discarded.
    pub async fn dispatch_next(
        &self,
        id: SessionId,
        interrupts: &mut mpsc::Receiver<()>,
    ) -> Result<Option<CommandOutcome>> {
        let session = self.registry.lookup(id).await?;
        let command = match self.queue.pop(id).await {
            Some(command) => command,
            None => return Ok(None),
        };

        while interrupts.try_recv().is_ok() {}

        // Held until the collector is joined; heartbeats stay off the wire
        let _in_flight = session.begin_command();
        if let Err(e) = session.send_line(&command).await {
            warn!("Failed to send command to agent {}: {}", id, e);
            self.registry.remove(id).await;
            return Ok(Some(CommandOutcome::SessionLost {
                command,
                reason: e.to_string(),
            }));
        }
        debug!("Sent command to agent {}: {}", id, command);

        let token = CancellationToken::new();
        let mut collector = tokio::spawn(collect_response(session.clone(), self.registry.clone(), token.clone()));

        let collected = tokio::select! {
            joined = &mut collector => joined,
            Some(()) = interrupts.recv() => {
                token.cancel();
                info!("Command on agent {} interrupted", id);
                let outcome = match collector.await {
                    Ok(_) => CommandOutcome::Cancelled { command },
                    Err(e) => self.collector_failed(id, command, e).await,
                };
                return Ok(Some(outcome));
            }
        };

        let outcome = match collected {
            Ok(Ok(Some(response))) => CommandOutcome::Completed { command, response },
            Ok(Ok(None)) => CommandOutcome::Cancelled { command },
            Ok(Err(e)) => CommandOutcome::SessionLost {
                command,
                reason: e.to_string(),
            },
            Err(e) => self.collector_failed(id, command, e).await,
        };
        Ok(Some(outcome))
    }

    /// The collector task panicked or was aborted; the stream position is
    /// unknown, so the session is dropped
    async fn collector_failed(&self, id: SessionId, command: String, e: JoinError) -> CommandOutcome {
        warn!("Response collector for agent {} failed: {}", id, e);
        self.registry.remove(id).await;
        CommandOutcome::SessionLost {
            command,
            reason: format!("response collector failed: {}", e),
        }
    }

    /// Dispatch every queued command for a session, in order.
    ///
    /// Stops early when the session is lost; whatever is still queued is
    /// discarded with it. Fails only if the session is unknown before the
    /// first command.
    pub async fn drain(&self, id: SessionId, interrupts: &mut mpsc::Receiver<()>) -> Result<Vec<CommandOutcome>> {
        let mut outcomes = Vec::new();
        loop {
            match self.dispatch_next(id, interrupts).await {
                Ok(None) => break,
                Ok(Some(outcome)) => {
                    let lost = matches!(outcome, CommandOutcome::SessionLost { .. });
                    outcomes.push(outcome);
                    if lost {
                        self.queue.clear(id).await;
                        break;
                    }
                }
                Err(e) => {
                    self.queue.clear(id).await;
                    if outcomes.is_empty() {
                        return Err(e);
                    }
                    break;
                }
            }
        }
        Ok(outcomes)
    }
}

/// Read one framed response from a session.
///
/// Lines before the start sentinel are ignored, as is an end sentinel that
/// arrives first. A `PONG` before the start sentinel answers an earlier
/// heartbeat and marks the session alive; inside the frame it is output.
/// Returns `Ok(None)` when cancelled. A read failure removes the session.
async fn collect_response(
    session: Arc<Session>,
    registry: Arc<SessionRegistry>,
    token: CancellationToken,
) -> Result<Option<String>> {
    let mut reader = tokio::select! {
        biased;
        _ = token.cancelled() => return Ok(None),
        reader = session.reader() => reader,
    };

    let mut response = String::new();
    let mut started = false;
    loop {
        let line = tokio::select! {
            biased;
            _ = token.cancelled() => {
                debug!("Stopped collecting from agent {}", session.id());
                return Ok(None);
            }
            line = reader.receive_line() => line,
        };

        let line = match line {
            Ok(line) => line,
            Err(e) => {
                drop(reader);
                warn!("Lost agent {} while reading a response: {}", session.id(), e);
                registry.remove(session.id()).await;
                return Err(RelayError::from(e));
            }
        };

        match AgentLine::parse(&line) {
            AgentLine::Start => started = true,
            AgentLine::End if started => return Ok(Some(response)),
            AgentLine::End => debug!("Ignoring stray end marker from agent {}", session.id()),
            AgentLine::Pong if !started => session.mark_alive(true),
            AgentLine::Output(_) if !started => {}
            AgentLine::Output("") => {}
            AgentLine::Pong | AgentLine::Output(_) => {
                response.push_str(&line);
                response.push('\n');
            }
        }
    }
}
