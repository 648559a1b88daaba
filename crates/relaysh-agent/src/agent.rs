//! Agent reconnect loop and control-line processing

use crate::executor::{SharedWriter, ShellExecutor};
use crate::inspect::MetadataSource;
use crate::{AgentConfig, AgentError};
use relaysh_proto::message::PONG;
use relaysh_proto::{split_boxed, ControlLine, Registration};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Lifecycle of the agent's control connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    /// Waiting out the backoff before the next dial
    Disconnected,
    /// Dial in progress
    Connecting,
    /// Sending the registration block
    Registering,
    /// Answering heartbeats and executing commands
    Serving,
}

/// The client-side runtime: connect, register, serve, and start over
pub struct AgentRuntime {
    /// Agent configuration
    config: AgentConfig,
    /// Produces the registration metadata
    metadata: Arc<dyn MetadataSource>,
    /// Runs received commands
    executor: Arc<ShellExecutor>,
    /// Current state, observable by callers
    state_tx: watch::Sender<AgentState>,
    /// Stops the runtime
    shutdown: CancellationToken,
}

impl AgentRuntime {
    /// Create a runtime; nothing happens until [`AgentRuntime::run`]
    pub fn new(config: AgentConfig, metadata: Arc<dyn MetadataSource>) -> Self {
        let executor = Arc::new(ShellExecutor::new(config.shell.clone()));
        let (state_tx, _) = watch::channel(AgentState::Disconnected);
        Self {
            config,
            metadata,
            executor,
            state_tx,
            shutdown: CancellationToken::new(),
        }
    }

    /// Current state
    pub fn state(&self) -> AgentState {
        *self.state_tx.borrow()
    }

    /// Watch state transitions
    pub fn subscribe(&self) -> watch::Receiver<AgentState> {
        self.state_tx.subscribe()
    }

    /// Token that stops [`AgentRuntime::run`] when cancelled
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    fn set_state(&self, state: AgentState) {
        debug!("Agent state: {:?}", state);
        self.state_tx.send_replace(state);
    }

    /// Run until shut down. Dial failures and lost connections are retried
    /// after the configured backoff; nothing here is fatal.
    pub async fn run(&self) -> Result<(), AgentError> {
        info!("Agent targeting controller at {}", self.config.server_addr());

        loop {
            self.set_state(AgentState::Connecting);
            let dialed = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                dialed = self.connect() => dialed,
            };

            match dialed {
                Ok(stream) => {
                    info!("Connected to controller at {}", self.config.server_addr());
                    let served = tokio::select! {
                        _ = self.shutdown.cancelled() => break,
                        served = self.serve_connection(stream) => served,
                    };
                    if let Err(e) = served {
                        warn!("Control connection ended: {}", e);
                    }
                }
                Err(e) => debug!("{}", e),
            }

            self.set_state(AgentState::Disconnected);
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.config.reconnect_backoff()) => {}
            }
        }

        self.set_state(AgentState::Disconnected);
        info!("Agent stopped");
        Ok(())
    }

    /// Dial the controller once
    async fn connect(&self) -> Result<TcpStream, AgentError> {
        let addr = self.config.server_addr();
        let dial_error = |reason: String| AgentError::Dial {
            addr: addr.clone(),
            reason,
        };

        let stream = tokio::time::timeout(self.config.connect_timeout(), TcpStream::connect(&addr))
            .await
            .map_err(|_| dial_error("timed out".to_string()))?
            .map_err(|e| dial_error(e.to_string()))?;

        if let Err(e) = stream.set_nodelay(true) {
            debug!("Failed to set TCP_NODELAY: {}", e);
        }
        Ok(stream)
    }

    /// Register over an established stream, then serve it until it fails.
    ///
    /// Always returns an error: a control connection only ends by breaking.
    pub async fn serve_connection<S>(&self, stream: S) -> Result<(), AgentError>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (mut reader, writer) = split_boxed(stream, self.config.max_line_length);
        let writer: SharedWriter = Arc::new(Mutex::new(writer));

        self.set_state(AgentState::Registering);
        let registration = Registration::new(self.metadata.collect().await);
        registration.send(&mut *writer.lock().await).await?;
        debug!("Registration sent ({} bytes of metadata)", registration.metadata().len());

        self.set_state(AgentState::Serving);
        loop {
            let line = reader.receive_line().await?;
            match ControlLine::parse(&line) {
                ControlLine::Ping => {
                    writer.lock().await.send_line(PONG).await?;
                }
                ControlLine::Exit => {
                    info!("Operator left the interactive shell; connection stays open");
                }
                ControlLine::Empty => {}
                ControlLine::Command(command) => {
                    info!("Received command: {}", command);
                    let command = command.to_string();
                    let executor = self.executor.clone();
                    let writer = writer.clone();
                    tokio::spawn(async move {
                        if let Err(e) = executor.execute(&command, &writer).await {
                            warn!("Command {:?} failed: {}", command, e);
                        }
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inspect::StaticMetadata;
    use relaysh_proto::message::{END_SENTINEL, START_SENTINEL};
    use relaysh_proto::{split, LineReader, LineWriter, MAX_LINE_LENGTH};
    use std::time::Duration;
    use tokio::io::{ReadHalf, WriteHalf};
    use tokio::net::TcpListener;
    use tokio::time::timeout;

    type Controller<S> = (LineReader<ReadHalf<S>>, LineWriter<WriteHalf<S>>);

    fn runtime(port: u16) -> AgentRuntime {
        let config = AgentConfig::default()
            .with_server("127.0.0.1", port)
            .with_reconnect_backoff(Duration::from_millis(50));
        AgentRuntime::new(config, Arc::new(StaticMetadata("Vendor: Acme\n".to_string())))
    }

    async fn accept_registered(listener: &TcpListener) -> Controller<TcpStream> {
        let (stream, _) = timeout(Duration::from_secs(5), listener.accept()).await.unwrap().unwrap();
        let (mut reader, writer) = split(stream, MAX_LINE_LENGTH);
        let registration = Registration::receive(&mut reader).await.unwrap();
        assert_eq!(registration.metadata(), "Vendor: Acme\n");
        (reader, writer)
    }

    #[tokio::test]
    async fn test_initial_state_is_disconnected() {
        let agent = runtime(1);
        assert_eq!(agent.state(), AgentState::Disconnected);
    }

    #[tokio::test]
    async fn test_ping_exit_and_command_over_duplex() {
        let (agent_side, controller_side) = tokio::io::duplex(16 * 1024);
        let agent = Arc::new(runtime(1));
        let mut states = agent.subscribe();

        let serving = {
            let agent = agent.clone();
            tokio::spawn(async move { agent.serve_connection(agent_side).await })
        };

        let (mut reader, mut writer) = split(controller_side, MAX_LINE_LENGTH);
        Registration::receive(&mut reader).await.unwrap();
        states.wait_for(|s| *s == AgentState::Serving).await.unwrap();

        writer.send_line("PING").await.unwrap();
        assert_eq!(reader.receive_line().await.unwrap(), "PONG");

        // exit is a local no-op, the next PING is still answered
        writer.send_line("exit").await.unwrap();
        writer.send_line("PING").await.unwrap();
        assert_eq!(reader.receive_line().await.unwrap(), "PONG");

        writer.send_line("echo hi").await.unwrap();
        assert_eq!(reader.receive_line().await.unwrap(), START_SENTINEL);
        assert_eq!(reader.receive_line().await.unwrap(), "hi");
        assert_eq!(reader.receive_line().await.unwrap(), END_SENTINEL);

        drop(writer);
        drop(reader);
        let result = timeout(Duration::from_secs(5), serving).await.unwrap().unwrap();
        assert!(result.unwrap_err().is_connection_lost());
    }

    #[tokio::test]
    async fn test_commands_run_concurrently() {
        let (agent_side, controller_side) = tokio::io::duplex(16 * 1024);
        let agent = Arc::new(runtime(1));
        {
            let agent = agent.clone();
            tokio::spawn(async move { agent.serve_connection(agent_side).await });
        }

        let (mut reader, mut writer) = split(controller_side, MAX_LINE_LENGTH);
        Registration::receive(&mut reader).await.unwrap();

        // The slow command must not hold up the fast one
        writer.send_line("sleep 1; echo slow").await.unwrap();
        writer.send_line("echo fast").await.unwrap();

        let mut lines = Vec::new();
        while !lines.contains(&"fast".to_string()) {
            let line = timeout(Duration::from_millis(900), reader.receive_line())
                .await
                .expect("fast command was serialized behind the slow one")
                .unwrap();
            lines.push(line);
        }
        assert!(!lines.contains(&"slow".to_string()));
    }

    #[tokio::test]
    async fn test_reconnects_and_registers_again() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let agent = Arc::new(runtime(port));
        let shutdown = agent.shutdown_token();

        let running = {
            let agent = agent.clone();
            tokio::spawn(async move { agent.run().await })
        };

        let (reader, writer) = accept_registered(&listener).await;
        drop(reader);
        drop(writer);

        // A fresh registration arrives on the next connection
        let (mut reader, mut writer) = accept_registered(&listener).await;
        writer.send_line("PING").await.unwrap();
        assert_eq!(reader.receive_line().await.unwrap(), "PONG");

        shutdown.cancel();
        timeout(Duration::from_secs(5), running).await.unwrap().unwrap().unwrap();
        assert_eq!(agent.state(), AgentState::Disconnected);
    }

    #[tokio::test]
    async fn test_dial_failures_are_retried_until_shutdown() {
        // Reserve a port, then close it so nothing is listening
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let agent = Arc::new(runtime(port));
        let shutdown = agent.shutdown_token();

        let running = {
            let agent = agent.clone();
            tokio::spawn(async move { agent.run().await })
        };

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!running.is_finished());

        shutdown.cancel();
        assert!(timeout(Duration::from_secs(5), running).await.unwrap().unwrap().is_ok());
    }
}
