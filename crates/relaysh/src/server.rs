//! Listening socket, accept loop, and registration handshake

use crate::config::ControllerConfig;
use crate::dispatch::{CommandQueue, Dispatcher};
use crate::liveness::LivenessMonitor;
use crate::session::{Session, SessionRegistry};
use crate::{RelayError, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Delay after a failed `accept` before trying again
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Bound controller: owns the listener, the registry, and the command queue
pub struct Controller {
    config: ControllerConfig,
    listener: TcpListener,
    local_addr: SocketAddr,
    registry: Arc<SessionRegistry>,
    queue: Arc<CommandQueue>,
    shutdown: CancellationToken,
}

impl Controller {
    /// Bind the listening socket. This is the only fatal failure.
    pub async fn bind(config: ControllerConfig) -> Result<Self> {
        config.validate()?;
        let addr = config.listen_addr();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| RelayError::bind(addr.clone(), source))?;
        let local_addr = listener.local_addr()?;
        info!("Controller listening on {}", local_addr);

        Ok(Self {
            registry: Arc::new(SessionRegistry::new(config.max_line_length)),
            queue: Arc::new(CommandQueue::new()),
            shutdown: CancellationToken::new(),
            config,
            listener,
            local_addr,
        })
    }

    /// Address actually bound
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Shared session registry
    pub fn registry(&self) -> Arc<SessionRegistry> {
        self.registry.clone()
    }

    /// Shared command queue
    pub fn queue(&self) -> Arc<CommandQueue> {
        self.queue.clone()
    }

    /// A dispatcher over this controller's registry and queue
    pub fn dispatcher(&self) -> Dispatcher {
        Dispatcher::new(self.registry.clone(), self.queue.clone())
    }

    /// Token that stops [`Controller::run`]
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Accept agents and run the heartbeat until shut down
    pub async fn run(self) {
        let heartbeat = LivenessMonitor::new(
            self.registry.clone(),
            self.config.heartbeat_interval(),
            self.config.heartbeat_write_timeout(),
        )
        .spawn(self.shutdown.clone());

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => self.accept(stream, peer).await,
                    Err(e) => {
                        error!("Failed to accept connection: {}", e);
                        tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                    }
                }
            }
        }

        if let Err(e) = heartbeat.await {
            warn!("Heartbeat task failed: {}", e);
        }
        info!("Controller stopped");
    }

    async fn accept(&self, stream: TcpStream, peer: SocketAddr) {
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Failed to set TCP_NODELAY for {}: {}", peer, e);
        }
        let session = self.registry.register(stream, peer.to_string()).await;
        tokio::spawn(handshake(
            session,
            self.registry.clone(),
            self.config.registration_timeout(),
        ));
    }
}

/// Read the registration block of a freshly accepted session.
///
/// A session whose stream fails is removed; one that sends nothing usable
/// stays registered with empty metadata.
async fn handshake(session: Arc<Session>, registry: Arc<SessionRegistry>, timeout: Duration) {
    match session.receive_registration(timeout).await {
        Ok(()) => {}
        Err(RelayError::ConnectionLost(reason)) => {
            warn!("Agent {} dropped during registration: {}", session.id(), reason);
            registry.remove(session.id()).await;
        }
        Err(e) => warn!("Agent {} registered without metadata: {}", session.id(), e),
    }
}
