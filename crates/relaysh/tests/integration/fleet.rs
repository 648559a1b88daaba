//! A controller on an ephemeral loopback port plus in-process agents

use anyhow::{bail, Context, Result};
use relaysh::{Controller, ControllerConfig, Dispatcher, SessionId, SessionRegistry};
use relaysh_agent::{AgentConfig, AgentRuntime, StaticMetadata};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// How long any single wait may take before the test fails
pub const WAIT_LIMIT: Duration = Duration::from_secs(10);

/// A running controller and the agents attached to it
pub struct Fleet {
    addr: SocketAddr,
    registry: Arc<SessionRegistry>,
    dispatcher: Dispatcher,
    shutdown: CancellationToken,
    server: JoinHandle<()>,
    agents: Vec<(Arc<AgentRuntime>, JoinHandle<()>)>,
}

impl Fleet {
    /// Start a controller with the given heartbeat interval
    pub async fn start(heartbeat: Duration) -> Result<Self> {
        let config = ControllerConfig::default()
            .with_listen("127.0.0.1", 0)
            .with_heartbeat_interval(heartbeat)
            .with_registration_timeout(Duration::from_secs(5));
        let controller = Controller::bind(config).await.context("Failed to bind controller")?;

        Ok(Self {
            addr: controller.local_addr(),
            registry: controller.registry(),
            dispatcher: controller.dispatcher(),
            shutdown: controller.shutdown_token(),
            server: tokio::spawn(controller.run()),
            agents: Vec::new(),
        })
    }

    /// Controller session registry
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Dispatcher over the controller's queue
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Start an agent with the default shell and wait until it has registered
    pub async fn add_agent(&mut self, metadata: &str) -> Result<SessionId> {
        self.add_agent_with(metadata, |config| config).await
    }

    /// Start an agent with a customised config and wait until it has registered
    pub async fn add_agent_with<F>(&mut self, metadata: &str, customise: F) -> Result<SessionId>
    where
        F: FnOnce(AgentConfig) -> AgentConfig,
    {
        let config = customise(
            AgentConfig::default()
                .with_server("127.0.0.1", self.addr.port())
                .with_reconnect_backoff(Duration::from_millis(50)),
        );
        let known: Vec<SessionId> = self.registry.list().await.iter().map(|s| s.id()).collect();

        let agent = Arc::new(AgentRuntime::new(config, Arc::new(StaticMetadata(metadata.to_string()))));
        let runner = agent.clone();
        let handle = tokio::spawn(async move {
            let _ = runner.run().await;
        });
        self.agents.push((agent, handle));

        let registry = self.registry.clone();
        wait_until(|| {
            let registry = registry.clone();
            let known = known.clone();
            async move {
                for session in registry.list().await {
                    if !known.contains(&session.id()) && !session.metadata().await.is_empty() {
                        return true;
                    }
                }
                false
            }
        })
        .await?;

        let newest = self
            .registry
            .list()
            .await
            .into_iter()
            .map(|s| s.id())
            .filter(|id| !known.contains(id))
            .max()
            .context("agent registered but no new session found")?;
        Ok(newest)
    }

    /// Stop the agent started `index`-th, closing its connection
    pub async fn stop_agent(&mut self, index: usize) -> Result<()> {
        let (agent, handle) = self.agents.remove(index);
        agent.shutdown_token().cancel();
        handle.await.context("agent task panicked")?;
        Ok(())
    }

    /// Stop every agent and the controller
    pub async fn shutdown(self) -> Result<()> {
        for (agent, handle) in self.agents {
            agent.shutdown_token().cancel();
            handle.await.context("agent task panicked")?;
        }
        self.shutdown.cancel();
        self.server.await.context("controller task panicked")?;
        Ok(())
    }
}

/// Poll `check` until it holds or [`WAIT_LIMIT`] passes
pub async fn wait_until<F, Fut>(mut check: F) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + WAIT_LIMIT;
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    bail!("condition not reached within {:?}", WAIT_LIMIT)
}
