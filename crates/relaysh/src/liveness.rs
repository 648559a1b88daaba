//! Heartbeats to every registered session

use crate::session::{SessionId, SessionRegistry};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Registry-wide heartbeat ticker.
///
/// Every interval a `PING` is written to each registered session; a session
/// whose write fails or stalls past the write timeout is removed. Sessions
/// with a command in flight are skipped, since their response reader already
/// notices a dead stream. A peer that keeps its socket open but never reads
/// is not detected.
pub struct LivenessMonitor {
    registry: Arc<SessionRegistry>,
    interval: Duration,
    write_timeout: Duration,
}

impl LivenessMonitor {
    /// Create a monitor over `registry`
    pub fn new(registry: Arc<SessionRegistry>, interval: Duration, write_timeout: Duration) -> Self {
        Self {
            registry,
            interval,
            write_timeout,
        }
    }

    /// Send one heartbeat to every session and return the ids that were removed
    pub async fn tick(&self) -> Vec<SessionId> {
        let sessions = self.registry.list().await;
        if sessions.is_empty() {
            return Vec::new();
        }

        let heartbeats: Vec<JoinHandle<(SessionId, bool)>> = sessions
            .into_iter()
            .map(|session| {
                let write_timeout = self.write_timeout;
                tokio::spawn(async move {
                    match tokio::time::timeout(write_timeout, session.send_heartbeat()).await {
                        Ok(Ok(true)) => {
                            session.mark_alive(true);
                            (session.id(), true)
                        }
                        Ok(Ok(false)) => (session.id(), true),
                        _ => {
                            session.mark_alive(false);
                            (session.id(), false)
                        }
                    }
                })
            })
            .collect();

        let mut removed = Vec::new();
        for heartbeat in heartbeats {
            match heartbeat.await {
                Ok((_, true)) => {}
                Ok((id, false)) => {
                    warn!("Heartbeat to agent {} failed, removing it", id);
                    self.registry.remove(id).await;
                    removed.push(id);
                }
                Err(e) => warn!("Heartbeat task failed: {}", e),
            }
        }

        removed.sort_unstable();
        removed
    }

    /// Run until `shutdown` is cancelled
    pub async fn run(self, shutdown: CancellationToken) {
        info!("Heartbeat every {:?}", self.interval);
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!("Heartbeat stopped");
                    return;
                }
                _ = ticker.tick() => {
                    let removed = self.tick().await;
                    if !removed.is_empty() {
                        debug!("Heartbeat removed {:?}", removed);
                    }
                }
            }
        }
    }

    /// Run on a background task
    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }
}
