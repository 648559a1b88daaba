//! Sessions and the registry that owns them

use crate::metadata::SystemInfo;
use crate::{RelayError, Result};
use relaysh_proto::message::PING;
use relaysh_proto::{split_boxed, BoxedReader, BoxedWriter, LineReader, LineWriter, ProtocolError, Registration};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{Mutex, MutexGuard, RwLock};
use tracing::{debug, info};

/// Identifier assigned to each accepted connection
pub type SessionId = u64;

/// Controller-side record of one connected agent
pub struct Session {
    /// Registry-assigned identifier
    id: SessionId,
    /// Remote address, for display
    peer: String,
    /// Inbound half; held by whoever is currently reading
    reader: Mutex<LineReader<BoxedReader>>,
    /// Outbound half; held for the duration of one line
    writer: Mutex<LineWriter<BoxedWriter>>,
    /// Metadata from the registration block
    metadata: RwLock<Arc<SystemInfo>>,
    /// Whether the last heartbeat or reply succeeded
    alive: AtomicBool,
    /// Set while a command is awaiting its response
    in_flight: AtomicBool,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("alive", &self.is_alive())
            .field("in_flight", &self.is_in_flight())
            .finish()
    }
}

impl Session {
    fn new<S>(id: SessionId, stream: S, peer: String, max_line_length: usize) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = split_boxed(stream, max_line_length);
        Self {
            id,
            peer,
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            metadata: RwLock::new(Arc::new(SystemInfo::default())),
            alive: AtomicBool::new(true),
            in_flight: AtomicBool::new(false),
        }
    }

    /// Session identifier
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Remote address of the agent
    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Whether the last heartbeat write or `PONG` succeeded
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Relaxed)
    }

    /// Record the outcome of a liveness check
    pub fn mark_alive(&self, alive: bool) {
        self.alive.store(alive, Ordering::Relaxed);
    }

    /// Whether a command is awaiting its response
    pub fn is_in_flight(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Mark a command as in flight until the returned guard is dropped.
    ///
    /// Must be taken before the command is written so that no heartbeat
    /// can follow it on the wire.
    pub fn begin_command(&self) -> InFlight<'_> {
        self.in_flight.store(true, Ordering::SeqCst);
        InFlight { session: self }
    }

    /// Current metadata snapshot
    pub async fn metadata(&self) -> Arc<SystemInfo> {
        self.metadata.read().await.clone()
    }

    /// Replace the metadata
    pub async fn set_metadata(&self, info: SystemInfo) {
        *self.metadata.write().await = Arc::new(info);
    }

    /// Send one line to the agent
    pub async fn send_line(&self, line: &str) -> std::result::Result<(), ProtocolError> {
        self.writer.lock().await.send_line(line).await
    }

    /// Write a heartbeat `PING` unless a command is in flight.
    ///
    /// Returns `Ok(false)` when skipped. The flag is checked under the
    /// writer lock, so a `PING` either precedes the command or is not sent,
    /// and its `PONG` always arrives before the command's output.
    pub async fn send_heartbeat(&self) -> std::result::Result<bool, ProtocolError> {
        let mut writer = self.writer.lock().await;
        if self.is_in_flight() {
            return Ok(false);
        }
        writer.send_line(PING).await?;
        Ok(true)
    }

    /// Exclusive access to the inbound half
    pub async fn reader(&self) -> MutexGuard<'_, LineReader<BoxedReader>> {
        self.reader.lock().await
    }

    /// Read the agent's registration block and store its metadata
    pub async fn receive_registration(&self, timeout: Duration) -> Result<()> {
        let registration = {
            let mut reader = self.reader().await;
            tokio::time::timeout(timeout, Registration::receive(&mut *reader))
                .await
                .map_err(|_| RelayError::Registration(format!("nothing received within {:?}", timeout)))?
        };

        match registration {
            Ok(registration) => {
                let info = SystemInfo::parse(registration.metadata());
                self.set_metadata(info).await;
                debug!("Session {} registered", self.id);
                Ok(())
            }
            Err(ProtocolError::MalformedRegistration(reason)) => {
                Err(RelayError::Registration(reason))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Best-effort shutdown of the outbound half.
    ///
    /// Skipped when another task is mid-write; the stream closes once the
    /// last reference to the session is dropped.
    pub async fn close(&self) {
        if let Ok(mut writer) = self.writer.try_lock() {
            let _ = writer.shutdown().await;
        }
    }
}

/// Clears a session's in-flight flag when dropped
#[derive(Debug)]
pub struct InFlight<'a> {
    session: &'a Session,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.session.in_flight.store(false, Ordering::SeqCst);
    }
}

struct RegistryInner {
    /// Next identifier to hand out
    next_id: SessionId,
    /// Live sessions
    sessions: HashMap<SessionId, Arc<Session>>,
}

/// Table of live sessions.
///
/// Every operation takes the lock only long enough to copy or mutate the
/// table; no I/O happens while it is held.
pub struct SessionRegistry {
    inner: RwLock<RegistryInner>,
    /// Line limit applied to new sessions
    max_line_length: usize,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new(relaysh_proto::MAX_LINE_LENGTH)
    }
}

impl SessionRegistry {
    /// Create an empty registry
    pub fn new(max_line_length: usize) -> Self {
        Self {
            inner: RwLock::new(RegistryInner {
                next_id: 1,
                sessions: HashMap::new(),
            }),
            max_line_length,
        }
    }

    /// Register a connection and return its session.
    ///
    /// Identifiers increase monotonically and are never reused.
    pub async fn register<S>(&self, stream: S, peer: impl Into<String>) -> Arc<Session>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let peer = peer.into();
        let mut inner = self.inner.write().await;
        let id = inner.next_id;
        inner.next_id += 1;

        let session = Arc::new(Session::new(id, stream, peer, self.max_line_length));
        inner.sessions.insert(id, session.clone());
        drop(inner);

        info!("Agent {} ({}) connected", id, session.peer());
        session
    }

    /// Find a live session
    pub async fn lookup(&self, id: SessionId) -> Result<Arc<Session>> {
        self.inner
            .read()
            .await
            .sessions
            .get(&id)
            .cloned()
            .ok_or(RelayError::UnknownSessionId(id))
    }

    /// Whether a session is registered
    pub async fn contains(&self, id: SessionId) -> bool {
        self.inner.read().await.sessions.contains_key(&id)
    }

    /// Remove a session. Removing an unknown id is a no-op.
    pub async fn remove(&self, id: SessionId) -> Option<Arc<Session>> {
        let removed = self.inner.write().await.sessions.remove(&id);
        if let Some(session) = &removed {
            info!("Agent {} ({}) disconnected", id, session.peer());
            session.close().await;
        }
        removed
    }

    /// Snapshot of every live session, ordered by id
    pub async fn list(&self) -> Vec<Arc<Session>> {
        let mut sessions: Vec<Arc<Session>> = self.inner.read().await.sessions.values().cloned().collect();
        sessions.sort_by_key(|s| s.id());
        sessions
    }

    /// Number of live sessions
    pub async fn len(&self) -> usize {
        self.inner.read().await.sessions.len()
    }

    /// Whether no sessions are registered
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
