//! PTY session store.
//!
//! Sole owner of every live terminal process, keyed by chat session id,
//! together with each session's output history and the connection its
//! output is currently routed to.

use super::output_buffer::OutputBuffer;
use super::pty::TerminalProcess;
use crate::transport::ConnectionHandle;
use chatterm_core::{ServerMessage, TermError, TermResult};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// One live terminal.
pub struct PtySession {
    pub chat_session_id: String,
    /// Validated workspace path as requested by the client.
    pub workspace_path: String,
    /// Store-assigned serial; a later session under the same id gets a new one.
    pub instance: u64,
    pub created_at: Instant,
    process: Box<dyn TerminalProcess>,
    output: OutputBuffer,
    active_connection: Option<ConnectionHandle>,
    /// Set while no connection is attached.
    detached_since: Option<Instant>,
}

impl PtySession {
    fn terminate(&self) {
        // Best effort: the process may already be gone.
        if let Err(e) = self.process.kill() {
            debug!(session_id = %self.chat_session_id, error = %e, "kill failed");
        }
    }
}

/// Information returned when looking up or listing sessions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PtySessionInfo {
    pub chat_session_id: String,
    pub workspace_path: String,
    pub instance: u64,
    pub age_secs: u64,
    pub buffered_chars: usize,
    pub attached: bool,
}

impl From<&PtySession> for PtySessionInfo {
    fn from(s: &PtySession) -> Self {
        Self {
            chat_session_id: s.chat_session_id.clone(),
            workspace_path: s.workspace_path.clone(),
            instance: s.instance,
            age_secs: s.created_at.elapsed().as_secs(),
            buffered_chars: s.output.len(),
            attached: s.active_connection.is_some(),
        }
    }
}

/// Manages all live PTY sessions.
pub struct PtySessionStore {
    sessions: RwLock<HashMap<String, PtySession>>,
    max_sessions: usize,
    max_buffer_size: usize,
    next_instance: AtomicU64,
}

impl PtySessionStore {
    /// Create a store holding at most `max_sessions` sessions, each keeping
    /// up to `max_buffer_size` characters of output.
    pub fn new(max_sessions: usize, max_buffer_size: usize) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            max_sessions,
            max_buffer_size,
            next_instance: AtomicU64::new(1),
        }
    }

    /// Register a spawned process under `chat_session_id`.
    ///
    /// The session starts with an empty buffer and no active connection.
    /// Fails if the id is taken or the store is full, killing the rejected
    /// process.
    pub async fn create(
        &self,
        chat_session_id: &str,
        workspace_path: &str,
        process: Box<dyn TerminalProcess>,
    ) -> TermResult<PtySessionInfo> {
        let mut sessions = self.sessions.write().await;
        let rejection = if sessions.contains_key(chat_session_id) {
            Some(TermError::SessionExists(chat_session_id.to_string()))
        } else if sessions.len() >= self.max_sessions {
            Some(TermError::CapacityReached(self.max_sessions))
        } else {
            None
        };
        if let Some(e) = rejection {
            let _ = process.kill();
            return Err(e);
        }

        let now = Instant::now();
        let session = PtySession {
            chat_session_id: chat_session_id.to_string(),
            workspace_path: workspace_path.to_string(),
            instance: self.next_instance.fetch_add(1, Ordering::Relaxed),
            created_at: now,
            process,
            output: OutputBuffer::new(self.max_buffer_size),
            active_connection: None,
            detached_since: Some(now),
        };
        let info = PtySessionInfo::from(&session);
        sessions.insert(chat_session_id.to_string(), session);
        info!(session_id = %chat_session_id, instance = info.instance, "terminal session created");
        Ok(info)
    }

    pub async fn has(&self, chat_session_id: &str) -> bool {
        self.sessions.read().await.contains_key(chat_session_id)
    }

    pub async fn get(&self, chat_session_id: &str) -> Option<PtySessionInfo> {
        self.sessions
            .read()
            .await
            .get(chat_session_id)
            .map(PtySessionInfo::from)
    }

    /// Whether another session may be created.
    pub async fn has_capacity(&self) -> bool {
        self.sessions.read().await.len() < self.max_sessions
    }

    pub fn max_sessions(&self) -> usize {
        self.max_sessions
    }

    /// Replace the connection that receives the session's output.
    ///
    /// A displaced connection is not closed; it just stops receiving output.
    pub async fn set_active_connection(
        &self,
        chat_session_id: &str,
        connection: Option<ConnectionHandle>,
    ) {
        let mut sessions = self.sessions.write().await;
        if let Some(session) = sessions.get_mut(chat_session_id) {
            set_active(session, connection);
        }
    }

    pub async fn get_active_connection(&self, chat_session_id: &str) -> Option<ConnectionHandle> {
        self.sessions
            .read()
            .await
            .get(chat_session_id)
            .and_then(|s| s.active_connection.clone())
    }

    /// Clear the active connection only if it is `connection_id`.
    ///
    /// Returns whether it was cleared.
    pub async fn clear_active_connection_if(
        &self,
        chat_session_id: &str,
        connection_id: u64,
    ) -> bool {
        let mut sessions = self.sessions.write().await;
        match sessions.get_mut(chat_session_id) {
            Some(session)
                if session
                    .active_connection
                    .as_ref()
                    .is_some_and(|c| c.id() == connection_id) =>
            {
                set_active(session, None);
                true
            }
            _ => false,
        }
    }

    /// Make `connection` the active one and queue a `reconnect` frame with
    /// the retained output on it, atomically with respect to output
    /// recording. Returns `false` if the session does not exist.
    pub async fn reattach(&self, chat_session_id: &str, connection: ConnectionHandle) -> bool {
        let mut sessions = self.sessions.write().await;
        let Some(session) = sessions.get_mut(chat_session_id) else {
            return false;
        };
        connection.send(ServerMessage::Reconnect {
            session_id: chat_session_id.to_string(),
            buffer: session.output.contents(),
        });
        set_active(session, Some(connection));
        true
    }

    /// Append output to the session's history.
    pub async fn append_output(&self, chat_session_id: &str, chunk: String) {
        let mut sessions = self.sessions.write().await;
        if let Some(session) = sessions.get_mut(chat_session_id) {
            session.output.push(chunk);
        }
    }

    /// Forward a chunk of output of session `instance` to its active
    /// connection (if attached and open), then append it to the history.
    ///
    /// Returns `false` if `chat_session_id` no longer names that instance.
    pub async fn record_output(
        &self,
        chat_session_id: &str,
        instance: u64,
        chunk: String,
    ) -> bool {
        let mut sessions = self.sessions.write().await;
        let Some(session) = sessions
            .get_mut(chat_session_id)
            .filter(|s| s.instance == instance)
        else {
            return false;
        };
        if let Some(conn) = session.active_connection.as_ref().filter(|c| c.is_open()) {
            conn.send(ServerMessage::Output {
                data: chunk.clone(),
            });
        }
        session.output.push(chunk);
        true
    }

    /// The retained output, oldest first. Empty if the session is unknown.
    pub async fn get_buffer(&self, chat_session_id: &str) -> String {
        self.sessions
            .read()
            .await
            .get(chat_session_id)
            .map(|s| s.output.contents())
            .unwrap_or_default()
    }

    /// Send keystrokes to the session's process.
    pub async fn write_input(&self, chat_session_id: &str, data: &str) -> TermResult<()> {
        let sessions = self.sessions.read().await;
        let session = sessions
            .get(chat_session_id)
            .ok_or_else(|| TermError::SessionNotFound(chat_session_id.to_string()))?;
        session.process.write(data.as_bytes())
    }

    /// Resize the session's terminal.
    pub async fn resize(&self, chat_session_id: &str, cols: u16, rows: u16) -> TermResult<()> {
        let sessions = self.sessions.read().await;
        let session = sessions
            .get(chat_session_id)
            .ok_or_else(|| TermError::SessionNotFound(chat_session_id.to_string()))?;
        session.process.resize(cols, rows)
    }

    /// Kill the session's process and forget it.
    ///
    /// Returns whether the session existed.
    pub async fn destroy(&self, chat_session_id: &str) -> bool {
        let removed = self.sessions.write().await.remove(chat_session_id);
        match removed {
            Some(session) => {
                session.terminate();
                info!(session_id = %chat_session_id, "terminal session destroyed");
                true
            }
            None => false,
        }
    }

    /// Destroy the session only if it is still `instance`.
    ///
    /// Returns `None` if the id no longer names that instance, otherwise the
    /// connection that was active when it was removed.
    pub async fn destroy_instance(
        &self,
        chat_session_id: &str,
        instance: u64,
    ) -> Option<Option<ConnectionHandle>> {
        let mut sessions = self.sessions.write().await;
        if sessions.get(chat_session_id)?.instance != instance {
            return None;
        }
        let session = sessions.remove(chat_session_id)?;
        drop(sessions);

        session.terminate();
        info!(session_id = %chat_session_id, instance, "terminal session removed");
        Some(session.active_connection)
    }

    /// Destroy every session (server shutdown). Returns how many there were.
    pub async fn destroy_all(&self) -> usize {
        let drained: Vec<PtySession> =
            self.sessions.write().await.drain().map(|(_, s)| s).collect();
        for session in &drained {
            session.terminate();
        }
        if !drained.is_empty() {
            info!(count = drained.len(), "destroyed all terminal sessions");
        }
        drained.len()
    }

    /// Destroy sessions that have had no active connection for over `idle`.
    ///
    /// Returns the ids that were removed.
    pub async fn reap_detached(&self, idle: Duration) -> Vec<String> {
        let mut sessions = self.sessions.write().await;
        let mut removed = Vec::new();

        sessions.retain(|id, session| match session.detached_since {
            Some(since) if since.elapsed() > idle => {
                warn!(
                    session_id = %id,
                    idle_secs = since.elapsed().as_secs(),
                    "terminal session expired (detached)"
                );
                session.terminate();
                removed.push(id.clone());
                false
            }
            _ => true,
        });

        if !removed.is_empty() {
            debug!(count = removed.len(), "reaped detached sessions");
        }
        removed
    }

    /// Ids of all live sessions.
    pub async fn list(&self) -> Vec<String> {
        self.sessions.read().await.keys().cloned().collect()
    }

    /// Get the number of live sessions.
    pub async fn count(&self) -> usize {
        self.sessions.read().await.len()
    }
}

fn set_active(session: &mut PtySession, connection: Option<ConnectionHandle>) {
    let previous = session.active_connection.as_ref().map(ConnectionHandle::id);
    let next = connection.as_ref().map(ConnectionHandle::id);
    session.detached_since = match (&connection, session.detached_since) {
        (Some(_), _) => None,
        (None, Some(since)) => Some(since),
        (None, None) => Some(Instant::now()),
    };
    session.active_connection = connection;
    debug!(
        session_id = %session.chat_session_id,
        ?previous,
        ?next,
        "active connection changed"
    );
}
