//! Session management for live capture ingest
//!
//! This module handles the lifecycle of capture sessions, from creation to
//! teardown. Each [`StreamSession`] owns its ingest sink and, once started,
//! its encoder handle; the [`SessionRegistry`] owns every session.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex as SyncMutex, RwLock as SyncRwLock};
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, RwLock};
use uuid::Uuid;

use crate::encoder::{wait_terminal, EncoderHandle, SupervisorConfig, SupervisorState};
use crate::key::SessionKey;
use crate::layout::SessionLayout;
use crate::metrics::global_metrics;
use crate::sink::{IngestSink, SinkError};

/// Identifier of the control connection that opened a session
pub type ConnectionId = Uuid;

/// Session lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Accepting chunks, encoder not running yet
    Initializing,

    /// Encoder has been spawned against the ingest file
    Encoding,

    /// Torn down; no further chunks are accepted
    Stopped,
}

/// One active (or just torn down) capture session
pub struct StreamSession {
    /// Session key
    pub key: SessionKey,

    /// Control connection that owns the session
    pub connection_id: ConnectionId,

    /// When the session was created
    pub created_at: DateTime<Utc>,

    layout: SessionLayout,

    sink: Mutex<IngestSink>,

    /// Encoder slot; lifecycle changes to `Stopped` happen under this lock
    encoder: SyncMutex<Option<EncoderHandle>>,

    state: SyncRwLock<SessionState>,
}

impl StreamSession {
    /// Allocate the session directory and open a fresh ingest sink
    pub async fn create(
        key: SessionKey,
        connection_id: ConnectionId,
        streams_dir: impl AsRef<Path>,
    ) -> Result<Self, SessionError> {
        let layout = SessionLayout::new(streams_dir, key.clone());
        layout.ensure_dir().await?;
        layout.clear_live_playlist().await?;
        let sink = IngestSink::create(layout.ingest_path()).await?;

        Ok(Self {
            key,
            connection_id,
            created_at: Utc::now(),
            layout,
            sink: Mutex::new(sink),
            encoder: SyncMutex::new(None),
            state: SyncRwLock::new(SessionState::Initializing),
        })
    }

    pub fn layout(&self) -> &SessionLayout {
        &self.layout
    }

    /// Get the current session state
    pub fn state(&self) -> SessionState {
        *self.state.read()
    }

    /// Check if the session still accepts chunks
    pub fn is_active(&self) -> bool {
        self.state() != SessionState::Stopped
    }

    /// Transition `Initializing -> Encoding`; returns whether the state changed
    pub fn mark_encoding(&self) -> bool {
        let mut state = self.state.write();
        if *state == SessionState::Initializing {
            *state = SessionState::Encoding;
            true
        } else {
            false
        }
    }

    /// Append one chunk to the ingest file
    ///
    /// Returns the total number of bytes written so far.
    pub async fn append(&self, bytes: &[u8]) -> Result<u64, SessionError> {
        if !self.is_active() {
            return Err(SessionError::NotActive(self.key.clone()));
        }

        let mut sink = self.sink.lock().await;
        match sink.append(bytes).await {
            Ok(total) => Ok(total),
            // Lost the race against a concurrent teardown
            Err(SinkError::Closed) => Err(SessionError::NotActive(self.key.clone())),
            Err(e) => Err(e.into()),
        }
    }

    /// Hand the encoder handle to the session
    ///
    /// A session that was torn down in the meantime stops the handle
    /// immediately.
    pub fn attach_encoder(&self, handle: EncoderHandle) {
        let mut slot = self.encoder.lock();
        if self.state() == SessionState::Stopped {
            drop(slot);
            handle.stop();
            return;
        }
        if let Some(previous) = slot.replace(handle) {
            previous.stop();
        }
    }

    /// Current encoder supervisor state, if an encoder was attached
    pub fn encoder_state(&self) -> Option<SupervisorState> {
        self.encoder.lock().as_ref().map(EncoderHandle::state)
    }

    /// Observe the attached encoder's state changes
    pub fn subscribe_encoder(&self) -> Option<watch::Receiver<SupervisorState>> {
        self.encoder.lock().as_ref().map(EncoderHandle::subscribe)
    }

    /// Tear the session down: close the sink, then signal the encoder
    ///
    /// Only the first call does any work and returns `true`.
    pub async fn shutdown(&self) -> bool {
        {
            let mut state = self.state.write();
            if *state == SessionState::Stopped {
                return false;
            }
            *state = SessionState::Stopped;
        }

        {
            let mut sink = self.sink.lock().await;
            if let Err(e) = sink.close().await {
                tracing::error!(session_key = %self.key, error = %e, "Failed to close ingest sink");
            }
        }

        let handle = self.encoder.lock().take();
        if let Some(handle) = handle {
            handle.stop();
        }

        global_metrics().session_stopped();
        tracing::info!(session_key = %self.key, "Session stopped");
        true
    }

    /// Tear the session down and wait, up to `limit`, for the encoder to exit
    ///
    /// Used where the session directory is about to be reused or the process
    /// is exiting, so the encoder gets to finish its final writes first.
    pub async fn shutdown_and_wait(&self, limit: Duration) -> bool {
        let encoder = self.subscribe_encoder();
        let torn_down = self.shutdown().await;

        if let Some(rx) = encoder {
            match tokio::time::timeout(limit, wait_terminal(rx)).await {
                Ok(state) => {
                    tracing::debug!(session_key = %self.key, ?state, "Encoder terminated");
                }
                Err(_) => {
                    tracing::warn!(
                        session_key = %self.key,
                        limit_ms = limit.as_millis() as u64,
                        "Encoder still running after teardown"
                    );
                }
            }
        }
        torn_down
    }

    /// Snapshot for the status API
    pub async fn status(&self) -> SessionStatus {
        let (bytes_written, chunks_written) = {
            let sink = self.sink.lock().await;
            (sink.bytes_written(), sink.chunks_written())
        };

        SessionStatus {
            stream_key: self.key.clone(),
            state: self.state(),
            created_at: self.created_at.to_rfc3339(),
            bytes_written,
            chunks_written,
            encoder: self.encoder_state(),
        }
    }
}

/// Session status returned by the status API
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatus {
    pub stream_key: SessionKey,
    pub state: SessionState,
    pub created_at: String,
    pub bytes_written: u64,
    pub chunks_written: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encoder: Option<SupervisorState>,
}

/// Registry of all active sessions
pub struct SessionRegistry {
    sessions: RwLock<HashMap<SessionKey, Arc<StreamSession>>>,
    streams_dir: PathBuf,
    max_sessions: usize,
    /// How long `open` waits for a replaced session's encoder to exit
    replace_wait: Duration,
}

impl SessionRegistry {
    /// Create a new session registry
    pub fn new(streams_dir: impl Into<PathBuf>, max_sessions: usize) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            streams_dir: streams_dir.into(),
            max_sessions,
            replace_wait: SupervisorConfig::default().termination_timeout(),
        }
    }

    /// Bound the wait for a replaced session's encoder
    pub fn with_replace_wait(mut self, replace_wait: Duration) -> Self {
        self.replace_wait = replace_wait;
        self
    }

    pub fn streams_dir(&self) -> &Path {
        &self.streams_dir
    }

    /// Create and register a session under `key`
    ///
    /// An active session under the same key is torn down first
    /// (terminate-then-replace) and its encoder is given up to the replace
    /// wait to exit before the directory is reused. The registry stays
    /// locked throughout so no two sinks or encoders for one key coexist.
    pub async fn open(
        &self,
        key: SessionKey,
        connection_id: ConnectionId,
    ) -> Result<Arc<StreamSession>, SessionError> {
        let mut sessions = self.sessions.write().await;

        if let Some(existing) = sessions.remove(&key) {
            tracing::warn!(
                session_key = %key,
                previous_connection = %existing.connection_id,
                connection = %connection_id,
                "Session already active, replacing it"
            );
            existing.shutdown_and_wait(self.replace_wait).await;
            global_metrics().session_replaced();
        } else if sessions.len() >= self.max_sessions {
            return Err(SessionError::MaxSessionsReached);
        }

        let session =
            Arc::new(StreamSession::create(key.clone(), connection_id, &self.streams_dir).await?);
        sessions.insert(key.clone(), session.clone());

        global_metrics().session_started();
        tracing::info!(session_key = %key, connection = %connection_id, "Session opened");

        Ok(session)
    }

    /// Get a session by key
    pub async fn lookup(&self, key: &SessionKey) -> Option<Arc<StreamSession>> {
        self.sessions.read().await.get(key).cloned()
    }

    /// Detach a session for teardown; absent keys yield `None`
    pub async fn remove(&self, key: &SessionKey) -> Option<Arc<StreamSession>> {
        self.sessions.write().await.remove(key)
    }

    /// Detach every session owned by a connection
    pub async fn remove_all_owned_by(&self, connection_id: ConnectionId) -> Vec<Arc<StreamSession>> {
        let mut sessions = self.sessions.write().await;
        let owned: Vec<SessionKey> = sessions
            .iter()
            .filter(|(_, session)| session.connection_id == connection_id)
            .map(|(key, _)| key.clone())
            .collect();

        owned
            .into_iter()
            .filter_map(|key| sessions.remove(&key))
            .collect()
    }

    /// Detach every session, for process shutdown
    pub async fn drain(&self) -> Vec<Arc<StreamSession>> {
        self.sessions.write().await.drain().map(|(_, session)| session).collect()
    }

    /// Get session count
    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    /// All registered sessions, ordered by key
    pub async fn sessions(&self) -> Vec<Arc<StreamSession>> {
        let sessions = self.sessions.read().await;
        let mut all: Vec<_> = sessions.values().cloned().collect();
        all.sort_by(|a, b| a.key.cmp(&b.key));
        all
    }
}

/// Session-related errors
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("No active session for {0}")]
    NotFound(SessionKey),

    #[error("Session {0} is stopped")]
    NotActive(SessionKey),

    #[error("Maximum sessions reached")]
    MaxSessionsReached,

    #[error("Ingest sink error: {0}")]
    Sink(#[from] SinkError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
