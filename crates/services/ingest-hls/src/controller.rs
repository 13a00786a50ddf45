//! Stream orchestration
//!
//! [`StreamController`] ties the registry, the encoder supervisor and the
//! timelapse gate together behind the operations the control channel and the
//! HTTP handlers need.
//!
//! Teardown always closes the ingest sink before the encoder is signalled,
//! and happens at most once per session regardless of whether it was
//! triggered by `stop-stream`, a replacing `start-stream`, or a disconnect.

use futures::future::join_all;
use std::sync::Arc;

use crate::config::Config;
use crate::encoder::{StateCallback, SupervisorState, TranscodeSupervisor};
use crate::key::SessionKey;
use crate::layout::SessionLayout;
use crate::metrics::global_metrics;
use crate::session::{ConnectionId, SessionError, SessionRegistry, StreamSession};
use crate::timelapse::{TimelapseGate, TimelapseOutcome};
use crate::transcoder::{FfmpegTranscoder, Transcoder};

/// Orchestrates capture sessions and their encoders
pub struct StreamController {
    registry: SessionRegistry,
    supervisor: TranscodeSupervisor,
    transcoder: Arc<dyn Transcoder>,
    timelapse: TimelapseGate,
}

impl StreamController {
    pub fn new(config: &Config, transcoder: Arc<dyn Transcoder>) -> Self {
        let supervisor = TranscodeSupervisor::new(config.encoder.supervisor());
        let registry =
            SessionRegistry::new(&config.storage.streams_dir, config.limits.max_sessions)
                .with_replace_wait(supervisor.config().termination_timeout());

        Self {
            registry,
            supervisor,
            timelapse: TimelapseGate::new(transcoder.clone(), config.timelapse.initiator_wait()),
            transcoder,
        }
    }

    /// Controller backed by ffmpeg
    pub fn from_config(config: &Config) -> Self {
        Self::new(config, Arc::new(FfmpegTranscoder::from_config(config)))
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn timelapse(&self) -> &TimelapseGate {
        &self.timelapse
    }

    /// On-disk layout for `key`, whether or not a session is active
    pub fn layout(&self, key: SessionKey) -> SessionLayout {
        SessionLayout::new(self.registry.streams_dir(), key)
    }

    /// Open a session and schedule its live encoder
    ///
    /// A session already active under `key` is torn down and replaced.
    pub async fn start_stream(
        &self,
        key: SessionKey,
        connection_id: ConnectionId,
    ) -> Result<Arc<StreamSession>, SessionError> {
        let session = self.registry.open(key.clone(), connection_id).await?;
        let spec = self.transcoder.live(session.layout());

        let weak = Arc::downgrade(&session);
        let on_state: StateCallback = Arc::new(move |state| {
            if let SupervisorState::Running { .. } = state {
                if let Some(session) = weak.upgrade() {
                    if session.mark_encoding() {
                        tracing::info!(session_key = %session.key, "Session encoding");
                    }
                }
            }
        });

        tracing::debug!(session_key = %key, command = %spec.command_line(), "Scheduling live encoder");
        let handle = self.supervisor.start(key, spec, Some(on_state));
        session.attach_encoder(handle);

        Ok(session)
    }

    /// Append a chunk to the session's ingest file
    pub async fn append_chunk(&self, key: &SessionKey, bytes: &[u8]) -> Result<u64, SessionError> {
        let session = self
            .registry
            .lookup(key)
            .await
            .ok_or_else(|| SessionError::NotFound(key.clone()))?;

        let total = session.append(bytes).await?;
        global_metrics().chunk_received(bytes.len() as u64);
        Ok(total)
    }

    /// Tear down the session under `key`; absent keys are a no-op
    ///
    /// Returns whether a session was torn down.
    pub async fn stop_stream(&self, key: &SessionKey) -> bool {
        match self.registry.remove(key).await {
            Some(session) => session.shutdown().await,
            None => {
                tracing::debug!(session_key = %key, "Stop for inactive session ignored");
                false
            }
        }
    }

    /// Tear down every session opened by a closed connection
    pub async fn disconnect(&self, connection_id: ConnectionId) -> usize {
        let sessions = self.registry.remove_all_owned_by(connection_id).await;
        let mut torn_down = 0;
        for session in sessions {
            if session.shutdown().await {
                torn_down += 1;
            }
        }

        if torn_down > 0 {
            tracing::info!(connection = %connection_id, sessions = torn_down, "Connection closed, sessions torn down");
        }
        torn_down
    }

    /// Serve or start the accelerated rendition for `key`
    pub async fn request_timelapse(&self, key: SessionKey) -> TimelapseOutcome {
        self.timelapse.request(&self.layout(key)).await
    }

    /// Tear down all sessions and wait for their encoders to exit
    ///
    /// Each encoder gets its stop grace period to finalize its playlist
    /// before the caller moves on.
    pub async fn shutdown(&self) {
        let sessions = self.registry.drain().await;
        let limit = self.supervisor.config().termination_timeout();

        join_all(
            sessions
                .iter()
                .map(|session| session.shutdown_and_wait(limit)),
        )
        .await;

        if !sessions.is_empty() {
            tracing::info!(sessions = sessions.len(), "All sessions torn down");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn controller(root: &std::path::Path) -> StreamController {
        let mut config = Config::default();
        config.storage.streams_dir = root.to_path_buf();
        // Never reached in these tests
        config.encoder.warmup_ms = 60_000;
        StreamController::from_config(&config)
    }

    fn key() -> SessionKey {
        SessionKey::new("u1", "5").unwrap()
    }

    #[tokio::test]
    async fn test_stop_without_session_is_noop() {
        let temp = tempfile::tempdir().unwrap();
        let controller = controller(temp.path());

        assert!(!controller.stop_stream(&key()).await);
        assert!(controller.registry().is_empty().await);
    }

    #[tokio::test]
    async fn test_chunk_without_session_is_rejected() {
        let temp = tempfile::tempdir().unwrap();
        let controller = controller(temp.path());

        assert!(matches!(
            controller.append_chunk(&key(), b"data").await,
            Err(SessionError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_chunks_are_concatenated_in_order() {
        let temp = tempfile::tempdir().unwrap();
        let controller = controller(temp.path());
        controller.start_stream(key(), Uuid::new_v4()).await.unwrap();

        let chunks = [vec![1u8; 100], vec![2u8; 200], vec![3u8; 150]];
        for chunk in &chunks {
            controller.append_chunk(&key(), chunk).await.unwrap();
        }
        assert!(controller.stop_stream(&key()).await);

        let written = std::fs::read(temp.path().join("u1_5").join("recording.webm")).unwrap();
        assert_eq!(written.len(), 450);
        assert_eq!(written, chunks.concat());
    }

    #[tokio::test]
    async fn test_disconnect_tears_down_owned_sessions_once() {
        let temp = tempfile::tempdir().unwrap();
        let controller = controller(temp.path());
        let conn = Uuid::new_v4();

        let a = controller
            .start_stream(SessionKey::new("u1", "1").unwrap(), conn)
            .await
            .unwrap();
        let b = controller
            .start_stream(SessionKey::new("u1", "2").unwrap(), conn)
            .await
            .unwrap();
        controller
            .start_stream(SessionKey::new("u2", "1").unwrap(), Uuid::new_v4())
            .await
            .unwrap();

        assert_eq!(controller.disconnect(conn).await, 2);
        assert_eq!(controller.disconnect(conn).await, 0);

        assert!(!a.is_active());
        assert!(!b.is_active());
        assert_eq!(controller.registry().len().await, 1);
    }

    #[tokio::test]
    async fn test_shutdown_drains_registry() {
        let temp = tempfile::tempdir().unwrap();
        let controller = controller(temp.path());
        let session = controller.start_stream(key(), Uuid::new_v4()).await.unwrap();

        controller.shutdown().await;

        assert!(!session.is_active());
        assert!(controller.registry().is_empty().await);
    }
}
