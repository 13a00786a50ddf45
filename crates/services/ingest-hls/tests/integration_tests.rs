//! Integration tests for the Live Ingest HLS Gateway
//!
//! These tests drive the HTTP router and the stream controller end to end,
//! with shell scripts standing in for ffmpeg.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use tower::ServiceExt;
use uuid::Uuid;

use remotemedia_ingest_hls::api::{build_router, AppState};
use remotemedia_ingest_hls::config::Config;
use remotemedia_ingest_hls::controller::StreamController;
use remotemedia_ingest_hls::encoder::{wait_terminal, ProcessSpec, SupervisorState};
use remotemedia_ingest_hls::key::SessionKey;
use remotemedia_ingest_hls::layout::SessionLayout;
use remotemedia_ingest_hls::session::SessionState;
use remotemedia_ingest_hls::transcoder::Transcoder;

const LIVE_MANIFEST: &str = "#EXTM3U\n#EXT-X-VERSION:3\n#EXT-X-TARGETDURATION:2\n#EXT-X-MEDIA-SEQUENCE:0\n#EXTINF:2.000000,\nlive_00000.ts\n#EXTINF:2.000000,\nlive_00001.ts\n";

/// Transcoder that runs shell scripts in the session directory
struct ScriptTranscoder {
    live: String,
    timelapse: String,
}

impl ScriptTranscoder {
    fn new(live: &str, timelapse: &str) -> Self {
        Self {
            live: live.to_string(),
            timelapse: timelapse.to_string(),
        }
    }

    /// Live encoder that idles; timelapse that publishes immediately
    fn idle() -> Self {
        Self::new(
            "sleep 30",
            "printf '#EXTM3U\\n#EXTINF:2.0,\\ntimelapse_00000.ts\\n#EXT-X-ENDLIST\\n' > timelapse.m3u8.tmp",
        )
    }
}

impl Transcoder for ScriptTranscoder {
    fn live(&self, layout: &SessionLayout) -> ProcessSpec {
        ProcessSpec::new("sh")
            .args(["-c", self.live.as_str()])
            .current_dir(layout.dir())
    }

    fn timelapse(&self, layout: &SessionLayout) -> ProcessSpec {
        ProcessSpec::new("sh")
            .args(["-c", self.timelapse.as_str()])
            .current_dir(layout.dir())
    }
}

fn test_config(root: &Path) -> Config {
    let mut config = Config::default();
    config.storage.streams_dir = root.to_path_buf();
    config.encoder.warmup_ms = 0;
    config.encoder.restart_backoff_ms = 50;
    config.encoder.stop_grace_ms = 1000;
    config
}

fn app(config: Config, transcoder: ScriptTranscoder) -> (Router, Arc<StreamController>) {
    let config = Arc::new(config);
    let controller = Arc::new(StreamController::new(&config, Arc::new(transcoder)));
    let router = build_router(AppState::new(controller.clone(), config));
    (router, controller)
}

fn key(user: &str, challenge: &str) -> SessionKey {
    SessionKey::new(user, challenge).unwrap()
}

async fn get(router: &Router, uri: &str) -> (StatusCode, String) {
    let response = router
        .clone()
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    (status, String::from_utf8_lossy(&body).into_owned())
}

async fn wait_for<F: Fn() -> bool>(condition: F) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("condition not reached in time");
}

fn write_live_manifest(root: &Path, dir: &str) {
    let dir = root.join(dir);
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join("live.m3u8"), LIVE_MANIFEST).unwrap();
}

#[tokio::test]
async fn test_status_and_health() {
    let temp = tempfile::tempdir().unwrap();
    let (router, _) = app(test_config(temp.path()), ScriptTranscoder::idle());

    let (status, body) = get(&router, "/").await;
    assert_eq!(status, StatusCode::OK);
    let json: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(json["status"], "ok");
    assert_eq!(json["activeSessions"], 0);

    let (status, body) = get(&router, "/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "OK");

    let (status, body) = get(&router, "/metrics").await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.contains("sessions_started"));
}

#[tokio::test]
async fn test_watch_before_and_after_manifest() {
    let temp = tempfile::tempdir().unwrap();
    let (router, _) = app(test_config(temp.path()), ScriptTranscoder::idle());

    let (status, body) = get(&router, "/watch/u1/5").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let json: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(json["userId"], "u1");
    assert_eq!(json["challengeNum"], "5");

    write_live_manifest(temp.path(), "u1_5");

    let response = router
        .clone()
        .oneshot(
            Request::builder()
                .uri("/watch/u1/5")
                .header(header::HOST, "media.example.com")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()[header::CONTENT_TYPE],
        "application/vnd.apple.mpegurl"
    );
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let manifest = String::from_utf8(body.to_vec()).unwrap();

    assert!(manifest.starts_with("#EXTM3U\n#EXT-X-VERSION:3\n"));
    assert!(manifest.contains("\nhttp://media.example.com/streams/u1_5/live_00000.ts\n"));
    assert!(manifest.contains("\nhttp://media.example.com/streams/u1_5/live_00001.ts\n"));
    assert!(!manifest.contains("\nlive_00000.ts"));
}

#[tokio::test]
async fn test_watch_honours_forwarded_proto() {
    let temp = tempfile::tempdir().unwrap();
    let (router, _) = app(test_config(temp.path()), ScriptTranscoder::idle());
    write_live_manifest(temp.path(), "u1_5");

    let response = router
        .clone()
        .oneshot(
            Request::builder()
                .uri("/watch/u1/5")
                .header(header::HOST, "media.example.com")
                .header("x-forwarded-proto", "https")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    let body = response.into_body().collect().await.unwrap().to_bytes();
    let manifest = String::from_utf8(body.to_vec()).unwrap();
    assert!(manifest.contains("https://media.example.com/streams/u1_5/live_00000.ts"));
}

#[tokio::test]
async fn test_invalid_key_is_rejected() {
    let temp = tempfile::tempdir().unwrap();
    let (router, _) = app(test_config(temp.path()), ScriptTranscoder::idle());

    for uri in ["/watch/u.1/5", "/timelapse/u1/..", "/api/streams/u1/%2E%2E"] {
        let (status, body) = get(&router, uri).await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "{}", uri);
        let json: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(json["error"], "invalid_key");
    }
}

#[tokio::test]
async fn test_segments_are_served_statically() {
    let temp = tempfile::tempdir().unwrap();
    let (router, _) = app(test_config(temp.path()), ScriptTranscoder::idle());
    let dir = temp.path().join("u1_5");
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join("live_00000.ts"), b"segment bytes").unwrap();

    let (status, body) = get(&router, "/streams/u1_5/live_00000.ts").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "segment bytes");
}

#[tokio::test]
async fn test_timelapse_without_recording() {
    let temp = tempfile::tempdir().unwrap();
    let (router, _) = app(test_config(temp.path()), ScriptTranscoder::idle());

    let (status, body) = get(&router, "/timelapse/u1/5").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let json: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(json["userId"], "u1");
}

#[cfg(unix)]
#[tokio::test]
async fn test_timelapse_ready_and_cached() {
    let temp = tempfile::tempdir().unwrap();
    let (router, _) = app(test_config(temp.path()), ScriptTranscoder::idle());
    let dir = temp.path().join("u1_5");
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join("recording.webm"), b"webm").unwrap();

    let (status, body) = get(&router, "/timelapse/u1/5").await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.contains("/streams/u1_5/timelapse_00000.ts"));
    assert!(body.contains("#EXT-X-ENDLIST"));

    // Cached manifest, no 404 once the recording exists
    let (status, _) = get(&router, "/timelapse/u1/5").await;
    assert_eq!(status, StatusCode::OK);
    assert!(!dir.join("timelapse.m3u8.tmp").exists());
}

#[cfg(unix)]
#[tokio::test]
async fn test_timelapse_generating_then_ready() {
    let temp = tempfile::tempdir().unwrap();
    let mut config = test_config(temp.path());
    config.timelapse.initiator_wait_ms = 0;
    let transcoder = ScriptTranscoder::new(
        "sleep 30",
        "sleep 0.3; printf '#EXTM3U\\ntimelapse_00000.ts\\n' > timelapse.m3u8.tmp",
    );
    let (router, controller) = app(config, transcoder);
    let dir = temp.path().join("u1_5");
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join("recording.webm"), b"webm").unwrap();

    let (status, body) = get(&router, "/timelapse/u1/5").await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let json: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(json["status"], "generating");

    // Second request while running never starts another job
    let (status, _) = get(&router, "/timelapse/u1/5").await;
    assert_eq!(status, StatusCode::ACCEPTED);

    let gate_key = key("u1", "5");
    wait_for(|| {
        !matches!(
            controller.timelapse().status(&gate_key),
            remotemedia_ingest_hls::timelapse::JobStatus::Running
        )
    })
    .await;

    let (status, body) = get(&router, "/timelapse/u1/5").await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.contains("/streams/u1_5/timelapse_00000.ts"));
}

#[cfg(unix)]
#[tokio::test]
async fn test_timelapse_failure_is_500() {
    let temp = tempfile::tempdir().unwrap();
    let transcoder = ScriptTranscoder::new("sleep 30", "echo 'no decoder' >&2; exit 1");
    let (router, _) = app(test_config(temp.path()), transcoder);
    let dir = temp.path().join("u1_5");
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join("recording.webm"), b"webm").unwrap();

    let (status, body) = get(&router, "/timelapse/u1/5").await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    let json: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(json["error"], "timelapse_failed");
    assert!(json["message"].as_str().unwrap().contains("no decoder"));
}

#[cfg(unix)]
#[tokio::test]
async fn test_session_status_endpoints() {
    let temp = tempfile::tempdir().unwrap();
    let (router, controller) = app(test_config(temp.path()), ScriptTranscoder::idle());

    controller
        .start_stream(key("u1", "5"), Uuid::new_v4())
        .await
        .unwrap();
    controller.append_chunk(&key("u1", "5"), &[0u8; 64]).await.unwrap();

    let (status, body) = get(&router, "/api/streams").await;
    assert_eq!(status, StatusCode::OK);
    let json: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(json["count"], 1);
    assert_eq!(json["sessions"][0]["streamKey"], "u1_5");

    let (status, body) = get(&router, "/api/streams/u1/5").await;
    assert_eq!(status, StatusCode::OK);
    let json: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(json["bytesWritten"], 64);
    assert_eq!(json["timelapse"]["status"], "idle");

    let (status, _) = get(&router, "/api/streams/u2/1").await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    controller.shutdown().await;
}

#[cfg(unix)]
#[tokio::test]
async fn test_session_reaches_encoding_and_stops_encoder() {
    let temp = tempfile::tempdir().unwrap();
    let (_, controller) = app(test_config(temp.path()), ScriptTranscoder::idle());

    let session = controller
        .start_stream(key("u1", "5"), Uuid::new_v4())
        .await
        .unwrap();
    wait_for(|| session.state() == SessionState::Encoding).await;
    let encoder_state = session.encoder_state();
    assert!(matches!(encoder_state, Some(SupervisorState::Running { attempt: 0 })));

    assert!(controller.stop_stream(&key("u1", "5")).await);
    assert_eq!(session.state(), SessionState::Stopped);
    assert!(session.encoder_state().is_none());

    // Second stop is a no-op
    assert!(!controller.stop_stream(&key("u1", "5")).await);
}

#[cfg(unix)]
#[tokio::test]
async fn test_live_encoder_failure_is_not_surfaced() {
    let temp = tempfile::tempdir().unwrap();
    let transcoder = ScriptTranscoder::new("exit 1", "exit 1");
    let (_, controller) = app(test_config(temp.path()), transcoder);

    let session = controller
        .start_stream(key("u1", "5"), Uuid::new_v4())
        .await
        .unwrap();
    wait_for(|| session.encoder_state() == Some(SupervisorState::Dead)).await;

    // Ingest keeps working after the encoder gave up
    controller.append_chunk(&key("u1", "5"), b"more").await.unwrap();
    assert!(session.is_active());

    controller.stop_stream(&key("u1", "5")).await;
}

#[cfg(unix)]
#[tokio::test]
async fn test_duplicate_start_replaces_session() {
    let temp = tempfile::tempdir().unwrap();
    let (_, controller) = app(test_config(temp.path()), ScriptTranscoder::idle());

    let first = controller
        .start_stream(key("u1", "5"), Uuid::new_v4())
        .await
        .unwrap();
    controller.append_chunk(&key("u1", "5"), b"first take").await.unwrap();

    let second = controller
        .start_stream(key("u1", "5"), Uuid::new_v4())
        .await
        .unwrap();
    controller.append_chunk(&key("u1", "5"), b"second").await.unwrap();

    assert_eq!(first.state(), SessionState::Stopped);
    assert!(first.encoder_state().is_none());
    assert!(second.is_active());
    assert_eq!(controller.registry().len().await, 1);

    let recording = std::fs::read(temp.path().join("u1_5/recording.webm")).unwrap();
    assert_eq!(recording, b"second");

    controller.shutdown().await;
}

#[cfg(unix)]
#[tokio::test]
async fn test_disconnect_tears_down_each_session_once() {
    let temp = tempfile::tempdir().unwrap();
    let (_, controller) = app(test_config(temp.path()), ScriptTranscoder::idle());
    let conn = Uuid::new_v4();

    let sessions = [
        controller.start_stream(key("u1", "1"), conn).await.unwrap(),
        controller.start_stream(key("u1", "2"), conn).await.unwrap(),
    ];
    for session in &sessions {
        wait_for(|| session.state() == SessionState::Encoding).await;
    }
    let encoders: Vec<_> = sessions
        .iter()
        .map(|session| session.subscribe_encoder().unwrap())
        .collect();

    assert_eq!(controller.disconnect(conn).await, 2);
    assert_eq!(controller.disconnect(conn).await, 0);

    for rx in encoders {
        let state = tokio::time::timeout(Duration::from_secs(5), wait_terminal(rx))
            .await
            .unwrap();
        assert_eq!(state, SupervisorState::Stopped);
    }

    for session in &sessions {
        assert_eq!(session.state(), SessionState::Stopped);
        assert!(session.encoder_state().is_none());
        assert!(!session.shutdown().await);
    }
    assert!(controller.registry().is_empty().await);
}

#[cfg(unix)]
#[tokio::test]
async fn test_replaced_encoder_exits_before_directory_reuse() {
    let temp = tempfile::tempdir().unwrap();
    // The old encoder finalizes its playlist only once signalled
    let live = r##"trap 'printf "#EXTM3U\nOLD_00000.ts\n#EXT-X-ENDLIST\n" > live.m3u8; exit 0' TERM; touch ready; while :; do sleep 0.05; done"##;
    let (_, controller) = app(test_config(temp.path()), ScriptTranscoder::new(live, "exit 1"));
    let dir = temp.path().join("u1_5");

    let first = controller
        .start_stream(key("u1", "5"), Uuid::new_v4())
        .await
        .unwrap();
    wait_for(|| first.state() == SessionState::Encoding && dir.join("ready").exists()).await;
    let rx = first.subscribe_encoder().unwrap();

    let second = controller
        .start_stream(key("u1", "5"), Uuid::new_v4())
        .await
        .unwrap();

    // Replacement returns only after the old encoder is gone
    assert_eq!(*rx.borrow(), SupervisorState::Stopped);
    assert!(second.is_active());

    tokio::time::sleep(Duration::from_millis(500)).await;
    let manifest = std::fs::read_to_string(dir.join("live.m3u8")).unwrap_or_default();
    assert!(!manifest.contains("OLD_00000"), "{}", manifest);

    controller.shutdown().await;
}

#[cfg(unix)]
#[tokio::test]
async fn test_shutdown_waits_for_encoders_to_finalize() {
    let temp = tempfile::tempdir().unwrap();
    let live = "trap 'sleep 0.2; touch finalized; exit 0' TERM; touch ready; while :; do sleep 0.05; done";
    let (_, controller) = app(test_config(temp.path()), ScriptTranscoder::new(live, "exit 1"));

    let keys = [key("u1", "1"), key("u1", "2")];
    let mut encoders = Vec::new();
    for key in &keys {
        let session = controller.start_stream(key.clone(), Uuid::new_v4()).await.unwrap();
        let ready = temp.path().join(key.as_str()).join("ready");
        wait_for(|| session.state() == SessionState::Encoding && ready.exists()).await;
        encoders.push(session.subscribe_encoder().unwrap());
    }

    controller.shutdown().await;

    for rx in &encoders {
        assert_eq!(*rx.borrow(), SupervisorState::Stopped);
    }
    for key in &keys {
        assert!(temp.path().join(key.as_str()).join("finalized").exists());
    }
    assert!(controller.registry().is_empty().await);
}
