//! HTTP API for the live ingest gateway
//!
//! - `GET /ws` - Session-control WebSocket
//! - `GET /watch/:user_id/:challenge_num` - Live manifest
//! - `GET /timelapse/:user_id/:challenge_num` - Accelerated manifest
//! - `GET /api/streams` - Active sessions
//! - `GET /api/streams/:user_id/:challenge_num` - One session
//! - `GET /` - Service status
//! - `GET /health`, `GET /metrics`
//! - `/{public_prefix}/...` - Segment files from the streams directory

pub mod sessions;
pub mod watch;
pub mod ws;

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Serialize;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::controller::StreamController;
use crate::key::KeyError;
use crate::metrics::{global_metrics, MetricsSnapshot};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    /// Stream controller
    pub controller: Arc<StreamController>,
    /// Service configuration
    pub config: Arc<Config>,
}

impl AppState {
    pub fn new(controller: Arc<StreamController>, config: Arc<Config>) -> Self {
        Self { controller, config }
    }
}

/// Error body shared by the HTTP endpoints
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub challenge_num: Option<String>,
}

impl ErrorResponse {
    pub fn for_stream(
        error: &str,
        message: impl Into<String>,
        user_id: &str,
        challenge_num: &str,
    ) -> Self {
        Self {
            error: error.to_string(),
            message: message.into(),
            user_id: Some(user_id.to_string()),
            challenge_num: Some(challenge_num.to_string()),
        }
    }
}

pub(crate) fn invalid_key(e: KeyError, user_id: &str, challenge_num: &str) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(ErrorResponse::for_stream(
            "invalid_key",
            e.to_string(),
            user_id,
            challenge_num,
        )),
    )
        .into_response()
}

/// Build the HTTP API router
pub fn build_router(state: AppState) -> Router {
    // CORS configuration - players fetch manifests cross-origin
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let segments = ServeDir::new(&state.config.storage.streams_dir);
    let prefix = format!("/{}", state.config.storage.public_prefix.trim_matches('/'));

    Router::new()
        .route("/", get(status_handler))
        .route("/ws", get(ws::ws_handler))
        .route("/watch/:user_id/:challenge_num", get(watch::watch))
        .route("/timelapse/:user_id/:challenge_num", get(watch::timelapse))
        .route("/api/streams", get(sessions::list_sessions))
        .route(
            "/api/streams/:user_id/:challenge_num",
            get(sessions::get_session),
        )
        // Health and metrics
        .route("/health", get(health_check))
        .route("/metrics", get(metrics_handler))
        .nest_service(&prefix, segments)
        // Middleware
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Service status
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub status: &'static str,
    pub active_sessions: usize,
    pub uptime_secs: u64,
    pub version: &'static str,
}

/// GET /
async fn status_handler(State(state): State<AppState>) -> Json<StatusResponse> {
    Json(StatusResponse {
        status: "ok",
        active_sessions: state.controller.registry().len().await,
        uptime_secs: global_metrics().snapshot().uptime_secs,
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// Health check endpoint
async fn health_check() -> &'static str {
    "OK"
}

/// Metrics endpoint
async fn metrics_handler() -> Json<MetricsSnapshot> {
    Json(global_metrics().snapshot())
}
