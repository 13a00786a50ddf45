//! Playback endpoints
//!
//! Both endpoints read a manifest from the session directory and rewrite its
//! segment lines to absolute URLs under the static segment route.

use axum::{
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode, Uri},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

use super::{invalid_key, AppState, ErrorResponse};
use crate::key::SessionKey;
use crate::manifest::{resolve_host, resolve_scheme, rewrite_manifest, segment_base_url};
use crate::timelapse::TimelapseOutcome;

const HLS_CONTENT_TYPE: &str = "application/vnd.apple.mpegurl";

/// Body of a `202 Accepted` timelapse response
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GeneratingResponse {
    pub status: &'static str,
    pub message: String,
    pub user_id: String,
    pub challenge_num: String,
}

/// Live manifest
///
/// GET /watch/:user_id/:challenge_num
pub async fn watch(
    State(state): State<AppState>,
    Path((user_id, challenge_num)): Path<(String, String)>,
    headers: HeaderMap,
    uri: Uri,
) -> Response {
    let key = match SessionKey::new(&user_id, &challenge_num) {
        Ok(key) => key,
        Err(e) => return invalid_key(e, &user_id, &challenge_num),
    };

    let layout = state.controller.layout(key.clone());
    match tokio::fs::read_to_string(layout.live_playlist()).await {
        Ok(manifest) => serve_manifest(&state, &key, &manifest, &headers, &uri),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => (
            StatusCode::NOT_FOUND,
            Json(ErrorResponse::for_stream(
                "stream_not_found",
                format!("No live stream available for {}", key),
                &user_id,
                &challenge_num,
            )),
        )
            .into_response(),
        Err(e) => {
            tracing::error!(session_key = %key, error = %e, "Failed to read live manifest");
            read_failure(e, &user_id, &challenge_num)
        }
    }
}

/// Accelerated rendition manifest
///
/// GET /timelapse/:user_id/:challenge_num
pub async fn timelapse(
    State(state): State<AppState>,
    Path((user_id, challenge_num)): Path<(String, String)>,
    headers: HeaderMap,
    uri: Uri,
) -> Response {
    let key = match SessionKey::new(&user_id, &challenge_num) {
        Ok(key) => key,
        Err(e) => return invalid_key(e, &user_id, &challenge_num),
    };

    match state.controller.request_timelapse(key.clone()).await {
        TimelapseOutcome::Ready(path) => match tokio::fs::read_to_string(&path).await {
            Ok(manifest) => serve_manifest(&state, &key, &manifest, &headers, &uri),
            Err(e) => {
                tracing::error!(session_key = %key, error = %e, "Failed to read timelapse manifest");
                read_failure(e, &user_id, &challenge_num)
            }
        },
        TimelapseOutcome::InProgress => (
            StatusCode::ACCEPTED,
            Json(GeneratingResponse {
                status: "generating",
                message: "Timelapse is being generated, retry shortly".to_string(),
                user_id,
                challenge_num,
            }),
        )
            .into_response(),
        TimelapseOutcome::SourceMissing => (
            StatusCode::NOT_FOUND,
            Json(ErrorResponse::for_stream(
                "recording_not_found",
                format!("No recording available for {}", key),
                &user_id,
                &challenge_num,
            )),
        )
            .into_response(),
        TimelapseOutcome::Failed(reason) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorResponse::for_stream(
                "timelapse_failed",
                reason,
                &user_id,
                &challenge_num,
            )),
        )
            .into_response(),
    }
}

fn serve_manifest(
    state: &AppState,
    key: &SessionKey,
    manifest: &str,
    headers: &HeaderMap,
    uri: &Uri,
) -> Response {
    let scheme = resolve_scheme(headers, uri);
    let host = resolve_host(headers, &state.config.server.public_host);
    let base = segment_base_url(
        &scheme,
        &host,
        &state.config.storage.public_prefix,
        key.as_str(),
    );

    (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, HLS_CONTENT_TYPE),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        rewrite_manifest(manifest, &base),
    )
        .into_response()
}

fn read_failure(e: std::io::Error, user_id: &str, challenge_num: &str) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorResponse::for_stream(
            "manifest_unreadable",
            e.to_string(),
            user_id,
            challenge_num,
        )),
    )
        .into_response()
}
