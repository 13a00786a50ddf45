//! Session status endpoints
//!
//! Read-only views of the registry; sessions are created and ended over the
//! control WebSocket.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

use super::{invalid_key, AppState, ErrorResponse};
use crate::key::SessionKey;
use crate::session::SessionStatus;
use crate::timelapse::JobStatus;

/// Response body for the session list
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionListResponse {
    pub count: usize,
    pub sessions: Vec<SessionStatus>,
}

/// Response body for a single session
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionDetailResponse {
    #[serde(flatten)]
    pub session: SessionStatus,
    pub timelapse: JobStatus,
}

/// List active sessions
///
/// GET /api/streams
pub async fn list_sessions(State(state): State<AppState>) -> Json<SessionListResponse> {
    let mut sessions = Vec::new();
    for session in state.controller.registry().sessions().await {
        sessions.push(session.status().await);
    }

    Json(SessionListResponse {
        count: sessions.len(),
        sessions,
    })
}

/// Get one session's status
///
/// GET /api/streams/:user_id/:challenge_num
pub async fn get_session(
    State(state): State<AppState>,
    Path((user_id, challenge_num)): Path<(String, String)>,
) -> Response {
    let key = match SessionKey::new(&user_id, &challenge_num) {
        Ok(key) => key,
        Err(e) => return invalid_key(e, &user_id, &challenge_num),
    };

    let Some(session) = state.controller.registry().lookup(&key).await else {
        return (
            StatusCode::NOT_FOUND,
            Json(ErrorResponse::for_stream(
                "session_not_found",
                format!("Session {} not found", key),
                &user_id,
                &challenge_num,
            )),
        )
            .into_response();
    };

    (
        StatusCode::OK,
        Json(SessionDetailResponse {
            session: session.status().await,
            timelapse: state.controller.timelapse().status(&key),
        }),
    )
        .into_response()
}
