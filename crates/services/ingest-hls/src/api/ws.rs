//! Session-control WebSocket
//!
//! Clients drive capture sessions over `GET /ws` with JSON text frames:
//!
//! ```text
//! → {"type":"start-stream","userId":"u1","challengeNum":5}
//! ← {"type":"stream-ready","streamKey":"u1_5"}
//! → {"type":"stream-chunk","userId":"u1","challengeNum":5,"chunk":"<base64>"}
//! → {"type":"stop-stream","userId":"u1","challengeNum":5}
//! ← {"type":"stream-stopped","streamKey":"u1_5"}
//! ```
//!
//! Frames are handled one at a time, so chunks reach the ingest file in the
//! order they were sent. Closing the socket tears down every session the
//! connection opened.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
};
use base64::Engine;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Deserializer, Serialize};
use uuid::Uuid;

use super::AppState;
use crate::controller::StreamController;
use crate::key::SessionKey;
use crate::session::ConnectionId;

/// Messages sent by the capture client
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMessage {
    #[serde(rename_all = "camelCase")]
    StartStream {
        #[serde(deserialize_with = "string_or_number")]
        user_id: String,
        #[serde(deserialize_with = "string_or_number")]
        challenge_num: String,
    },

    #[serde(rename_all = "camelCase")]
    StreamChunk {
        #[serde(deserialize_with = "string_or_number")]
        user_id: String,
        #[serde(deserialize_with = "string_or_number")]
        challenge_num: String,
        /// Base64 payload, optionally as a `data:` URL
        chunk: String,
    },

    #[serde(rename_all = "camelCase")]
    StopStream {
        #[serde(deserialize_with = "string_or_number")]
        user_id: String,
        #[serde(deserialize_with = "string_or_number")]
        challenge_num: String,
    },
}

/// Messages sent back to the capture client
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerMessage {
    #[serde(rename_all = "camelCase")]
    StreamReady { stream_key: String },

    #[serde(rename_all = "camelCase")]
    StreamStopped { stream_key: String },

    #[serde(rename_all = "camelCase")]
    StreamError {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        stream_key: Option<String>,
    },
}

impl ServerMessage {
    fn error(message: impl Into<String>, key: Option<&SessionKey>) -> Self {
        ServerMessage::StreamError {
            message: message.into(),
            stream_key: key.map(|k| k.to_string()),
        }
    }
}

fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Id {
        String(String),
        Number(serde_json::Number),
    }

    Ok(match Id::deserialize(deserializer)? {
        Id::String(s) => s,
        Id::Number(n) => n.to_string(),
    })
}

/// WebSocket upgrade handler
///
/// GET /ws
pub async fn ws_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.max_message_size(state.config.limits.max_message_bytes)
        .on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let connection_id: ConnectionId = Uuid::new_v4();
    let (mut sender, mut receiver) = socket.split();

    tracing::info!(connection = %connection_id, "Control connection opened");

    while let Some(msg) = receiver.next().await {
        let reply = match msg {
            Ok(Message::Text(text)) => handle_text(&state.controller, connection_id, &text).await,
            Ok(Message::Binary(_)) => Some(ServerMessage::error(
                "Binary frames are not supported; send JSON text frames",
                None,
            )),
            Ok(Message::Close(_)) => break,
            Ok(_) => None,
            Err(e) => {
                tracing::warn!(connection = %connection_id, error = %e, "Control connection error");
                break;
            }
        };

        if let Some(reply) = reply {
            let json = match serde_json::to_string(&reply) {
                Ok(json) => json,
                Err(e) => {
                    tracing::error!(error = %e, "Failed to serialize control reply");
                    continue;
                }
            };
            if sender.send(Message::Text(json)).await.is_err() {
                break;
            }
        }
    }

    state.controller.disconnect(connection_id).await;
    tracing::info!(connection = %connection_id, "Control connection closed");
}

/// Handle one text frame, returning the reply to send (if any)
pub async fn handle_text(
    controller: &StreamController,
    connection_id: ConnectionId,
    text: &str,
) -> Option<ServerMessage> {
    match serde_json::from_str::<ClientMessage>(text) {
        Ok(msg) => handle_message(controller, connection_id, msg).await,
        Err(e) => {
            tracing::debug!(connection = %connection_id, error = %e, "Malformed control message");
            Some(ServerMessage::error(format!("Invalid message: {}", e), None))
        }
    }
}

/// Dispatch a decoded control message
pub async fn handle_message(
    controller: &StreamController,
    connection_id: ConnectionId,
    msg: ClientMessage,
) -> Option<ServerMessage> {
    match msg {
        ClientMessage::StartStream {
            user_id,
            challenge_num,
        } => {
            let key = match SessionKey::new(&user_id, &challenge_num) {
                Ok(key) => key,
                Err(e) => return Some(ServerMessage::error(e.to_string(), None)),
            };

            match controller.start_stream(key.clone(), connection_id).await {
                Ok(_) => Some(ServerMessage::StreamReady {
                    stream_key: key.to_string(),
                }),
                Err(e) => {
                    tracing::error!(session_key = %key, error = %e, "Failed to start stream");
                    Some(ServerMessage::error(e.to_string(), Some(&key)))
                }
            }
        }

        ClientMessage::StreamChunk {
            user_id,
            challenge_num,
            chunk,
        } => {
            let key = match SessionKey::new(&user_id, &challenge_num) {
                Ok(key) => key,
                Err(e) => return Some(ServerMessage::error(e.to_string(), None)),
            };

            let bytes = match decode_chunk(&chunk) {
                Ok(bytes) => bytes,
                Err(e) => {
                    return Some(ServerMessage::error(
                        format!("Invalid chunk encoding: {}", e),
                        Some(&key),
                    ))
                }
            };

            match controller.append_chunk(&key, &bytes).await {
                Ok(_) => None,
                Err(e) => {
                    tracing::warn!(session_key = %key, error = %e, "Dropping chunk");
                    Some(ServerMessage::error(e.to_string(), Some(&key)))
                }
            }
        }

        ClientMessage::StopStream {
            user_id,
            challenge_num,
        } => {
            let key = match SessionKey::new(&user_id, &challenge_num) {
                Ok(key) => key,
                Err(e) => return Some(ServerMessage::error(e.to_string(), None)),
            };

            controller.stop_stream(&key).await;
            Some(ServerMessage::StreamStopped {
                stream_key: key.to_string(),
            })
        }
    }
}

/// Decode a chunk payload, accepting a bare base64 string or a `data:` URL
fn decode_chunk(chunk: &str) -> Result<Vec<u8>, base64::DecodeError> {
    let payload = match chunk.strip_prefix("data:") {
        Some(rest) => rest.split_once(',').map_or(rest, |(_, data)| data),
        None => chunk,
    };
    base64::engine::general_purpose::STANDARD.decode(payload.trim())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn controller(root: &std::path::Path) -> StreamController {
        let mut config = Config::default();
        config.storage.streams_dir = root.to_path_buf();
        config.encoder.warmup_ms = 60_000;
        StreamController::from_config(&config)
    }

    #[test]
    fn test_parse_start_stream_with_numeric_challenge() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"start-stream","userId":"u1","challengeNum":5}"#)
                .unwrap();

        assert_eq!(
            msg,
            ClientMessage::StartStream {
                user_id: "u1".to_string(),
                challenge_num: "5".to_string(),
            }
        );
    }

    #[test]
    fn test_parse_stream_chunk() {
        let msg: ClientMessage = serde_json::from_str(
            r#"{"type":"stream-chunk","userId":"u1","challengeNum":"5","chunk":"AAEC"}"#,
        )
        .unwrap();

        assert!(matches!(msg, ClientMessage::StreamChunk { ref chunk, .. } if chunk == "AAEC"));
    }

    #[test]
    fn test_serialize_server_messages() {
        let ready = serde_json::to_value(ServerMessage::StreamReady {
            stream_key: "u1_5".to_string(),
        })
        .unwrap();
        assert_eq!(ready, serde_json::json!({"type": "stream-ready", "streamKey": "u1_5"}));

        let error = serde_json::to_value(ServerMessage::error("nope", None)).unwrap();
        assert_eq!(error, serde_json::json!({"type": "stream-error", "message": "nope"}));
    }

    #[test]
    fn test_decode_chunk_forms() {
        assert_eq!(decode_chunk("AAEC").unwrap(), vec![0, 1, 2]);
        assert_eq!(
            decode_chunk("data:video/webm;codecs=vp8;base64,AAEC").unwrap(),
            vec![0, 1, 2]
        );
        assert!(decode_chunk("not base64!").is_err());
    }

    #[tokio::test]
    async fn test_control_flow() {
        let temp = tempfile::tempdir().unwrap();
        let controller = controller(temp.path());
        let conn = Uuid::new_v4();

        let reply = handle_text(
            &controller,
            conn,
            r#"{"type":"start-stream","userId":"u1","challengeNum":5}"#,
        )
        .await;
        assert_eq!(
            reply,
            Some(ServerMessage::StreamReady {
                stream_key: "u1_5".to_string()
            })
        );

        let reply = handle_text(
            &controller,
            conn,
            r#"{"type":"stream-chunk","userId":"u1","challengeNum":5,"chunk":"aGVsbG8="}"#,
        )
        .await;
        assert_eq!(reply, None);

        let reply = handle_text(
            &controller,
            conn,
            r#"{"type":"stop-stream","userId":"u1","challengeNum":5}"#,
        )
        .await;
        assert_eq!(
            reply,
            Some(ServerMessage::StreamStopped {
                stream_key: "u1_5".to_string()
            })
        );

        let written = std::fs::read(temp.path().join("u1_5/recording.webm")).unwrap();
        assert_eq!(written, b"hello");
    }

    #[tokio::test]
    async fn test_errors_are_reported() {
        let temp = tempfile::tempdir().unwrap();
        let controller = controller(temp.path());
        let conn = Uuid::new_v4();

        let reply = handle_text(&controller, conn, "not json").await;
        assert!(matches!(reply, Some(ServerMessage::StreamError { stream_key: None, .. })));

        let reply = handle_text(
            &controller,
            conn,
            r#"{"type":"start-stream","userId":"../etc","challengeNum":5}"#,
        )
        .await;
        assert!(matches!(reply, Some(ServerMessage::StreamError { .. })));

        // Chunk before start-stream
        let reply = handle_text(
            &controller,
            conn,
            r#"{"type":"stream-chunk","userId":"u1","challengeNum":5,"chunk":"AAEC"}"#,
        )
        .await;
        assert_eq!(
            reply,
            Some(ServerMessage::StreamError {
                message: "No active session for u1_5".to_string(),
                stream_key: Some("u1_5".to_string()),
            })
        );
    }

    #[tokio::test]
    async fn test_stop_for_unknown_session_still_acknowledged() {
        let temp = tempfile::tempdir().unwrap();
        let controller = controller(temp.path());

        let reply = handle_text(
            &controller,
            Uuid::new_v4(),
            r#"{"type":"stop-stream","userId":"u9","challengeNum":"1"}"#,
        )
        .await;

        assert_eq!(
            reply,
            Some(ServerMessage::StreamStopped {
                stream_key: "u9_1".to_string()
            })
        );
    }
}
