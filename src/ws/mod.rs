pub mod handlers;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use futures::{sink::SinkExt, stream::StreamExt, Sink};
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::protocol::{ClientMessage, ServerMessage};
use crate::state::AppState;
use crate::types::now_ms;
use handlers::Connection;

const PROTOCOL_VERSION: &str = "1.0";
/// Outbound queue depth per socket
const OUTBOUND_CAPACITY: usize = 256;

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    pub room: String,
    pub name: String,
}

/// Relay routes: `/ws` for replicas, `/health` for probes
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health))
        .with_state(state)
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

/// WebSocket upgrade handler
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<WsQuery>,
    State(state): State<Arc<AppState>>,
) -> Response {
    let room = params.room.trim().to_string();
    let name = params.name.trim().to_string();
    if room.is_empty() || room.contains('/') || name.is_empty() {
        tracing::warn!("Rejected WebSocket request: room={:?}, name={:?}", room, name);
        return (StatusCode::BAD_REQUEST, "room and name are required").into_response();
    }

    tracing::info!("WebSocket connection request: room={}, name={}", room, name);
    ws.on_upgrade(move |socket| handle_socket(socket, room, name, state))
}

/// Handle individual WebSocket connection
async fn handle_socket(socket: WebSocket, room: String, name: String, state: Arc<AppState>) {
    let (mut sender, mut receiver) = socket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);
    let mut conn = Connection::new(room.clone(), name.clone(), outbound_tx);

    let welcome = ServerMessage::Welcome {
        protocol: PROTOCOL_VERSION.to_string(),
        room: room.clone(),
        server_now: now_ms(),
    };
    if send(&mut sender, &welcome).await.is_err() {
        tracing::error!("Failed to send welcome message");
        return;
    }

    loop {
        tokio::select! {
            // Subscription traffic forwarded by the connection's tasks
            Some(msg) = outbound_rx.recv() => {
                if send(&mut sender, &msg).await.is_err() {
                    break;
                }
            }

            ws_msg = receiver.next() => {
                match ws_msg {
                    Some(Ok(Message::Text(text))) => {
                        tracing::debug!("Received message: {}", text);

                        let response = match serde_json::from_str::<ClientMessage>(&text) {
                            Ok(client_msg) => handlers::handle_message(client_msg, &mut conn, &state).await,
                            Err(e) => {
                                tracing::error!("Failed to parse client message: {}", e);
                                Some(ServerMessage::error(
                                    "PARSE_ERROR",
                                    format!("Invalid message format: {}", e),
                                    None,
                                ))
                            }
                        };
                        if let Some(response) = response {
                            if send(&mut sender, &response).await.is_err() {
                                tracing::error!("Failed to send response");
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) => {
                        tracing::info!("WebSocket closed");
                        break;
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::error!("WebSocket error: {}", e);
                        break;
                    }
                    None => break,
                }
            }
        }
    }

    tracing::info!("WebSocket connection closed: room={}, name={}", room, name);
}

async fn send<S>(sender: &mut S, msg: &ServerMessage) -> Result<(), ()>
where
    S: Sink<Message> + Unpin,
{
    let json = match serde_json::to_string(msg) {
        Ok(json) => json,
        Err(e) => {
            tracing::error!("Failed to serialize server message: {}", e);
            return Ok(());
        }
    };
    sender.send(Message::Text(json.into())).await.map_err(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    #[tokio::test]
    async fn test_health() {
        let app = router(Arc::new(AppState::new()));
        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_ws_requires_room_and_name() {
        let app = router(Arc::new(AppState::new()));
        let response = app
            .oneshot(Request::builder().uri("/ws?room=lobby").body(Body::empty()).unwrap())
            .await
            .unwrap();
        // Rejected before any upgrade happens
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
