//! Relay message dispatch
//!
//! Maps each [`ClientMessage`] onto the [`SharedStateChannel`] operations of
//! the server's store. Subscriptions spawn forwarding tasks that feed the
//! connection's outbound queue.

use crate::channel::SharedStateChannel;
use crate::protocol::{ClientMessage, ServerMessage};
use crate::state::AppState;
use crate::types::{keys, same_identity, Identity, RoomId, RoomMeta};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

/// Return early when a key or topic lies outside the connection's room
macro_rules! check_room {
    ($conn:expr, $key:expr, $req_id:expr) => {
        if !$conn.owns(&$key) {
            return Some(ServerMessage::error(
                "FORBIDDEN",
                format!("{} is outside room {}", $key, $conn.room),
                $req_id,
            ));
        }
    };
}

/// Per-socket state: which room it joined, under which name, and its live subscriptions
pub struct Connection {
    pub room: RoomId,
    pub name: Identity,
    outbound: mpsc::Sender<ServerMessage>,
    subscribed: HashSet<String>,
    forwarders: Vec<JoinHandle<()>>,
}

impl Connection {
    pub fn new(room: RoomId, name: Identity, outbound: mpsc::Sender<ServerMessage>) -> Self {
        Self {
            room,
            name,
            outbound,
            subscribed: HashSet::new(),
            forwarders: Vec::new(),
        }
    }

    fn owns(&self, key: &str) -> bool {
        key.strip_prefix("rooms/")
            .and_then(|rest| rest.strip_prefix(self.room.as_str()))
            .is_some_and(|rest| rest.starts_with('/'))
    }

    fn forward(
        &mut self,
        name: String,
        mut rx: broadcast::Receiver<Value>,
        wrap: impl Fn(Value) -> ServerMessage + Send + 'static,
    ) {
        let outbound = self.outbound.clone();
        let label = name.clone();
        self.subscribed.insert(name);
        self.forwarders.push(tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(value) => {
                        if outbound.send(wrap(value)).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!(subscription = %label, "Relay subscriber lagged by {} messages", n);
                        let resync = ServerMessage::Resync {
                            name: label.clone(),
                        };
                        if outbound.send(resync).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }));
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        for handle in self.forwarders.drain(..) {
            handle.abort();
        }
    }
}

/// Handle client messages and return optional response
pub async fn handle_message(
    msg: ClientMessage,
    conn: &mut Connection,
    state: &Arc<AppState>,
) -> Option<ServerMessage> {
    match msg {
        ClientMessage::Read { req_id, key } => {
            check_room!(conn, key, Some(req_id));
            Some(match state.read(&key).await {
                Ok(record) => ServerMessage::Value {
                    req_id,
                    key,
                    record,
                },
                Err(e) => ServerMessage::error("STORE_ERROR", e.to_string(), Some(req_id)),
            })
        }

        ClientMessage::Write { req_id, key, value } => {
            check_room!(conn, key, Some(req_id));
            if key == keys::meta(&conn.room) {
                return Some(ServerMessage::error(
                    "FORBIDDEN",
                    "Room metadata can only be changed with compare_and_swap",
                    Some(req_id),
                ));
            }
            Some(match state.write(&key, value).await {
                Ok(version) => ServerMessage::Written {
                    req_id,
                    key,
                    version,
                },
                Err(e) => ServerMessage::error("STORE_ERROR", e.to_string(), Some(req_id)),
            })
        }

        ClientMessage::CompareAndSwap {
            req_id,
            key,
            expected,
            value,
        } => {
            check_room!(conn, key, Some(req_id));
            if key == keys::meta(&conn.room) && expected.is_some() {
                if let Some(denied) = guard_owner(conn, state, req_id).await {
                    return Some(denied);
                }
            }
            Some(
                match state.compare_and_swap(&key, expected, value).await {
                    Ok(applied) => ServerMessage::Swapped {
                        req_id,
                        key,
                        applied,
                    },
                    Err(e) => ServerMessage::error("STORE_ERROR", e.to_string(), Some(req_id)),
                },
            )
        }

        ClientMessage::SubscribeKey { key } => {
            check_room!(conn, key, None);
            let name = format!("key:{}", key);
            if !conn.subscribed.contains(&name) {
                tracing::debug!(room = %conn.room, name = %conn.name, "Subscribing to key {}", key);
                let rx = state.subscribe_key(&key);
                let wrapped_key = key.clone();
                conn.forward(name.clone(), rx, move |value| ServerMessage::KeyChanged {
                    key: wrapped_key.clone(),
                    value,
                });
            }
            Some(ServerMessage::Subscribed { name })
        }

        ClientMessage::SubscribeTopic { topic } => {
            check_room!(conn, topic, None);
            let name = format!("topic:{}", topic);
            if !conn.subscribed.contains(&name) {
                tracing::debug!(room = %conn.room, name = %conn.name, "Subscribing to topic {}", topic);
                let rx = state.subscribe_topic(&topic);
                let wrapped_topic = topic.clone();
                conn.forward(name.clone(), rx, move |msg| ServerMessage::TopicMessage {
                    topic: wrapped_topic.clone(),
                    msg,
                });
            }
            Some(ServerMessage::Subscribed { name })
        }

        ClientMessage::Publish { topic, msg } => {
            check_room!(conn, topic, None);
            state.publish(&topic, msg).await;
            None
        }
    }
}

/// Rewriting an existing room record is reserved for its current owner
async fn guard_owner(
    conn: &Connection,
    state: &Arc<AppState>,
    req_id: u64,
) -> Option<ServerMessage> {
    let owner = match state.read(&keys::meta(&conn.room)).await {
        Ok(Some(record)) => record.decode::<RoomMeta>().ok().map(|meta| meta.owner),
        Ok(None) => None,
        Err(e) => {
            return Some(ServerMessage::error(
                "STORE_ERROR",
                e.to_string(),
                Some(req_id),
            ))
        }
    };

    match owner {
        Some(owner) if same_identity(&owner, &conn.name) => None,
        _ => {
            tracing::warn!(room = %conn.room, name = %conn.name, "Rejected room metadata change from non-owner");
            Some(ServerMessage::error(
                "UNAUTHORIZED",
                "Only the room owner can change room metadata",
                Some(req_id),
            ))
        }
    }
}
