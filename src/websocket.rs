//! Per-connection protocol dispatch.
//!
//! Each socket gets one reader loop and one writer task. The reader decodes
//! inbound JSON and drives the connection's state machine; the writer
//! drains the outbound channel so broadcasts never wait on a slow socket.

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::project::{MemberHandle, Project};
use crate::protocol::{encode_batch, ClientMessage, ServerMessage, KNOWN_METHODS, USERNAME_VARIABLE};
use crate::registry::ProjectRegistry;

/// Shared state handed to the WebSocket route.
#[derive(Clone)]
pub struct RelayState {
    pub registry: Arc<ProjectRegistry>,
}

/// WebSocket upgrade handler
pub async fn websocket_handler(ws: WebSocketUpgrade, State(state): State<RelayState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: RelayState) {
    let conn_id = Uuid::new_v4();
    let (mut sender, mut receiver) = socket.split();

    let (tx, mut rx) = mpsc::unbounded_channel::<Vec<ServerMessage>>();

    // Writer task: one transport send per batch, every line newline-framed.
    let writer_conn = conn_id;
    tokio::spawn(async move {
        while let Some(batch) = rx.recv().await {
            if sender
                .send(Message::Text(encode_batch(&batch)))
                .await
                .is_err()
            {
                break;
            }
        }
        debug!(conn = %writer_conn, "writer task ended");
    });

    debug!(conn = %conn_id, "websocket connected");

    let mut conn = ConnState::new(MemberHandle::new(conn_id, tx));

    while let Some(result) = receiver.next().await {
        let message = match result {
            Ok(message) => message,
            Err(err) => {
                // The transport owns closing semantics; a stream error is an
                // operational signal only.
                error!(conn = %conn_id, "websocket error: {err}");
                continue;
            }
        };

        match message {
            Message::Text(text) => conn.handle_text(&text, &state.registry).await,
            Message::Binary(data) => match String::from_utf8(data) {
                Ok(text) => conn.handle_text(&text, &state.registry).await,
                Err(_) => debug!(conn = %conn_id, "ignoring non-UTF8 binary frame"),
            },
            Message::Close(_) => break,
            Message::Ping(_) | Message::Pong(_) => {}
        }
    }

    if let Some(project) = conn.project.take() {
        project.leave(conn_id).await;
    }
    debug!(conn = %conn_id, "websocket disconnected");
}

/// Dispatch state machine for one connection: unjoined until the first
/// handshake, then permanently bound to at most one project.
struct ConnState {
    handle: MemberHandle,
    handshaken: bool,
    project: Option<Arc<Project>>,
}

impl ConnState {
    fn new(handle: MemberHandle) -> Self {
        Self {
            handle,
            handshaken: false,
            project: None,
        }
    }

    async fn handle_text(&mut self, text: &str, registry: &ProjectRegistry) {
        let raw: serde_json::Value = match serde_json::from_str(text) {
            Ok(raw) => raw,
            Err(err) => {
                warn!(
                    payload = %text,
                    "received invalid JSON over the websocket ({err}); someone may be tampering with the server"
                );
                return;
            }
        };
        let message: ClientMessage = match serde_json::from_value(raw.clone()) {
            Ok(message) => message,
            Err(err) => {
                match raw.get("method").and_then(|m| m.as_str()) {
                    Some(method) if !KNOWN_METHODS.contains(&method) => {
                        warn!(method = %method, "received an unknown method");
                    }
                    _ => warn!(payload = %text, "received a malformed message: {err}"),
                }
                return;
            }
        };
        self.dispatch(message, registry).await;
    }

    async fn dispatch(&mut self, message: ClientMessage, registry: &ProjectRegistry) {
        match message {
            ClientMessage::Handshake { project_id } => {
                // The first handshake wins, accepted or not; later attempts
                // are permanently ignored.
                if self.handshaken {
                    return;
                }
                self.handshaken = true;
                if let Some(project) = registry.get_or_create(&project_id) {
                    project.join(self.handle.clone()).await;
                    debug!(conn = %self.handle.conn_id, project = %project.id(), "handshake accepted");
                    self.project = Some(project);
                }
            }
            ClientMessage::Create { name, value } | ClientMessage::Set { name, value } => {
                if let Some(project) = &self.project {
                    if name == USERNAME_VARIABLE {
                        project.switch_user(self.handle.conn_id, &value).await;
                    } else {
                        project.set_variable(self.handle.conn_id, name, value).await;
                    }
                }
            }
            ClientMessage::Rename { name, new_name } => {
                if let Some(project) = &self.project {
                    project
                        .rename_variable(self.handle.conn_id, &name, new_name)
                        .await;
                }
            }
            ClientMessage::Delete { name } => {
                if let Some(project) = &self.project {
                    project.delete_variable(&name).await;
                }
            }
        }
    }
}
