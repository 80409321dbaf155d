//! # Control Channel Handlers
//!
//! Contains the agent-facing WebSocket logic of the edge:
//! - Upgrading `/_connect` requests into control channels
//! - Managing the lifecycle of each connection (writer task, receive loop, cleanup)
//! - Dispatching agent messages to the registrar and the connection's session

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures::StreamExt;
use tracing::{debug, error, info, warn};
use tunnel_protocol::{decode, decode_slice, new_stream_id, AgentMessage, ControlChannel, EdgeMessage, RelayFrame};

use crate::error::TunnelError;
use crate::session::Session;
use crate::state::AppState;

// ─── WebSocket Upgrade Endpoint ─────────────────────────────────

/// `GET /_connect` — Upgrades the HTTP connection into an agent's control
/// channel, handled by [`handle_connection`].
pub async fn connect_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_connection(socket, state))
}

fn text_frame(text: String) -> Message {
    Message::Text(text.into())
}

// ─── Connection Lifecycle ───────────────────────────────────────

/// Manages the full lifecycle of a single agent connection.
///
/// ## Flow:
/// 1. Assign a connection ID and split the socket
/// 2. Spawn the control channel writer over the sink half
/// 3. Decode and dispatch incoming frames on the current task
/// 4. On disconnect: drop the agent's domains, fail its in-flight streams
///    and flush the writer
async fn handle_connection(socket: WebSocket, state: AppState) {
    let conn_id = new_stream_id();
    info!(conn_id = %conn_id, "New agent connection");

    let (ws_sink, mut ws_stream) = socket.split();
    let channel = ControlChannel::<EdgeMessage>::spawn(ws_sink, text_frame, Message::Close(None));
    let session = Arc::new(Session::new(conn_id.clone(), channel.sender()));

    // ── Receive Loop ──
    while let Some(frame) = ws_stream.next().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(e) => {
                debug!(conn_id = %conn_id, "Control socket read failed: {}", e);
                break;
            }
        };
        let decoded = match frame {
            Message::Text(text) => decode::<AgentMessage>(text.as_str()),
            Message::Binary(payload) => decode_slice::<AgentMessage>(&payload),
            Message::Close(_) => break,
            Message::Ping(_) | Message::Pong(_) => continue,
        };
        let message = match decoded {
            Ok(message) => message,
            Err(e) => {
                warn!(conn_id = %conn_id, "Dropping frame: {}", e);
                continue;
            }
        };

        let id = message.stream_id().map(str::to_owned);
        match dispatch(&state, &session, message).await {
            Ok(()) => {}
            Err(TunnelError::Unauthorized) => break,
            Err(e) => {
                error!(conn_id = %conn_id, id = ?id, "Error handling agent message: {}", e);
                if let Some(id) = id {
                    session.forget(&id);
                    session.drop_socket(&id);
                }
                if matches!(e, TunnelError::Send(_)) {
                    break;
                }
            }
        }
    }

    // ── Cleanup on Disconnect ──
    info!(conn_id = %conn_id, "Agent disconnected");
    for domain in session.domains() {
        if state.registrar.unregister_connection(&domain, &conn_id) {
            info!(domain = %domain, "Domain unregistered");
        }
    }
    session.teardown();
    channel.close().await;
}

// ─── Message Dispatch ───────────────────────────────────────────

/// Routes one agent message. Messages for unknown ids are logged and
/// dropped by the session; an error only concerns the message's own id.
async fn dispatch(state: &AppState, session: &Arc<Session>, message: AgentMessage) -> Result<(), TunnelError> {
    match message {
        AgentMessage::Register { id, api_key, domain } => {
            state.registrar.register(session, &api_key, &domain, id).await?;
        }
        AgentMessage::ResponseStart(head) => session.resolve(head),
        AgentMessage::Data { id, chunk } => session.push_body(&id, chunk),
        AgentMessage::DataEnd { id, error } => session.finish(&id, error),
        AgentMessage::WsOpened { id } => session.open_socket(&id).await?,
        AgentMessage::WsMessage { id, data, binary } => {
            session.push_frame(&id, RelayFrame { data, binary });
        }
        AgentMessage::WsClosed { id } => {
            if !session.drop_socket(&id) {
                debug!(id = %id, "ws-closed for an unknown socket");
            }
        }
    }
    Ok(())
}
