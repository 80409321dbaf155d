//! # Local WebSocket Relay
//!
//! Bridges one local WebSocket and the tunnel for a `request-start` that
//! asked for an upgrade.
//!
//! ## Data Flow
//!
//! ```text
//! Local Service ←──WS──→ [Relay Task] ←──ws-message (base64 JSON)──→ Edge ←──→ Caller
//! ```
//!
//! The relay task registers its frame channel before announcing
//! `ws-opened`, so frames the edge sends right after the upgrade are
//! buffered while the loop starts.

use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::HOST;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use tunnel_protocol::{to_header_map, AgentMessage, RelayFrame, RequestStart, StreamId};

use crate::error::{AgentError, ConfigError};
use crate::state::AgentState;

type LocalSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Spawns the relay for an upgrade request. A local connection failure is
/// reported as `data-end{error}` in place of `ws-opened`.
pub fn open(state: Arc<AgentState>, request: RequestStart) {
    tokio::spawn(async move {
        let id = request.id.clone();
        match connect_local(&state, &request).await {
            Ok(socket) => run(state, id, socket).await,
            Err(e) => {
                warn!(id = %id, "Failed to open local WebSocket: {}", e);
                let _ = state
                    .send(AgentMessage::DataEnd {
                        id,
                        error: Some(e.to_string()),
                    })
                    .await;
            }
        }
    });
}

/// Dials the local service over `ws`/`wss`, forwarding the caller's headers
/// except the ones describing the edge-side handshake.
async fn connect_local(state: &AgentState, request: &RequestStart) -> Result<LocalSocket, AgentError> {
    let mut url = state.resolve(&request.url);
    let scheme = if url.scheme() == "https" { "wss" } else { "ws" };
    url.set_scheme(scheme)
        .map_err(|()| ConfigError::UnsupportedScheme(url.scheme().to_owned()))?;

    let mut upgrade = url.as_str().into_client_request()?;
    for (name, value) in &to_header_map(&request.headers) {
        if *name == HOST || name.as_str().starts_with("sec-websocket-") {
            continue;
        }
        upgrade.headers_mut().insert(name.clone(), value.clone());
    }

    let (socket, _) = connect_async(upgrade).await?;
    info!(id = %request.id, url = %url, "Local WebSocket connected");
    Ok(socket)
}

async fn run(state: Arc<AgentState>, id: StreamId, socket: LocalSocket) {
    let mut frames = state.track_relay(&id);
    if state.send(AgentMessage::WsOpened { id: id.clone() }).await.is_err() {
        state.drop_relay(&id);
        return;
    }

    let (mut sink, mut stream) = socket.split();
    let closed_locally = loop {
        tokio::select! {
            local = stream.next() => {
                let frame = match local {
                    Some(Ok(Message::Text(text))) => RelayFrame::text(text.as_str()),
                    Some(Ok(Message::Binary(data))) => RelayFrame::binary(data),
                    Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => continue,
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break true,
                };
                if state.send(AgentMessage::ws_message(id.clone(), frame)).await.is_err() {
                    break false;
                }
            }
            remote = frames.recv() => match remote {
                Some(Ok(frame)) => {
                    if sink.send(to_message(frame)).await.is_err() {
                        break true;
                    }
                }
                // ws-closed from the edge, or the control channel is gone.
                Some(Err(_)) | None => break false,
            }
        }
    };

    if closed_locally {
        debug!(id = %id, "Local WebSocket closed");
        state.drop_relay(&id);
        let _ = state.send(AgentMessage::WsClosed { id }).await;
    } else {
        debug!(id = %id, "Edge closed the WebSocket");
    }
    let _ = sink.close().await;
}

fn to_message(frame: RelayFrame) -> Message {
    match frame.into_text() {
        Ok(text) => Message::Text(text.into()),
        Err(data) => Message::Binary(data),
    }
}
