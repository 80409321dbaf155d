//! Relays frames between an upgraded inbound WebSocket and the agent's
//! local socket on the other end of the tunnel.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use tracing::debug;
use tunnel_protocol::{EdgeMessage, RelayFrame, StreamId, StreamReceiver};

use crate::session::Session;

/// Runs until either side closes. Frames read from the inbound socket go out
/// as `ws-message`; frames queued by the agent are written to the socket.
pub async fn run(socket: WebSocket, session: Arc<Session>, id: StreamId, mut frames: StreamReceiver<RelayFrame>) {
    debug!(id = %id, "WebSocket relay established");
    let (mut sink, mut stream) = socket.split();

    let closed_locally = loop {
        tokio::select! {
            inbound = stream.next() => {
                let frame = match inbound {
                    Some(Ok(Message::Text(text))) => RelayFrame::text(text.as_str()),
                    Some(Ok(Message::Binary(data))) => RelayFrame::binary(data),
                    Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break true,
                };
                if session.send(EdgeMessage::ws_message(id.clone(), frame)).await.is_err() {
                    break false;
                }
            }
            outbound = frames.recv() => match outbound {
                Some(Ok(frame)) => {
                    if sink.send(to_message(frame)).await.is_err() {
                        break true;
                    }
                }
                // The agent closed its socket or the control channel is gone.
                Some(Err(_)) | None => break false,
            }
        }
    };

    if closed_locally {
        debug!(id = %id, "Inbound WebSocket closed");
        if let Err(e) = session.close_socket(&id).await {
            debug!(id = %id, "Unable to report ws-closed: {}", e);
        }
    } else {
        debug!(id = %id, "Agent closed the WebSocket");
    }
    let _ = sink.close().await;
}

fn to_message(frame: RelayFrame) -> Message {
    match frame.into_text() {
        Ok(text) => Message::Text(text.into()),
        Err(data) => Message::Binary(data),
    }
}
