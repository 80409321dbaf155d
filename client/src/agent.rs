//! # Agent Connection Loop
//!
//! Manages the control channel between the agent and the tunnel server:
//! - Connection establishment and registration of the configured domain
//! - Incoming message dispatch to the executor and the socket relays
//! - Clean state reset on disconnect, and reconnecting after a delay

use std::sync::Arc;
use std::time::Duration;

use futures::stream::SplitStream;
use futures::StreamExt;
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};
use tunnel_protocol::{decode, decode_slice, new_stream_id, AgentMessage, ControlChannel, EdgeMessage, RelayFrame};

use crate::config::AgentConfig;
use crate::error::AgentError;
use crate::executor;
use crate::state::AgentState;

/// How long to wait before reconnecting after a disconnect.
pub const RECONNECT_DELAY: Duration = Duration::from_secs(3);

type EdgeSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

type Registration = oneshot::Sender<Result<String, AgentError>>;

/// A live control channel connection.
pub struct Connection {
    registered: Option<oneshot::Receiver<Result<String, AgentError>>>,
    closed: JoinHandle<()>,
}

impl Connection {
    /// Waits for the edge to acknowledge the registration and returns the
    /// registered domain.
    pub async fn registered(&mut self) -> Result<String, AgentError> {
        match self.registered.take() {
            Some(registered) => registered.await.unwrap_or(Err(AgentError::Disconnected)),
            None => Err(AgentError::Disconnected),
        }
    }

    /// Waits until the connection is gone and its state is torn down.
    pub async fn closed(self) {
        if let Err(e) = self.closed.await {
            error!("Receive loop failed: {}", e);
        }
    }
}

fn text_frame(text: String) -> Message {
    Message::Text(text.into())
}

/// Dials the edge, sends `register` and starts the receive loop.
pub async fn connect(config: &AgentConfig) -> Result<Connection, AgentError> {
    let url = config.connect_url()?;
    info!("Connecting to server: {}", url);
    let (socket, _) = connect_async(url.as_str()).await?;
    info!("Connected to server!");

    let (ws_sink, ws_stream) = socket.split();
    let channel = ControlChannel::<AgentMessage>::spawn(ws_sink, text_frame, Message::Close(None));
    let state = Arc::new(AgentState::new(config.local_addr.clone(), channel.sender())?);

    state
        .send(AgentMessage::Register {
            id: Some(new_stream_id()),
            api_key: config.api_key.clone(),
            domain: config.domain.clone(),
        })
        .await?;

    let (registered_tx, registered_rx) = oneshot::channel();
    let closed = tokio::spawn(receive_loop(ws_stream, channel, state, registered_tx));
    Ok(Connection {
        registered: Some(registered_rx),
        closed,
    })
}

/// Processes edge messages until the socket closes, then abandons every
/// stream of this connection.
async fn receive_loop(
    mut ws_stream: SplitStream<EdgeSocket>,
    channel: ControlChannel<AgentMessage>,
    state: Arc<AgentState>,
    registered: Registration,
) {
    let mut registration = Some(registered);

    while let Some(frame) = ws_stream.next().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(e) => {
                debug!("Control socket read failed: {}", e);
                break;
            }
        };
        let decoded = match frame {
            Message::Text(text) => decode::<EdgeMessage>(text.as_str()),
            Message::Binary(payload) => decode_slice::<EdgeMessage>(&payload),
            Message::Close(_) => break,
            Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
        };
        match decoded {
            Ok(message) => handle_edge_message(&state, &mut registration, message),
            Err(e) => warn!("Dropping frame: {}", e),
        }
    }

    warn!("Disconnected from server");
    state.teardown();
    channel.close().await;
    if let Some(registration) = registration {
        let _ = registration.send(Err(AgentError::Disconnected));
    }
}

// ─── Edge Message Handler ───────────────────────────────────────

fn handle_edge_message(state: &Arc<AgentState>, registration: &mut Option<Registration>, message: EdgeMessage) {
    match message {
        EdgeMessage::Registered { domain, .. } => {
            info!(domain = %domain, "Registered");
            if let Some(registration) = registration.take() {
                let _ = registration.send(Ok(domain));
            }
        }
        EdgeMessage::Error { message } => {
            error!("Server error: {}", message);
            if let Some(registration) = registration.take() {
                let _ = registration.send(Err(AgentError::Rejected(message)));
            }
        }
        EdgeMessage::RequestStart(request) => {
            debug!(id = %request.id, method = %request.method, url = %request.url, "Request started");
            executor::start_request(state, request);
        }
        EdgeMessage::RequestData { id, chunk } => state.push_body(&id, chunk),
        EdgeMessage::RequestEnd { id } => {
            state.end_body(&id);
        }
        EdgeMessage::WsMessage { id, data, binary } => {
            state.push_frame(&id, RelayFrame { data, binary });
        }
        EdgeMessage::WsClosed { id } => {
            if !state.drop_relay(&id) {
                debug!(id = %id, "ws-closed for an unknown socket");
            }
        }
    }
}

// ─── Main Connection Loop ───────────────────────────────────────

/// Keeps the agent connected, reconnecting after [`RECONNECT_DELAY`]
/// whenever the connection drops. Returns only when the edge rejects the
/// registration.
pub async fn run(config: AgentConfig) -> Result<(), AgentError> {
    config.validate()?;
    loop {
        match connect(&config).await {
            Ok(mut connection) => match connection.registered().await {
                Ok(domain) => {
                    info!("Tunnel live for {} → {}", domain, config.local_addr);
                    connection.closed().await;
                }
                Err(AgentError::Rejected(message)) => {
                    connection.closed().await;
                    return Err(AgentError::Rejected(message));
                }
                Err(e) => error!("Registration failed: {}", e),
            },
            Err(e) => error!("Connection failed: {}", e),
        }

        info!("Reconnecting in {}s...", RECONNECT_DELAY.as_secs());
        tokio::time::sleep(RECONNECT_DELAY).await;
    }
}
