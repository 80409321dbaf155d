//! Shared utilities for the end-to-end tunnel tests.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Bytes,
    extract::ws::{Message as LocalMessage, WebSocket, WebSocketUpgrade},
    http::{StatusCode, Uri},
    routing::{any, get, post},
    Router,
};
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tokio_tungstenite::tungstenite::{client::IntoClientRequest, http::header::HOST, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tunnel_client::{AgentConfig, Connection};
use tunnel_protocol::{decode, encode, AgentMessage, EdgeMessage};
use tunnel_server::state::AppState;

/// The only API key the test edge accepts.
pub const API_KEY: &str = "K";

pub const TIMEOUT: Duration = Duration::from_secs(5);

pub type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Start the edge on an ephemeral port.
pub async fn start_edge() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let state = AppState::new([API_KEY.to_string()]);
    tokio::spawn(tunnel_server::serve(listener, state, std::future::pending()));
    addr
}

/// A local service for the agent to expose. `closed` is notified whenever
/// one of its WebSockets ends.
pub struct LocalService {
    pub addr: SocketAddr,
    pub closed: Arc<Notify>,
}

pub async fn start_local_service() -> LocalService {
    let closed = Arc::new(Notify::new());
    let ws_closed = closed.clone();

    let app = Router::new()
        .route("/hello", get(|| async { ([("x-upstream", "local")], "hello") }))
        .route("/echo", post(|body: Bytes| async move { body }))
        .route("/empty", any(|| async { StatusCode::NO_CONTENT }))
        .route("/uri", get(|uri: Uri| async move { uri.to_string() }))
        .route(
            "/ws-bye",
            get(|ws: WebSocketUpgrade| async move { ws.on_upgrade(say_bye) }),
        )
        .route(
            "/ws",
            get(move |ws: WebSocketUpgrade| {
                let closed = ws_closed.clone();
                async move { ws.on_upgrade(move |socket| echo_socket(socket, closed)) }
            }),
        );

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
    LocalService { addr, closed }
}

async fn echo_socket(mut socket: WebSocket, closed: Arc<Notify>) {
    while let Some(Ok(message)) = socket.next().await {
        match message {
            LocalMessage::Text(_) | LocalMessage::Binary(_) => {
                if socket.send(message).await.is_err() {
                    break;
                }
            }
            LocalMessage::Close(_) => break,
            _ => {}
        }
    }
    closed.notify_one();
}

/// Sends one text frame, then closes.
async fn say_bye(mut socket: WebSocket) {
    let _ = socket.send(LocalMessage::Text("bye".into())).await;
    let _ = socket.close().await;
}

/// An address nothing listens on.
pub async fn unused_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}

pub fn agent_config(edge: SocketAddr, local: SocketAddr, domain: &str, api_key: &str) -> AgentConfig {
    AgentConfig {
        server: format!("ws://{edge}").parse().unwrap(),
        local_addr: format!("http://{local}").parse().unwrap(),
        domain: domain.to_string(),
        api_key: api_key.to_string(),
    }
}

/// Connect a real agent and wait for its registration.
pub async fn start_agent(edge: SocketAddr, local: SocketAddr, domain: &str) -> Connection {
    let mut connection = tunnel_client::connect(&agent_config(edge, local, domain, API_KEY))
        .await
        .unwrap();
    assert_eq!(connection.registered().await.unwrap(), domain);
    connection
}

pub fn http_client() -> reqwest::Client {
    reqwest::Client::builder().no_proxy().build().unwrap()
}

/// Open a WebSocket through the edge, addressed to `domain`.
pub async fn open_socket(edge: SocketAddr, domain: &str, path: &str) -> Socket {
    let mut request = format!("ws://{edge}{path}").into_client_request().unwrap();
    request.headers_mut().insert(HOST, domain.parse().unwrap());
    let (socket, _) = connect_async(request).await.unwrap();
    socket
}

// ─── Hand-driven Agent ──────────────────────────────────────────

/// Speaks the control protocol directly, for tests that need to control
/// exactly what the agent sends.
pub struct RawAgent {
    pub socket: Socket,
}

impl RawAgent {
    pub async fn connect(edge: SocketAddr) -> Self {
        let (socket, _) = connect_async(format!("ws://{edge}/_connect")).await.unwrap();
        Self { socket }
    }

    /// Connect and register `domain` with the test key.
    pub async fn register(edge: SocketAddr, domain: &str) -> Self {
        let mut agent = Self::connect(edge).await;
        agent
            .send(AgentMessage::Register {
                id: None,
                api_key: API_KEY.into(),
                domain: domain.into(),
            })
            .await;
        match agent.recv().await {
            Some(EdgeMessage::Registered { domain: registered, .. }) => assert_eq!(registered, domain),
            other => panic!("expected registered, got {other:?}"),
        }
        agent
    }

    pub async fn send(&mut self, message: AgentMessage) {
        let text = encode(&message).unwrap();
        self.socket.send(Message::Text(text.into())).await.unwrap();
    }

    /// The next edge message, or `None` once the edge closed the channel.
    pub async fn recv(&mut self) -> Option<EdgeMessage> {
        loop {
            let frame = tokio::time::timeout(TIMEOUT, self.socket.next())
                .await
                .expect("timed out waiting for the edge");
            match frame {
                Some(Ok(Message::Text(text))) => return Some(decode(text.as_str()).unwrap()),
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return None,
                Some(Ok(_)) => continue,
            }
        }
    }

    pub async fn close(mut self) {
        let _ = self.socket.close(None).await;
    }
}

/// Poll `/_status` until `check` accepts the registered domains.
pub async fn wait_for_domains(edge: SocketAddr, check: impl Fn(&[String]) -> bool) {
    let client = http_client();
    tokio::time::timeout(TIMEOUT, async {
        loop {
            let body = client
                .get(format!("http://{edge}/_status"))
                .send()
                .await
                .unwrap()
                .text()
                .await
                .unwrap();
            let status: serde_json::Value = serde_json::from_str(&body).unwrap();
            let domains: Vec<String> = serde_json::from_value(status["domains"].clone()).unwrap();
            if check(&domains) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("registrations did not reach the expected state");
}
