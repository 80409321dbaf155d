//! # Local Request Executor
//!
//! Replays each `request-start` against the local service and streams the
//! result back:
//!
//! ```text
//! request-start ─▶ local call ─▶ response-start, data*, data-end
//! request-data* ─▶ local request body
//! ```
//!
//! A failed local call is reported with `data-end{error}`, before or after
//! the response started.

use std::sync::Arc;

use bytes::Bytes;
use futures::StreamExt;
use reqwest::header::{HeaderMap, HOST};
use reqwest::Method;
use tracing::{debug, warn};
use tunnel_protocol::{
    flatten_headers, headers::is_websocket_upgrade, to_header_map, AgentMessage, Headers, RequestStart, ResponseStart,
    StreamReceiver,
};

use crate::error::AgentError;
use crate::relay;
use crate::state::AgentState;

/// Starts handling a new inbound request. The body channel, when the request
/// has one, is registered before this returns so that `request-data`
/// following on the control channel always finds it.
pub fn start_request(state: &Arc<AgentState>, request: RequestStart) {
    if is_websocket_upgrade(&request.headers) {
        relay::open(state.clone(), request);
        return;
    }

    let body = request.has_body.then(|| state.open_body(&request.id));
    let state = state.clone();
    tokio::spawn(async move {
        let id = request.id.clone();
        match execute(&state, request, body).await {
            Ok(()) => {}
            Err(AgentError::Channel(_)) => debug!(id = %id, "Control channel closed mid-response"),
            Err(e) => {
                warn!(id = %id, "Local request failed: {}", e);
                let _ = state
                    .send(AgentMessage::DataEnd {
                        id: id.clone(),
                        error: Some(e.to_string()),
                    })
                    .await;
            }
        }
        state.end_body(&id);
    });
}

async fn execute(
    state: &AgentState,
    request: RequestStart,
    body: Option<StreamReceiver<Bytes>>,
) -> Result<(), AgentError> {
    let RequestStart {
        id, method, url, headers, ..
    } = request;
    let method = Method::from_bytes(method.as_bytes()).map_err(|_| AgentError::InvalidMethod(method.clone()))?;
    let target = state.resolve(&url);
    debug!(id = %id, method = %method, url = %target, "Executing local request");

    let mut local = state.client.request(method, target).headers(local_headers(&headers));
    if let Some(body) = body {
        local = local.body(reqwest::Body::wrap_stream(body.into_stream()));
    }
    let response = local.send().await?;

    let status = response.status();
    state
        .send(AgentMessage::ResponseStart(ResponseStart {
            id: id.clone(),
            status_code: status.as_u16(),
            status_message: status.canonical_reason().unwrap_or_default().to_owned(),
            headers: flatten_headers(response.headers()),
        }))
        .await?;

    let mut chunks = response.bytes_stream();
    while let Some(chunk) = chunks.next().await {
        state
            .send(AgentMessage::Data {
                id: id.clone(),
                chunk: chunk?,
            })
            .await?;
    }
    state.send(AgentMessage::DataEnd { id, error: None }).await?;
    Ok(())
}

/// Forwarded request headers minus hop-by-hop headers and `host`, which
/// names the public domain rather than the local service.
fn local_headers(headers: &Headers) -> HeaderMap {
    let mut map = to_header_map(headers);
    map.remove(HOST);
    map
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        response::Redirect,
        routing::{get, post},
        Router,
    };
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;
    use tunnel_protocol::control_channel;

    async fn local_service() -> String {
        let app = Router::new()
            .route("/hello", get(|| async { "hello" }))
            .route("/echo", post(|body: Bytes| async move { body }))
            .route("/moved", get(|| async { Redirect::to("/hello") }));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        format!("http://{addr}")
    }

    fn agent(local_addr: &str) -> (Arc<AgentState>, mpsc::Receiver<AgentMessage>) {
        let (tx, rx) = control_channel(64);
        (Arc::new(AgentState::new(local_addr.parse().unwrap(), tx).unwrap()), rx)
    }

    fn request(id: &str, method: &str, url: &str, has_body: bool) -> RequestStart {
        RequestStart {
            id: id.into(),
            domain: "a.example".into(),
            method: method.into(),
            url: url.into(),
            headers: Headers::new(),
            has_body,
        }
    }

    /// Collects the response head and body for one request.
    async fn response(rx: &mut mpsc::Receiver<AgentMessage>) -> (ResponseStart, Vec<u8>) {
        let head = match rx.recv().await.unwrap() {
            AgentMessage::ResponseStart(head) => head,
            other => panic!("expected response-start, got {other:?}"),
        };
        let mut body = Vec::new();
        loop {
            match rx.recv().await.unwrap() {
                AgentMessage::Data { chunk, .. } => body.extend_from_slice(&chunk),
                AgentMessage::DataEnd { error: None, .. } => return (head, body),
                other => panic!("unexpected message: {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn local_response_is_streamed_back() {
        let (state, mut rx) = agent(&local_service().await);
        start_request(&state, request("r1", "GET", "/hello", false));

        let (head, body) = response(&mut rx).await;
        assert_eq!(head.id, "r1");
        assert_eq!(head.status_code, 200);
        assert_eq!(head.status_message, "OK");
        assert_eq!(body, b"hello");
    }

    #[tokio::test]
    async fn request_body_reaches_the_local_service() {
        let (state, mut rx) = agent(&local_service().await);
        start_request(&state, request("r1", "POST", "/echo", true));
        state.push_body("r1", Bytes::from_static(b"ping "));
        state.push_body("r1", Bytes::from_static(b"pong"));
        assert!(state.end_body("r1"));

        let (_, body) = response(&mut rx).await;
        assert_eq!(body, b"ping pong");
    }

    #[tokio::test]
    async fn redirects_are_relayed_not_followed() {
        let (state, mut rx) = agent(&local_service().await);
        start_request(&state, request("r1", "GET", "/moved", false));

        let (head, _) = response(&mut rx).await;
        assert_eq!(head.status_code, 303);
        assert_eq!(head.headers["location"], "/hello");
    }

    #[tokio::test]
    async fn unreachable_local_service_reports_data_end_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let (state, mut rx) = agent(&format!("http://{addr}"));
        start_request(&state, request("r1", "GET", "/", false));

        match rx.recv().await.unwrap() {
            AgentMessage::DataEnd { id, error } => {
                assert_eq!(id, "r1");
                assert!(error.is_some());
            }
            other => panic!("expected data-end, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn invalid_method_reports_data_end_error() {
        let (state, mut rx) = agent("http://127.0.0.1:9");
        start_request(&state, request("r1", "NOT A METHOD", "/", false));

        match rx.recv().await.unwrap() {
            AgentMessage::DataEnd { error: Some(error), .. } => assert!(error.contains("NOT A METHOD")),
            other => panic!("expected data-end, got {other:?}"),
        }
    }

    #[test]
    fn local_headers_drop_host_and_hop_by_hop() {
        let mut headers = Headers::new();
        headers.insert("host".into(), "a.example".into());
        headers.insert("connection".into(), "keep-alive".into());
        headers.insert("content-type".into(), "application/json".into());

        let map = local_headers(&headers);
        assert_eq!(map.len(), 1);
        assert_eq!(map["content-type"], "application/json");
    }
}
