//! # Inbound Request Multiplexer
//!
//! Fallback handler for every request that is not an edge endpoint. The
//! request's host selects the agent session; the request is assigned a fresh
//! stream id and replayed over that agent's control channel:
//!
//! ```text
//! caller ──HTTP──▶ proxy ──request-start, request-data*, request-end──▶ agent
//! caller ◀─HTTP─── proxy ◀──response-start, data*, data-end──────────── agent
//! ```
//!
//! WebSocket upgrades wait for `ws-opened` instead of `response-start` and
//! then hand the upgraded socket to [`crate::relay`].

use std::sync::Arc;

use axum::{
    body::{Body, Bytes, HttpBody},
    extract::{FromRequestParts, Request, State, WebSocketUpgrade},
    http::{header::HOST, StatusCode},
    response::{IntoResponse, Response},
};
use futures::StreamExt;
use tokio::sync::oneshot;
use tracing::{debug, warn};
use tunnel_protocol::{
    flatten_headers, headers::is_websocket_upgrade, is_null_body_status, new_stream_id, stream_channel,
    to_header_map, EdgeMessage, RequestStart, ResponseStart, StreamId, StreamReceiver,
};

use crate::error::TunnelError;
use crate::relay;
use crate::session::{PendingRequest, Reply, Session};
use crate::state::AppState;

pub async fn proxy_handler(State(state): State<AppState>, request: Request) -> Response {
    match forward(&state, request).await {
        Ok(response) => response,
        Err(e) => {
            debug!("Proxy request failed: {}", e);
            e.into_response()
        }
    }
}

/// The host the caller addressed, from the `Host` header or the request
/// target's authority.
fn request_host(request: &Request) -> Option<String> {
    request
        .headers()
        .get(HOST)
        .and_then(|value| value.to_str().ok())
        .or_else(|| request.uri().host())
        .map(str::to_owned)
}

async fn forward(state: &AppState, request: Request) -> Result<Response, TunnelError> {
    let host = request_host(&request).ok_or(TunnelError::NoRegistration)?;
    let session = state.registrar.lookup(&host).ok_or(TunnelError::NoRegistration)?;

    let (mut parts, body) = request.into_parts();
    let headers = flatten_headers(&parts.headers);
    let upgrade = if is_websocket_upgrade(&headers) {
        WebSocketUpgrade::from_request_parts(&mut parts, &()).await.ok()
    } else {
        None
    };
    let has_body = !body.is_end_stream();
    let url = parts
        .uri
        .path_and_query()
        .map(|target| target.as_str().to_owned())
        .unwrap_or_else(|| "/".to_owned());

    let id = new_stream_id();
    let (responder, reply) = oneshot::channel();
    let (body_tx, body_rx) = stream_channel();
    session.track(id.clone(), PendingRequest::new(responder, body_tx));
    let mut guard = PendingGuard::new(session.clone(), id.clone());

    debug!(id = %id, host = %host, method = %parts.method, url = %url, "Forwarding request");
    session
        .send(EdgeMessage::RequestStart(RequestStart {
            id: id.clone(),
            domain: host,
            method: parts.method.to_string(),
            url,
            headers,
            has_body,
        }))
        .await?;

    if has_body {
        tokio::spawn(forward_body(session.clone(), id.clone(), body));
    }

    // Dropped while waiting means the caller left; the guard forgets the
    // request and later agent messages for it are dropped.
    let reply = reply.await;
    guard.disarm();
    let reply = reply.map_err(|_| TunnelError::ConnectionClosed)??;

    match reply {
        Reply::Response(head) => Ok(build_response(head, body_rx)),
        Reply::Upgrade(frames) => match upgrade {
            Some(upgrade) => Ok(complete_upgrade(upgrade, session, id, frames)),
            None => {
                session.close_socket(&id).await?;
                Err(TunnelError::NotUpgradable(id))
            }
        },
    }
}

/// Drains the inbound body into `request-data` messages. Runs alongside the
/// wait for the response.
async fn forward_body(session: Arc<Session>, id: StreamId, body: Body) {
    let mut chunks = body.into_data_stream();
    while let Some(chunk) = chunks.next().await {
        match chunk {
            Ok(chunk) => {
                if session
                    .send(EdgeMessage::RequestData { id: id.clone(), chunk })
                    .await
                    .is_err()
                {
                    return;
                }
            }
            Err(e) => {
                warn!(id = %id, "Inbound request body failed: {}", e);
                break;
            }
        }
    }
    let _ = session.send(EdgeMessage::RequestEnd { id }).await;
}

fn build_response(head: ResponseStart, body: StreamReceiver<Bytes>) -> Response {
    let status = StatusCode::from_u16(head.status_code).unwrap_or_else(|_| {
        warn!(id = %head.id, status = head.status_code, "Agent sent an invalid status code");
        StatusCode::BAD_GATEWAY
    });
    let body = if is_null_body_status(head.status_code) {
        Body::empty()
    } else {
        Body::from_stream(body.into_stream())
    };

    let mut response = Response::new(body);
    *response.status_mut() = status;
    *response.headers_mut() = to_header_map(&head.headers);
    response
}

fn complete_upgrade(
    upgrade: WebSocketUpgrade,
    session: Arc<Session>,
    id: StreamId,
    frames: StreamReceiver<tunnel_protocol::RelayFrame>,
) -> Response {
    let failed_session = session.clone();
    let failed_id = id.clone();
    upgrade
        .on_failed_upgrade(move |e: axum::Error| {
            warn!(id = %failed_id, "Inbound WebSocket upgrade failed: {}", e);
            tokio::spawn(async move {
                let _ = failed_session.close_socket(&failed_id).await;
            });
        })
        .on_upgrade(move |socket| relay::run(socket, session, id, frames))
}

/// Forgets a pending request whose handler is dropped before the agent
/// answered.
struct PendingGuard {
    session: Arc<Session>,
    id: StreamId,
    armed: bool,
}

impl PendingGuard {
    fn new(session: Arc<Session>, id: StreamId) -> Self {
        Self {
            session,
            id,
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        if self.armed && self.session.forget(&self.id) {
            debug!(id = %self.id, "Inbound caller aborted");
        }
    }
}
