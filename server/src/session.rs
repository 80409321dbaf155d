//! # Agent Sessions
//!
//! One [`Session`] exists per connected agent. It owns the outbound half of
//! the control channel and two id-keyed tables of in-flight streams:
//! - **pending**: HTTP requests waiting for, or streaming, their response
//! - **sockets**: established WebSocket relays
//!
//! All tables use [`DashMap`] since the receive loop, the inbound HTTP
//! handlers and the relay tasks touch them concurrently. Entries are cloned
//! out before any `.await` so no shard lock is held across a suspension.

use std::sync::Mutex;

use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::oneshot;
use tracing::{debug, error, info};
use tunnel_protocol::{
    stream_channel, ChannelClosed, ControlSender, EdgeMessage, RelayFrame, ResponseStart, StreamId,
    StreamReceiver, StreamSender,
};

use crate::error::TunnelError;

/// What the agent answered for a pending request.
#[derive(Debug)]
pub enum Reply {
    /// Regular response; the body follows as `data` messages.
    Response(ResponseStart),
    /// The agent's local WebSocket is open; frames for the inbound socket
    /// arrive on this receiver.
    Upgrade(StreamReceiver<RelayFrame>),
}

pub type Responder = oneshot::Sender<Result<Reply, TunnelError>>;

/// Edge-side state of one inbound HTTP request.
#[derive(Debug)]
pub struct PendingRequest {
    /// Resolved exactly once, by `response-start`, `ws-opened` or a failure.
    responder: Option<Responder>,
    /// Feeds the response body handed to the inbound caller.
    body: StreamSender<Bytes>,
}

impl PendingRequest {
    pub fn new(responder: Responder, body: StreamSender<Bytes>) -> Self {
        Self {
            responder: Some(responder),
            body,
        }
    }

    /// Fails the request: rejects the response if it is still unresolved,
    /// otherwise aborts the body already being streamed.
    fn fail(self, error: TunnelError) {
        match self.responder {
            Some(responder) => {
                let _ = responder.send(Err(error));
            }
            None => self.body.abort(error.to_string()),
        }
    }
}

/// Edge-side state of one agent's control channel.
pub struct Session {
    /// Unique per connection; lets a disconnect leave alone a domain that a
    /// newer connection has taken over.
    pub conn_id: String,

    /// Outbound half of the control channel.
    sender: ControlSender<EdgeMessage>,

    /// Domains this connection registered.
    domains: Mutex<Vec<String>>,

    /// HTTP requests awaiting or streaming their response, by stream id.
    pending: DashMap<StreamId, PendingRequest>,

    /// Frame queues of relayed inbound sockets, by stream id.
    sockets: DashMap<StreamId, StreamSender<RelayFrame>>,
}

impl Session {
    pub fn new(conn_id: String, sender: ControlSender<EdgeMessage>) -> Self {
        Self {
            conn_id,
            sender,
            domains: Mutex::new(Vec::new()),
            pending: DashMap::new(),
            sockets: DashMap::new(),
        }
    }

    /// Queues a message for the agent, waiting while the channel is full.
    pub async fn send(&self, message: EdgeMessage) -> Result<(), ChannelClosed> {
        self.sender.send(message).await
    }

    // ── Registered Domains ──

    pub fn add_domain(&self, domain: &str) {
        let mut domains = self.domains.lock().unwrap_or_else(|e| e.into_inner());
        if !domains.iter().any(|d| d == domain) {
            domains.push(domain.to_owned());
        }
    }

    pub fn domains(&self) -> Vec<String> {
        self.domains.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    // ── Pending Requests ──

    pub fn track(&self, id: StreamId, request: PendingRequest) {
        self.pending.insert(id, request);
    }

    /// Drops the request's state without notifying anyone.
    pub fn forget(&self, id: &str) -> bool {
        self.pending.remove(id).is_some()
    }

    #[cfg(test)]
    pub fn is_pending(&self, id: &str) -> bool {
        self.pending.contains_key(id)
    }

    fn take_responder(&self, id: &str) -> Option<Responder> {
        self.pending.get_mut(id).and_then(|mut request| request.responder.take())
    }

    /// `response-start`: hands the status line and headers to the waiting
    /// handler, which builds the inbound response around the body stream.
    pub fn resolve(&self, head: ResponseStart) {
        let id = head.id.clone();
        let Some(responder) = self.take_responder(&id) else {
            error!(id = %id, "Didn't find response object, probably dead?");
            return;
        };
        if responder.send(Ok(Reply::Response(head))).is_err() {
            debug!(id = %id, "Inbound caller left before the response started");
            self.pending.remove(&id);
        }
    }

    /// `data`: forwards one body chunk to the inbound caller. Never waits on
    /// the caller, so a slow reader cannot hold up the receive loop.
    pub fn push_body(&self, id: &str, chunk: Bytes) {
        let Some(body) = self.pending.get(id).map(|request| request.body.clone()) else {
            error!(id = %id, "Didn't find response object, unable to send data");
            return;
        };
        if body.send(chunk).is_err() {
            info!(id = %id, "Request was aborted");
            self.pending.remove(id);
        }
    }

    /// `data-end`: completes the body, or fails the request when the agent
    /// reports an error.
    pub fn finish(&self, id: &str, error: Option<String>) {
        let Some((_, request)) = self.pending.remove(id) else {
            error!(id = %id, "Didn't find response object, unable to end data");
            return;
        };
        match error {
            Some(error) => {
                info!(id = %id, error = %error, "Agent reported a failed request");
                request.fail(TunnelError::Upstream(error));
            }
            // Dropping the last body sender ends the stream cleanly.
            None => drop(request),
        }
    }

    // ── WebSocket Relays ──

    /// `ws-opened`: turns the pending request into a socket relay and tells
    /// the waiting handler to complete the upgrade.
    pub async fn open_socket(&self, id: &str) -> Result<(), TunnelError> {
        let Some((_, request)) = self.pending.remove(id) else {
            debug!(id = %id, "ws-opened for an unknown request");
            return Ok(());
        };
        let Some(responder) = request.responder else {
            error!(id = %id, "ws-opened after the response already started");
            self.send(EdgeMessage::WsClosed { id: id.to_owned() }).await?;
            return Ok(());
        };

        let (frames_tx, frames_rx) = stream_channel();
        self.sockets.insert(id.to_owned(), frames_tx);
        if responder.send(Ok(Reply::Upgrade(frames_rx))).is_err() {
            self.close_socket(id).await?;
        }
        Ok(())
    }

    /// `ws-message`: writes one frame to the inbound socket.
    pub fn push_frame(&self, id: &str, frame: RelayFrame) {
        let Some(socket) = self.sockets.get(id).map(|socket| socket.clone()) else {
            debug!(id = %id, "ws-message for an unknown socket");
            return;
        };
        if socket.send(frame).is_err() {
            self.sockets.remove(id);
        }
    }

    /// `ws-closed` from the agent: dropping the frame sender makes the relay
    /// task close the inbound socket. Unknown ids are ignored.
    pub fn drop_socket(&self, id: &str) -> bool {
        self.sockets.remove(id).is_some()
    }

    /// The inbound side of a relay is gone: forget it and tell the agent.
    pub async fn close_socket(&self, id: &str) -> Result<(), ChannelClosed> {
        self.sockets.remove(id);
        self.send(EdgeMessage::WsClosed { id: id.to_owned() }).await
    }

    #[cfg(test)]
    pub fn has_socket(&self, id: &str) -> bool {
        self.sockets.contains_key(id)
    }

    // ── Teardown ──

    /// Fails every in-flight stream after the control channel is gone.
    pub fn teardown(&self) {
        let ids: Vec<StreamId> = self.pending.iter().map(|entry| entry.key().clone()).collect();
        for id in ids {
            if let Some((_, request)) = self.pending.remove(&id) {
                request.fail(TunnelError::ConnectionClosed);
            }
        }
        self.sockets.clear();
    }
}
