//! # Agent State
//!
//! Per-connection state of the agent, shared by the receive loop and the
//! tasks it spawns via `Arc<AgentState>`:
//! - **request_bodies**: inbound request bodies being streamed into local calls
//! - **ws_relays**: established local WebSocket relays
//!
//! Both tables are keyed by the edge-assigned stream id and live exactly as
//! long as one control channel connection.

use bytes::Bytes;
use dashmap::DashMap;
use tracing::debug;
use tunnel_protocol::{
    stream_channel, AgentMessage, ChannelClosed, ControlSender, RelayFrame, StreamId, StreamReceiver, StreamSender,
};
use url::Url;

use crate::error::AgentError;

/// Everything one control channel connection of the agent shares.
pub struct AgentState {
    /// Base URL of the local service.
    local_addr: Url,

    /// Client for local HTTP calls. Redirects are relayed, never followed.
    pub client: reqwest::Client,

    /// Outbound half of the control channel.
    tx: ControlSender<AgentMessage>,

    /// Bodies of in-flight local calls, fed by `request-data`.
    request_bodies: DashMap<StreamId, StreamSender<Bytes>>,

    /// Frame queues of open local WebSocket relays, fed by `ws-message`.
    ws_relays: DashMap<StreamId, StreamSender<RelayFrame>>,
}

impl AgentState {
    pub fn new(local_addr: Url, tx: ControlSender<AgentMessage>) -> Result<Self, AgentError> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .no_proxy()
            .build()?;
        Ok(Self {
            local_addr,
            client,
            tx,
            request_bodies: DashMap::new(),
            ws_relays: DashMap::new(),
        })
    }

    pub async fn send(&self, message: AgentMessage) -> Result<(), ChannelClosed> {
        self.tx.send(message).await
    }

    /// Resolves a forwarded path and query against the local service.
    pub fn resolve(&self, target: &str) -> Url {
        let (path, query) = match target.split_once('?') {
            Some((path, query)) => (path, Some(query)),
            None => (target, None),
        };
        let mut url = self.local_addr.clone();
        url.set_path(path);
        url.set_query(query);
        url
    }

    // ── Request Bodies ──

    /// Creates the body channel for `id`; chunks pushed from now on are read
    /// by the returned receiver.
    pub fn open_body(&self, id: &str) -> StreamReceiver<Bytes> {
        let (tx, rx) = stream_channel();
        self.request_bodies.insert(id.to_owned(), tx);
        rx
    }

    /// `request-data`: feeds one chunk to the local call.
    pub fn push_body(&self, id: &str, chunk: Bytes) {
        let Some(body) = self.request_bodies.get(id).map(|body| body.clone()) else {
            debug!(id = %id, "request-data for an unknown request");
            return;
        };
        if body.send(chunk).is_err() {
            debug!(id = %id, "Local call no longer reads its body");
            self.request_bodies.remove(id);
        }
    }

    /// `request-end`, or the local call settled: ends the body stream.
    pub fn end_body(&self, id: &str) -> bool {
        self.request_bodies.remove(id).is_some()
    }

    // ── WebSocket Relays ──

    /// Registers the channel carrying edge frames to the local socket of `id`.
    /// Must happen before `ws-opened` is sent, so that the first
    /// `ws-message` from the edge finds it.
    pub fn track_relay(&self, id: &str) -> StreamReceiver<RelayFrame> {
        let (tx, rx) = stream_channel();
        self.ws_relays.insert(id.to_owned(), tx);
        rx
    }

    /// `ws-message`: queues one frame for the local socket.
    pub fn push_frame(&self, id: &str, frame: RelayFrame) {
        let Some(relay) = self.ws_relays.get(id).map(|relay| relay.clone()) else {
            debug!(id = %id, "ws-message for an unknown socket");
            return;
        };
        if relay.send(frame).is_err() {
            self.ws_relays.remove(id);
        }
    }

    /// `ws-closed`, or the local socket closed: forgets the relay, which
    /// makes its task close the local socket. Unknown ids are ignored.
    pub fn drop_relay(&self, id: &str) -> bool {
        self.ws_relays.remove(id).is_some()
    }

    // ── Teardown ──

    /// Abandons every stream after the control channel closed.
    pub fn teardown(&self) {
        let ids: Vec<StreamId> = self.request_bodies.iter().map(|entry| entry.key().clone()).collect();
        for id in ids {
            if let Some((_, body)) = self.request_bodies.remove(&id) {
                body.abort("tunnel connection closed");
            }
        }
        self.ws_relays.clear();
    }
}
