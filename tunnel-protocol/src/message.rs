//! # Control Channel Messages
//!
//! Defines every message exchanged between the edge server and an agent.
//! Messages travel as JSON text frames using serde's internally-tagged
//! representation: the `"type"` field carries the kebab-case variant name
//! and the remaining fields are camelCase, e.g.
//!
//! ```json
//! {"type":"request-start","id":"…","domain":"a.example","method":"GET",
//!  "url":"/","headers":{},"hasBody":false}
//! ```
//!
//! Byte payloads (`chunk`, `data`) are base64 strings.

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::headers::Headers;

/// Identifier of one logical stream (an HTTP request or a WebSocket relay).
/// Chosen by the edge and reused by both directions for the stream's lifetime.
pub type StreamId = String;

/// Generates a fresh stream identifier.
pub fn new_stream_id() -> StreamId {
    Uuid::new_v4().to_string()
}

/// Errors raised while encoding or decoding control channel frames.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed control message: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("unable to encode control message: {0}")]
    Encode(#[source] serde_json::Error),
}

// ─── Agent → Edge ───────────────────────────────────────────────

/// Messages originated by the agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum AgentMessage {
    /// First message on a fresh connection: claim `domain` using `api_key`.
    Register {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        api_key: String,
        domain: String,
    },

    /// Status line and headers of the local response for `id`.
    ResponseStart(ResponseStart),

    /// One chunk of the local response body.
    Data {
        id: StreamId,
        #[serde(with = "base64_bytes")]
        chunk: Bytes,
    },

    /// End of the response body. A set `error` means the local call failed
    /// and the inbound caller must see an aborted response.
    DataEnd {
        id: StreamId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    /// The local WebSocket for `id` is connected; the edge may upgrade.
    WsOpened { id: StreamId },

    /// A frame read from the agent's local socket.
    WsMessage {
        id: StreamId,
        #[serde(with = "base64_bytes")]
        data: Bytes,
        #[serde(default = "binary_default")]
        binary: bool,
    },

    /// The agent's local socket for `id` closed.
    WsClosed { id: StreamId },
}

// ─── Edge → Agent ───────────────────────────────────────────────

/// Messages originated by the edge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum EdgeMessage {
    /// Registration accepted; `domain` now routes to this agent.
    Registered {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        domain: String,
    },

    /// Registration rejected. The edge closes the connection right after.
    Error { message: String },

    /// A new inbound request to execute locally.
    RequestStart(RequestStart),

    /// One chunk of the inbound request body.
    RequestData {
        id: StreamId,
        #[serde(with = "base64_bytes")]
        chunk: Bytes,
    },

    /// The inbound request body is complete.
    RequestEnd { id: StreamId },

    /// A frame read from the inbound caller's socket.
    WsMessage {
        id: StreamId,
        #[serde(with = "base64_bytes")]
        data: Bytes,
        #[serde(default = "binary_default")]
        binary: bool,
    },

    /// The inbound caller's socket for `id` closed.
    WsClosed { id: StreamId },
}

/// Metadata of an inbound request forwarded to the agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestStart {
    pub id: StreamId,
    pub domain: String,
    pub method: String,
    /// Path and query only; scheme and host are stripped by the edge.
    pub url: String,
    pub headers: Headers,
    pub has_body: bool,
}

/// Status line and headers of a response produced by the agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseStart {
    pub id: StreamId,
    pub status_code: u16,
    #[serde(default)]
    pub status_message: String,
    pub headers: Headers,
}

impl AgentMessage {
    /// The stream this message belongs to, if any.
    pub fn stream_id(&self) -> Option<&str> {
        match self {
            AgentMessage::Register { .. } => None,
            AgentMessage::ResponseStart(head) => Some(&head.id),
            AgentMessage::Data { id, .. }
            | AgentMessage::DataEnd { id, .. }
            | AgentMessage::WsOpened { id }
            | AgentMessage::WsMessage { id, .. }
            | AgentMessage::WsClosed { id } => Some(id),
        }
    }

    /// Wraps a relayed socket frame.
    pub fn ws_message(id: StreamId, frame: RelayFrame) -> Self {
        AgentMessage::WsMessage {
            id,
            data: frame.data,
            binary: frame.binary,
        }
    }
}

impl EdgeMessage {
    /// Wraps a relayed socket frame.
    pub fn ws_message(id: StreamId, frame: RelayFrame) -> Self {
        EdgeMessage::WsMessage {
            id,
            data: frame.data,
            binary: frame.binary,
        }
    }
}

// ─── Relayed WebSocket Frames ───────────────────────────────────

/// A single WebSocket data frame carried across the tunnel.
///
/// Ping, pong and close frames are never relayed: each side's socket
/// library answers pings itself and closure travels as `ws-closed`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayFrame {
    pub data: Bytes,
    pub binary: bool,
}

impl RelayFrame {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            data: Bytes::from(text.into()),
            binary: false,
        }
    }

    pub fn binary(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            binary: true,
        }
    }

    /// Text payload of a text frame. Binary frames, and text frames whose
    /// payload is not valid UTF-8, come back as raw bytes.
    pub fn into_text(self) -> Result<String, Bytes> {
        if self.binary {
            return Err(self.data);
        }
        String::from_utf8(self.data.to_vec()).map_err(|e| Bytes::from(e.into_bytes()))
    }
}

fn binary_default() -> bool {
    true
}

// ─── Framing ────────────────────────────────────────────────────

/// Serializes a message into the text payload of one frame.
pub fn encode<M: Serialize>(message: &M) -> Result<String, ProtocolError> {
    serde_json::to_string(message).map_err(ProtocolError::Encode)
}

/// Parses the text payload of one frame.
pub fn decode<M: DeserializeOwned>(text: &str) -> Result<M, ProtocolError> {
    serde_json::from_str(text).map_err(ProtocolError::Decode)
}

/// Parses a frame payload received as raw bytes.
pub fn decode_slice<M: DeserializeOwned>(payload: &[u8]) -> Result<M, ProtocolError> {
    serde_json::from_slice(payload).map_err(ProtocolError::Decode)
}

mod base64_bytes {
    use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        BASE64
            .decode(encoded.as_bytes())
            .map(Bytes::from)
            .map_err(serde::de::Error::custom)
    }
}
