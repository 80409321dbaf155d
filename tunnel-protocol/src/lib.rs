//! # Tunnel Protocol
//!
//! Shared by the edge server and the agent:
//! - [`message`]: the two tagged message families exchanged over a control channel
//! - [`headers`]: flattening and filtering of HTTP headers across the tunnel
//! - [`channel`]: the ordered, backpressured outbound half of a control channel
//! - [`stream`]: per-id chunk queues bridging bodies and socket frames
//!
//! ```text
//! Edge ──request-start / request-data / request-end / ws-*──▶ Agent
//! Edge ◀──response-start / data / data-end / ws-*─────────── Agent
//! ```

pub mod channel;
pub mod headers;
pub mod message;
pub mod stream;

pub use channel::{control_channel, ChannelClosed, ControlChannel, ControlSender, CONTROL_CHANNEL_CAPACITY};
pub use headers::{flatten_headers, is_null_body_status, to_header_map, Headers};
pub use message::{
    decode, decode_slice, encode, new_stream_id, AgentMessage, EdgeMessage, ProtocolError, RelayFrame,
    RequestStart, ResponseStart, StreamId,
};
pub use stream::{stream_channel, StreamClosed, StreamReceiver, StreamSender};
