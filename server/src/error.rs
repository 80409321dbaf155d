//! # Server Errors
//!
//! Every failure inside the relay is converted into a [`TunnelError`]. Only
//! the inbound HTTP surface turns them into responses; the control channel
//! loop logs them and cleans up the affected stream.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;
use tunnel_protocol::{ChannelClosed, StreamId};

/// Body returned when no agent serves the requested host.
pub const NO_REGISTRATION: &str = "No registration for domain and/or remote service not available";

/// Body returned when the request could not be handed to the agent.
pub const SEND_FAILED: &str = "Error sending request to remote client";

/// Text sent to an agent presenting an unknown API key.
pub const INVALID_API_KEY: &str = "Invalid API key";

#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("Invalid API key")]
    Unauthorized,

    #[error("No registration for domain and/or remote service not available")]
    NoRegistration,

    #[error("Error sending request to remote client")]
    Send(#[from] ChannelClosed),

    /// The agent connection went away before the stream finished.
    #[error("Connection closed")]
    ConnectionClosed,

    /// The agent reported a failed local call.
    #[error("Connection closed: {0}")]
    Upstream(String),

    #[error("request {0} has no upgradable connection")]
    NotUpgradable(StreamId),
}

impl IntoResponse for TunnelError {
    fn into_response(self) -> Response {
        (StatusCode::SERVICE_UNAVAILABLE, self.to_string()).into_response()
    }
}

/// Invalid server configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("no API keys configured; set --api-keys or API_KEYS")]
    NoApiKeys,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn routing_failures_are_503_with_plain_text() {
        let response = TunnelError::NoRegistration.into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], NO_REGISTRATION.as_bytes());
    }

    #[test]
    fn closed_channel_reads_as_send_failure() {
        assert_eq!(TunnelError::from(ChannelClosed).to_string(), SEND_FAILED);
    }
}
