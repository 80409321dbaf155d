//! # Agent Errors

use thiserror::Error;
use tunnel_protocol::ChannelClosed;

#[derive(Debug, Error)]
pub enum AgentError {
    /// The edge refused the registration, e.g. for an unknown API key.
    #[error("registration rejected: {0}")]
    Rejected(String),

    #[error("connection to the tunnel server closed")]
    Disconnected,

    #[error(transparent)]
    Channel(#[from] ChannelClosed),

    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// The local HTTP call failed.
    #[error("{0}")]
    Local(#[from] reqwest::Error),

    #[error("invalid HTTP method: {0}")]
    InvalidMethod(String),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Invalid agent configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("no domain configured; set --domain or TUNNEL_DOMAIN")]
    MissingDomain,

    #[error("no API key configured; set --api-key or TUNNEL_API_KEY")]
    MissingApiKey,

    #[error("unsupported URL scheme: {0}")]
    UnsupportedScheme(String),

    #[error("tunnel server URL cannot carry a path: {0}")]
    InvalidServer(String),
}
