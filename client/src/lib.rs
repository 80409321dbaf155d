//! # Tunnel Client
//!
//! The agent side of the tunnel. It keeps one outbound control channel to
//! the tunnel server, registers a public domain on it and serves every
//! request the server forwards for that domain from a local service.

pub mod agent;
pub mod config;
pub mod error;
pub mod executor;
pub mod relay;
pub mod state;

pub use agent::{connect, run, Connection};
pub use config::AgentConfig;
pub use error::AgentError;
