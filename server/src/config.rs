//! Command-line and environment configuration for the edge server.

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use clap::Parser;

use crate::error::ConfigError;

#[derive(Parser, Debug, Clone)]
#[command(name = "tunnel-server", about = "Edge relay for reverse tunnels")]
pub struct ServerConfig {
    /// Port for inbound HTTP traffic and agent connections.
    #[arg(long, env = "PORT", default_value_t = 8000)]
    pub port: u16,

    /// Address to bind.
    #[arg(long, env = "BIND_ADDRESS", default_value_t = IpAddr::V4(Ipv4Addr::UNSPECIFIED))]
    pub bind: IpAddr,

    /// Comma-separated API keys agents may register with.
    #[arg(long = "api-keys", env = "API_KEYS", value_delimiter = ',', hide_env_values = true)]
    pub api_keys: Vec<String>,
}

impl ServerConfig {
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind, self.port)
    }

    /// The allow-list with blank entries removed.
    pub fn api_key_set(&self) -> Result<HashSet<String>, ConfigError> {
        let keys: HashSet<String> = self
            .api_keys
            .iter()
            .map(|key| key.trim())
            .filter(|key| !key.is_empty())
            .map(str::to_owned)
            .collect();
        if keys.is_empty() {
            return Err(ConfigError::NoApiKeys);
        }
        Ok(keys)
    }
}
