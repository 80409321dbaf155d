//! Command-line and environment configuration for the agent.

use clap::Parser;
use url::Url;

use crate::error::ConfigError;

/// Path of the edge's control channel endpoint.
pub const CONNECT_PATH: &str = "_connect";

#[derive(Parser, Debug, Clone)]
#[command(name = "tunnel-client", about = "Exposes a local service through a tunnel server")]
pub struct AgentConfig {
    /// Base URL of the tunnel server (ws, wss, http or https).
    #[arg(long, env = "TUNNEL_SERVER", default_value = "ws://127.0.0.1:8000")]
    pub server: Url,

    /// Local service that receives the tunneled requests.
    #[arg(long = "local-addr", env = "LOCAL_ADDR", default_value = "http://127.0.0.1:3000")]
    pub local_addr: Url,

    /// Public domain to register.
    #[arg(long, env = "TUNNEL_DOMAIN")]
    pub domain: String,

    /// API key presented at registration.
    #[arg(long = "api-key", env = "TUNNEL_API_KEY", hide_env_values = true)]
    pub api_key: String,
}

impl AgentConfig {
    /// The control channel URL: the server URL with a WebSocket scheme and
    /// `/_connect` appended to its path.
    pub fn connect_url(&self) -> Result<Url, ConfigError> {
        let scheme = match self.server.scheme() {
            "ws" | "http" => "ws",
            "wss" | "https" => "wss",
            other => return Err(ConfigError::UnsupportedScheme(other.to_owned())),
        };
        let mut url = self.server.clone();
        url.set_scheme(scheme)
            .map_err(|()| ConfigError::UnsupportedScheme(scheme.to_owned()))?;
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|()| ConfigError::InvalidServer(self.server.to_string()))?;
            segments.pop_if_empty().push(CONNECT_PATH);
        }
        Ok(url)
    }

    /// Rejects configurations the agent cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.domain.trim().is_empty() {
            return Err(ConfigError::MissingDomain);
        }
        if self.api_key.is_empty() {
            return Err(ConfigError::MissingApiKey);
        }
        match self.local_addr.scheme() {
            "http" | "https" => {}
            other => return Err(ConfigError::UnsupportedScheme(other.to_owned())),
        }
        self.connect_url().map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(server: &str) -> AgentConfig {
        AgentConfig::try_parse_from([
            "tunnel-client",
            "--server",
            server,
            "--domain",
            "a.example",
            "--api-key",
            "K",
        ])
        .unwrap()
    }

    #[test]
    fn connect_url_appends_the_control_path() {
        assert_eq!(config("ws://edge:8000").connect_url().unwrap().as_str(), "ws://edge:8000/_connect");
        assert_eq!(config("ws://edge/base/").connect_url().unwrap().as_str(), "ws://edge/base/_connect");
    }

    #[test]
    fn http_schemes_map_to_websocket_schemes() {
        assert_eq!(config("http://edge").connect_url().unwrap().scheme(), "ws");
        assert_eq!(config("https://edge").connect_url().unwrap().scheme(), "wss");
        assert!(matches!(
            config("ftp://edge").connect_url(),
            Err(ConfigError::UnsupportedScheme(_))
        ));
    }

    #[test]
    fn defaults_point_at_localhost() {
        let config = config("ws://edge");
        assert_eq!(config.local_addr.as_str(), "http://127.0.0.1:3000/");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn blank_domain_is_rejected() {
        let mut config = config("ws://edge");
        config.domain = "  ".into();
        assert!(matches!(config.validate(), Err(ConfigError::MissingDomain)));
    }
}
