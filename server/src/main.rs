use clap::Parser;
use tokio::net::TcpListener;
use tracing::{error, info};

use tunnel_server::config::ServerConfig;
use tunnel_server::state::AppState;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tunnel_server=info,tower_http=info".into()),
        )
        .init();

    let config = ServerConfig::parse();
    let api_keys = config.api_key_set()?;
    let state = AppState::new(api_keys);

    let addr = config.listen_addr();
    let listener = TcpListener::bind(addr).await?;
    info!("🚇 Tunnel Server listening on {}", addr);

    tunnel_server::serve(listener, state, shutdown_signal()).await?;
    info!("Tunnel Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Shutdown signal received"),
        Err(e) => {
            error!("Unable to listen for shutdown signal: {}", e);
            std::future::pending::<()>().await;
        }
    }
}
