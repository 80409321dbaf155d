use clap::Parser;

use tunnel_client::AgentConfig;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tunnel_client=info".into()),
        )
        .init();

    let config = AgentConfig::parse();
    tunnel_client::run(config).await?;
    Ok(())
}
