use anyhow::Context;
use clap::Parser;
use rendezvous_lib::config::RelayConfig;
use rendezvous_lib::signaling::{serve, RelayRouter};
use std::sync::Arc;
use tokio::net::TcpListener;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    rendezvous_lib::init_tracing();

    let config = RelayConfig::parse();
    tracing::info!(
        "Starting signaling relay (port {}, allowed origin '{}')",
        config.port,
        config.allowed_origin
    );

    let addr = config.listen_addr();
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;

    serve(listener, Arc::new(RelayRouter::new()), &config).await?;
    Ok(())
}
