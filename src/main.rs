//! Chess Rooms Server
//!
//! Binds the WebSocket server with an in-memory user directory.

use std::sync::Arc;

use tracing::info;
use tracing_subscriber::EnvFilter;

use chess_rooms::{GameServer, InMemoryDirectory, ServerConfig, VERSION};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = ServerConfig::from_env();
    info!("Chess Rooms Server v{}", VERSION);
    info!(
        "Clock: {}s per side, invitations expire after {:?}",
        config.coordinator.seconds_per_side, config.coordinator.invitation_timeout
    );

    let server = Arc::new(GameServer::new(config, Arc::new(InMemoryDirectory::new())));

    let shutdown = server.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Ctrl-C received");
            shutdown.shutdown();
        }
    });

    server.run().await?;
    info!("Server stopped");
    Ok(())
}
