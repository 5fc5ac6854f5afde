//! Standalone test server for E2E testing
//!
//! Starts the Axum server over an in-memory store so tests and demos need
//! no database file.

use lapsync_core::{ControllerHandle, EngineConfig, MemoryStore};
use lapsync_server::logs::LogBuffer;
use lapsync_server::{AppState, ServerConfig};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[tokio::main]
async fn main() {
    let logs = LogBuffer::default();
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            tracing_subscriber::EnvFilter::new("lapsync=debug,lapsync_core=debug,lapsync_server=debug")
        }))
        .with(tracing_subscriber::fmt::layer())
        .with(logs.layer())
        .init();

    let port = std::env::var("PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8920u16);

    let controller = match ControllerHandle::spawn(Box::new(MemoryStore::new()), EngineConfig::default())
    {
        Ok(controller) => controller,
        Err(e) => {
            tracing::error!("Failed to start session controller: {}", e);
            std::process::exit(1);
        }
    };

    let config = ServerConfig {
        port,
        bind_addr: "127.0.0.1".to_string(),
    };
    let state = AppState::new(controller, config, logs);

    tracing::info!(port, "Test server starting");

    if let Err(e) = lapsync_server::start_server(state).await {
        tracing::error!("Server error: {}", e);
        std::process::exit(1);
    }
}
