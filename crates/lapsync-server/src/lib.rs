//! Lapsync Web Server - Axum
//!
//! Serves the shared lap ledger to timing clients: one WebSocket connection
//! session per client plus a small REST surface for status, laps and resets.

pub mod api;
pub mod logs;
pub mod ws;

use axum::http::{header, HeaderValue};
use axum::Router;
use lapsync_core::ControllerHandle;
use logs::LogBuffer;
use std::future::Future;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::set_header::SetResponseHeaderLayer;

/// Shared application state accessible from all handlers
#[derive(Clone)]
pub struct AppState {
    /// Handle to the session controller thread
    pub controller: ControllerHandle,
    /// Server configuration
    pub config: ServerConfig,
    /// Recent log lines for the diagnostics endpoint
    pub logs: LogBuffer,
}

/// Server configuration
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Port to listen on
    pub port: u16,
    /// Bind address
    pub bind_addr: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8920,
            bind_addr: "0.0.0.0".to_string(),
        }
    }
}

impl AppState {
    pub fn new(controller: ControllerHandle, config: ServerConfig, logs: LogBuffer) -> Self {
        Self {
            controller,
            config,
            logs,
        }
    }
}

/// Build the Axum router with all routes
pub fn build_router(state: AppState) -> Router {
    Router::new()
        // REST API
        .route("/api/v1/status", axum::routing::get(api::get_status))
        .route(
            "/api/v1/laps",
            axum::routing::get(api::get_laps).post(api::submit_lap),
        )
        .route("/api/v1/reset", axum::routing::post(api::reset_session))
        .route(
            "/api/v1/remote-url",
            axum::routing::get(api::get_remote_url),
        )
        // Diagnostic logs
        .route("/api/v1/logs", axum::routing::get(api::get_logs))
        // WebSocket
        .route("/api/v1/ws", axum::routing::get(ws::ws_handler))
        .layer(CorsLayer::permissive())
        .layer(SetResponseHeaderLayer::overriding(
            header::X_FRAME_OPTIONS,
            HeaderValue::from_static("DENY"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            header::X_CONTENT_TYPE_OPTIONS,
            HeaderValue::from_static("nosniff"),
        ))
        .with_state(state)
}

/// Bind the listener described by `config`
pub async fn bind(config: &ServerConfig) -> anyhow::Result<TcpListener> {
    let addr = format!("{}:{}", config.bind_addr, config.port);
    let listener = TcpListener::bind(&addr).await?;
    Ok(listener)
}

/// Serve on an already bound listener until `shutdown` resolves
pub async fn serve<F>(listener: TcpListener, state: AppState, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr: SocketAddr = listener.local_addr()?;
    let app = build_router(state);
    tracing::info!(%addr, "Lapsync web server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;
    tracing::info!("Lapsync web server stopped");
    Ok(())
}

/// Start the web server and run until Ctrl+C
pub async fn start_server(state: AppState) -> anyhow::Result<()> {
    let listener = bind(&state.config).await?;
    serve(listener, state, async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for shutdown signal: {}", e);
            std::future::pending::<()>().await;
        }
    })
    .await
}
