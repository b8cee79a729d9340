//! Server execution logic.

use std::sync::Arc;

use axum::{Router, routing::get};
use tower_http::trace::TraceLayer;

use crate::error::ServerError;
use crate::handler::websocket_handler;
use crate::http::{get_rooms, health_check};
use crate::signal::shutdown_signal;
use crate::state::AppState;

/// Build the router. Split out from [`run_server`] so tests can serve the
/// same app on an ephemeral listener.
pub fn app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/ws", get(websocket_handler))
        .route("/api/health", get(health_check))
        .route("/api/rooms", get(get_rooms))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Run the realtime messaging server until a shutdown signal arrives.
///
/// # Arguments
///
/// * `host` - The host address to bind to (e.g., "127.0.0.1")
/// * `port` - The port number to bind to (e.g., 8080)
/// * `state` - Shared application state
pub async fn run_server(host: String, port: u16, state: Arc<AppState>) -> Result<(), ServerError> {
    let bind_addr = format!("{}:{}", host, port);
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .map_err(|source| ServerError::Bind {
            addr: bind_addr.clone(),
            source,
        })?;

    tracing::info!("Realtime messaging server listening on {}", bind_addr);
    tracing::info!("Connect to: ws://{}/ws", bind_addr);
    tracing::info!("Press Ctrl+C to shutdown gracefully");

    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(ServerError::Serve)?;

    tracing::info!("Server shutdown complete");

    Ok(())
}
