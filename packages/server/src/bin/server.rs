//! Realtime messaging server for the Renraku marketplace.
//!
//! Carries chat messages, job-room presence and typing indicators over one
//! WebSocket endpoint. Message storage is out of scope here; wire a real
//! `PersistenceHook` when embedding this in the full deployment.
//!
//! Run with:
//! ```not_rust
//! cargo run --bin renraku-server
//! cargo run --bin renraku-server -- --host 0.0.0.0 --port 3000
//! ```

use std::sync::Arc;

use clap::Parser;

use renraku_server::config::ServerConfig;
use renraku_server::persistence::NoopPersistence;
use renraku_server::run_server;
use renraku_server::state::AppState;
use renraku_shared::logger::setup_logger;

#[derive(Parser, Debug)]
#[command(name = "renraku-server")]
#[command(about = "Realtime messaging server with rooms, presence and typing", long_about = None)]
struct Args {
    /// Host address to bind the server to
    #[arg(short = 'H', long, default_value = "127.0.0.1")]
    host: String,

    /// Port number to bind the server to
    #[arg(short = 'p', long, default_value = "8080")]
    port: u16,
}

#[tokio::main]
async fn main() {
    setup_logger(env!("CARGO_BIN_NAME"), "debug");

    let args = Args::parse();

    let state = Arc::new(AppState::new(
        Arc::new(NoopPersistence),
        ServerConfig::default(),
    ));

    if let Err(e) = run_server(args.host, args.port, state).await {
        tracing::error!("Server error: {}", e);
        std::process::exit(1);
    }
}
