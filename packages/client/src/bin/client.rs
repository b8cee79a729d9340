//! CLI chat client for the Renraku realtime messaging transport.
//!
//! Opens one managed connection, authenticates with the given user id, and
//! drives it from a readline prompt. Reconnects automatically with backoff on
//! abnormal closures; messages typed while offline are queued and flushed on
//! reconnect.
//!
//! Run with:
//! ```not_rust
//! cargo run --bin renraku-client -- --user-id worker-42
//! cargo run --bin renraku-client -- -U worker-42 -u ws://127.0.0.1:8080/ws
//! ```

use clap::Parser;

use renraku_shared::logger::setup_logger;

#[derive(Parser, Debug)]
#[command(name = "renraku-client")]
#[command(about = "Realtime messaging client with reconnection support", long_about = None)]
struct Args {
    /// Authenticated user id to connect as
    #[arg(short = 'U', long)]
    user_id: String,

    /// WebSocket server URL
    #[arg(short = 'u', long, default_value = "ws://127.0.0.1:8080/ws")]
    url: String,
}

#[tokio::main]
async fn main() {
    setup_logger(env!("CARGO_BIN_NAME"), "info");

    let args = Args::parse();

    if let Err(e) = renraku_client::run_client(args.url, args.user_id).await {
        tracing::error!("Client error: {}", e);
        std::process::exit(1);
    }
}
