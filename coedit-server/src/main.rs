//! coedit-server — real-time collaborative text editing over WebSocket.
//!
//! Listens on `0.0.0.0:$PORT` (default 8080) and stores documents under
//! `$COEDIT_DOCUMENTS_DIR` (default `./documents`). Log output follows
//! `RUST_LOG`, defaulting to `info`.

use log::info;

use coedit_server::server::{ServerConfig, ServerError, SyncServer};

#[tokio::main]
async fn main() -> Result<(), ServerError> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    info!("Starting coedit-server...");
    let config = ServerConfig::from_env();
    SyncServer::bind(config).await?.run().await
}
