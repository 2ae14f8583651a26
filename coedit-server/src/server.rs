//! WebSocket server: accepts connections on `/ws/{roomID}` and wires each
//! one to the hub.
//!
//! ```text
//! TCP accept ── upgrade (/ws/{room}) ── register with Hub ── RoomHandle
//!                                                 │
//!                    ┌────────────────────────────┴─────────┐
//!                    ▼                                      ▼
//!              read_loop (inbound)                  write_loop (outbound)
//!        frames ─► Room streams              client queues ─► socket + pings
//! ```
//!
//! A connection lives until either task ends: the inbound one on peer
//! close, read error, read deadline or room gone; the outbound one on a
//! failed or stalled write, or when the room evicts the client. The hub is
//! then told to unregister it, which closes the outbound queues and lets a
//! still running writer flush and send a close frame.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;

use crate::client::{self, ClientHandle, ClientId, ConnectionState, Keepalive};
use crate::hub::{Hub, HubHandle, HubStopped};
use crate::room::RoomOptions;
use crate::storage::{is_valid_room_id, DocumentStore, FileStore, MemoryStore, StoreConfig, StoreError};

/// Path prefix of the collaboration endpoint.
pub const ROOM_PATH_PREFIX: &str = "/ws/";

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Capacity of each per-client outbound queue
    pub client_queue_capacity: usize,
    /// Capacity of each room inbound stream
    pub room_queue_capacity: usize,
    /// Keepalive ping period
    pub ping_interval: Duration,
    /// Read deadline extension after an ordinary frame
    pub idle_timeout: Duration,
    /// Read deadline extension after a keepalive response
    pub keepalive_timeout: Duration,
    /// Longest a single outbound frame may take to reach the socket
    pub write_timeout: Duration,
    /// Relay a `leave` frame to the remaining members on departure
    pub announce_departures: bool,
    /// Document directory (None = in-memory only)
    pub storage: Option<StoreConfig>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8080".to_string(),
            client_queue_capacity: 256,
            room_queue_capacity: 256,
            ping_interval: Duration::from_secs(54),
            idle_timeout: Duration::from_secs(60),
            keepalive_timeout: Duration::from_secs(360),
            write_timeout: Duration::from_secs(10),
            announce_departures: false,
            storage: Some(StoreConfig::default()),
        }
    }
}

impl ServerConfig {
    /// Defaults overridden by `PORT` and `COEDIT_DOCUMENTS_DIR`.
    pub fn from_env() -> Self {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    fn from_vars(var: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(port) = var("PORT").filter(|p| !p.is_empty()) {
            config.bind_addr = format!("0.0.0.0:{port}");
        }
        if let Some(dir) = var("COEDIT_DOCUMENTS_DIR").filter(|d| !d.is_empty()) {
            config.storage = Some(StoreConfig {
                path: dir.into(),
                ..StoreConfig::default()
            });
        }
        config
    }

    /// In-memory server on an ephemeral local port.
    pub fn for_testing() -> Self {
        Self {
            bind_addr: "127.0.0.1:0".to_string(),
            storage: None,
            ..Self::default()
        }
    }

    pub fn keepalive(&self) -> Keepalive {
        Keepalive {
            ping_interval: self.ping_interval,
            idle_timeout: self.idle_timeout,
            keepalive_timeout: self.keepalive_timeout,
            write_timeout: self.write_timeout,
        }
    }

    /// Reject settings the server cannot run with.
    pub fn validate(&self) -> Result<(), ServerError> {
        if self.client_queue_capacity == 0 {
            return Err(ServerError::InvalidConfig("client_queue_capacity must be at least 1"));
        }
        if self.room_queue_capacity == 0 {
            return Err(ServerError::InvalidConfig("room_queue_capacity must be at least 1"));
        }
        if self.ping_interval.is_zero() {
            return Err(ServerError::InvalidConfig("ping_interval must be non-zero"));
        }
        Ok(())
    }

    pub fn room_options(&self) -> RoomOptions {
        RoomOptions {
            queue_capacity: self.room_queue_capacity,
            announce_departures: self.announce_departures,
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    /// Text frames read from clients
    pub frames_received: u64,
    /// Frames dropped as malformed or unsupported
    pub frames_discarded: u64,
    /// Lifecycle state of every open connection, by client identity
    pub connections: HashMap<String, ConnectionState>,
}

impl ServerStats {
    /// Number of open connections currently in `state`.
    pub fn connections_in(&self, state: ConnectionState) -> usize {
        self.connections.values().filter(|s| **s == state).count()
    }
}

/// Server errors.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error(transparent)]
    Hub(#[from] HubStopped),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(&'static str),
}

/// The collaboration server.
pub struct SyncServer {
    config: ServerConfig,
    listener: TcpListener,
    hub: HubHandle,
    stats: Arc<RwLock<ServerStats>>,
}

impl SyncServer {
    /// Open the document store, start the hub, and bind the listener.
    pub async fn bind(config: ServerConfig) -> Result<Self, ServerError> {
        config.validate()?;
        let store: Arc<dyn DocumentStore> = match &config.storage {
            Some(store_config) => Arc::new(FileStore::open(store_config.clone())?),
            None => {
                log::info!("No document directory configured, documents are kept in memory");
                Arc::new(MemoryStore::new())
            }
        };
        let hub = Hub::new(store, config.room_options()).spawn();
        let listener = TcpListener::bind(&config.bind_addr).await?;
        log::info!("Collaboration server listening on {}", listener.local_addr()?);

        Ok(Self {
            config,
            listener,
            hub,
            stats: Arc::new(RwLock::new(ServerStats::default())),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.listener.local_addr()?)
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn hub(&self) -> &HubHandle {
        &self.hub
    }

    /// Shared statistics handle, readable while the server runs.
    pub fn stats_handle(&self) -> Arc<RwLock<ServerStats>> {
        Arc::clone(&self.stats)
    }

    /// Get a snapshot of the server statistics.
    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }

    /// Accept connections until the listener fails.
    pub async fn run(self) -> Result<(), ServerError> {
        loop {
            let (stream, addr) = self.listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let hub = self.hub.clone();
            let stats = Arc::clone(&self.stats);
            let config = self.config.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, addr, hub, stats, config).await {
                    log::warn!("Connection error from {addr}: {e}");
                }
            });
        }
    }
}

/// Room identifier named by an upgrade path, if it is a valid one.
pub fn room_from_path(path: &str) -> Option<&str> {
    path.strip_prefix(ROOM_PATH_PREFIX)
        .filter(|room_id| is_valid_room_id(room_id))
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    hub: HubHandle,
    stats: Arc<RwLock<ServerStats>>,
    config: ServerConfig,
) -> Result<(), ServerError> {
    let mut room_id = None;
    let ws_stream = tokio_tungstenite::accept_hdr_async(stream, |req: &Request, resp: Response| {
        match room_from_path(req.uri().path()) {
            Some(id) => {
                room_id = Some(id.to_string());
                Ok(resp)
            }
            None => {
                let mut refusal = ErrorResponse::new(Some("unknown room path".to_string()));
                *refusal.status_mut() = StatusCode::NOT_FOUND;
                Err(refusal)
            }
        }
    })
    .await?;
    let Some(room_id) = room_id else {
        return Ok(());
    };

    let id = ClientId::generate();
    log::info!("WebSocket connection from {addr} as {id} for room {room_id}");
    {
        let mut s = stats.write().await;
        s.total_connections += 1;
        s.active_connections += 1;
    }
    transition(&stats, &id, ConnectionState::Connecting).await;

    let keepalive = config.keepalive();
    let (client, queues) = ClientHandle::new(id.clone(), room_id, config.client_queue_capacity);
    let room = match hub.register(client.clone()).await {
        Ok(room) => room,
        Err(e) => {
            transition(&stats, &id, ConnectionState::Closed).await;
            stats.write().await.active_connections -= 1;
            return Err(e.into());
        }
    };
    transition(&stats, &id, ConnectionState::Registered).await;

    let (writer, reader) = ws_stream.split();
    let writer = Arc::new(tokio::sync::Mutex::new(writer));
    let mut outbound = tokio::spawn(client::write_loop(writer, queues, id.clone(), keepalive));

    transition(&stats, &id, ConnectionState::Active).await;
    // Whichever side ends first ends the connection.
    let writer_done = tokio::select! {
        _ = client::read_loop(reader, &client, &room, keepalive, &stats) => false,
        _ = &mut outbound => {
            log::info!("Outbound side of {id} ended, closing connection");
            true
        }
    };

    transition(&stats, &id, ConnectionState::Closing).await;
    let unregistered = hub.unregister(client.clone()).await;
    if unregistered.is_err() {
        // The hub is gone; close the queues so the writer still finishes.
        client.close();
    }
    if !writer_done && tokio::time::timeout(keepalive.write_timeout, &mut outbound).await.is_err() {
        log::warn!("Outbound side of {id} did not finish, aborting it");
        outbound.abort();
    }

    transition(&stats, &id, ConnectionState::Closed).await;
    stats.write().await.active_connections -= 1;
    log::info!("Client {id} disconnected from room {}", client.room_id());
    unregistered.map_err(ServerError::from)
}

/// Record a connection's lifecycle step. `Closed` connections are forgotten.
async fn transition(stats: &RwLock<ServerStats>, id: &ClientId, state: ConnectionState) {
    log::debug!("Client {id} {state:?}");
    let mut s = stats.write().await;
    if state == ConnectionState::Closed {
        s.connections.remove(id.as_str());
    } else {
        s.connections.insert(id.to_string(), state);
    }
}
