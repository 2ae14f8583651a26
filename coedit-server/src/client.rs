//! Per-connection client: identity, outbound queues and the task pair that
//! bridges the WebSocket to the room.
//!
//! ```text
//!             ┌───────────── inbound task ─────────────┐
//!  WebSocket ─┤ route_frame ─► RoomHandle (legacy|collab)│
//!             └────────────────────────────────────────┘
//!             ┌───────────── outbound task ────────────┐
//!  WebSocket ◄┤ legacy queue | collab queue | ping tick │
//!             └────────────────────────────────────────┘
//! ```
//!
//! Both tasks write through one `Mutex`-guarded sink so frames from the two
//! queues and keepalive pings never interleave on the wire.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, RwLock};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::WebSocketStream;
use uuid::Uuid;

use crate::protocol::{route_frame, CollabMessage, Inbound, Message};
use crate::room::RoomHandle;
use crate::server::ServerStats;

/// Connection identity, unique per accepted connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(Arc<str>);

impl ClientId {
    /// Fresh `user-xxxxxxxxxxxx` identity.
    pub fn generate() -> Self {
        let id = Uuid::new_v4().simple().to_string();
        Self(format!("user-{}", &id[..12]).into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ClientId {
    fn from(id: &str) -> Self {
        Self(id.into())
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Upgraded, not yet admitted by the hub
    Connecting,
    /// Join acknowledgment and snapshot queued
    Registered,
    /// Relaying in both directions
    Active,
    /// Read error, timeout or close frame seen
    Closing,
    /// Queues and socket closed
    Closed,
}

/// Why a non-blocking send to a client did not go through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    #[error("outbound queue full")]
    Full,
    #[error("outbound queue closed")]
    Closed,
}

impl<T> From<mpsc::error::TrySendError<T>> for SendError {
    fn from(e: mpsc::error::TrySendError<T>) -> Self {
        match e {
            mpsc::error::TrySendError::Full(_) => SendError::Full,
            mpsc::error::TrySendError::Closed(_) => SendError::Closed,
        }
    }
}

struct Outbound {
    legacy: Mutex<Option<mpsc::Sender<Message>>>,
    collab: Mutex<Option<mpsc::Sender<CollabMessage>>>,
    closed: AtomicBool,
}

/// Sending side of a client, shared by the hub and the room.
///
/// Holds the only senders of the two outbound queues; [`close`](Self::close)
/// drops them exactly once, after which the outbound task drains what is
/// already queued and then sees the queues as closed.
#[derive(Clone)]
pub struct ClientHandle {
    id: ClientId,
    room_id: Arc<str>,
    outbound: Arc<Outbound>,
}

/// Receiving side of a client's outbound queues, owned by the outbound task.
pub struct ClientQueues {
    pub legacy: mpsc::Receiver<Message>,
    pub collab: mpsc::Receiver<CollabMessage>,
}

impl ClientHandle {
    /// Create a client for `room_id` with two queues of `capacity` each.
    pub fn new(id: ClientId, room_id: impl Into<Arc<str>>, capacity: usize) -> (Self, ClientQueues) {
        let (legacy_tx, legacy_rx) = mpsc::channel(capacity);
        let (collab_tx, collab_rx) = mpsc::channel(capacity);
        let handle = Self {
            id,
            room_id: room_id.into(),
            outbound: Arc::new(Outbound {
                legacy: Mutex::new(Some(legacy_tx)),
                collab: Mutex::new(Some(collab_tx)),
                closed: AtomicBool::new(false),
            }),
        };
        let queues = ClientQueues {
            legacy: legacy_rx,
            collab: collab_rx,
        };
        (handle, queues)
    }

    pub fn id(&self) -> &ClientId {
        &self.id
    }

    pub fn room_id(&self) -> &Arc<str> {
        &self.room_id
    }

    /// Queue a legacy message without waiting.
    pub fn try_send_legacy(&self, msg: Message) -> Result<(), SendError> {
        let guard = self.outbound.legacy.lock().unwrap_or_else(PoisonError::into_inner);
        match guard.as_ref() {
            Some(tx) => tx.try_send(msg).map_err(SendError::from),
            None => Err(SendError::Closed),
        }
    }

    /// Queue a collab message without waiting.
    pub fn try_send_collab(&self, msg: CollabMessage) -> Result<(), SendError> {
        let guard = self.outbound.collab.lock().unwrap_or_else(PoisonError::into_inner);
        match guard.as_ref() {
            Some(tx) => tx.try_send(msg).map_err(SendError::from),
            None => Err(SendError::Closed),
        }
    }

    /// Close both outbound queues. Returns `true` only for the call that
    /// actually closed them.
    pub fn close(&self) -> bool {
        if self.outbound.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.outbound.legacy.lock().unwrap_or_else(PoisonError::into_inner).take();
        self.outbound.collab.lock().unwrap_or_else(PoisonError::into_inner).take();
        true
    }

    pub fn is_closed(&self) -> bool {
        self.outbound.closed.load(Ordering::Acquire)
    }
}

impl fmt::Debug for ClientHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientHandle")
            .field("id", &self.id)
            .field("room_id", &self.room_id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Read-side deadlines of a connection.
#[derive(Debug, Clone, Copy)]
pub struct Keepalive {
    /// Ping period of the outbound task
    pub ping_interval: Duration,
    /// Deadline extension after an ordinary frame
    pub idle_timeout: Duration,
    /// Deadline extension after a keepalive response
    pub keepalive_timeout: Duration,
    /// Longest a single frame may take to reach the socket
    pub write_timeout: Duration,
}

pub(crate) type SharedSink<S> = Arc<tokio::sync::Mutex<SplitSink<WebSocketStream<S>, WsMessage>>>;

/// Inbound task: parse frames and forward them to the room until the peer
/// goes away, errors, or stays silent past the read deadline.
pub(crate) async fn read_loop<S>(
    mut reader: SplitStream<WebSocketStream<S>>,
    client: &ClientHandle,
    room: &RoomHandle,
    keepalive: Keepalive,
    stats: &RwLock<ServerStats>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut deadline = Instant::now() + keepalive.idle_timeout;

    loop {
        let frame = tokio::select! {
            frame = reader.next() => frame,
            _ = tokio::time::sleep_until(deadline) => {
                log::info!("Client {} read timeout", client.id());
                break;
            }
        };

        if client.is_closed() {
            log::info!("Client {} was removed from room {}, stop reading", client.id(), room.id());
            break;
        }

        match frame {
            Some(Ok(WsMessage::Text(text))) => {
                deadline = deadline.max(Instant::now() + keepalive.idle_timeout);
                stats.write().await.frames_received += 1;

                let forwarded = match route_frame(text.as_str()) {
                    Ok(Inbound::Collab(mut msg)) => {
                        msg.user_id = client.id().to_string();
                        room.send_collab(msg).await
                    }
                    Ok(Inbound::Legacy(msg)) => room.send_legacy(client.id().clone(), msg).await,
                    Err(e) => {
                        log::warn!("Discarding frame from {}: {e}", client.id());
                        stats.write().await.frames_discarded += 1;
                        continue;
                    }
                };
                if forwarded.is_err() {
                    log::warn!("Room {} is gone, dropping client {}", room.id(), client.id());
                    break;
                }
            }
            Some(Ok(WsMessage::Pong(_))) | Some(Ok(WsMessage::Ping(_))) => {
                log::trace!("Keepalive from {}", client.id());
                deadline = Instant::now() + keepalive.keepalive_timeout;
            }
            Some(Ok(WsMessage::Binary(_))) => {
                log::warn!("Discarding binary frame from {}", client.id());
                stats.write().await.frames_discarded += 1;
            }
            Some(Ok(WsMessage::Close(_))) | None => {
                log::info!("Client {} closed the connection", client.id());
                break;
            }
            Some(Ok(WsMessage::Frame(_))) => {}
            Some(Err(e)) => {
                log::warn!("Read error from {}: {e}", client.id());
                break;
            }
        }
    }
}

/// Outbound task: serialize queued messages and keepalive pings onto the
/// shared sink. Ends with a close frame once either queue is closed, or
/// early when a write fails or stalls past `write_timeout`.
pub(crate) async fn write_loop<S>(
    sink: SharedSink<S>,
    mut queues: ClientQueues,
    client_id: ClientId,
    keepalive: Keepalive,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let ping_interval = keepalive.ping_interval;
    let mut ticker = tokio::time::interval_at(Instant::now() + ping_interval, ping_interval);

    loop {
        let frame = tokio::select! {
            msg = queues.legacy.recv() => match msg {
                Some(msg) => msg.encode().map(WsMessage::text),
                None => break,
            },
            msg = queues.collab.recv() => match msg {
                Some(msg) => msg.encode().map(WsMessage::text),
                None => break,
            },
            _ = ticker.tick() => {
                log::trace!("Ping {client_id}");
                Ok(WsMessage::Ping(Default::default()))
            }
        };

        let frame = match frame {
            Ok(frame) => frame,
            Err(e) => {
                log::error!("Failed to encode message for {client_id}: {e}");
                continue;
            }
        };

        let mut guard = sink.lock().await;
        if !write_frame(&mut guard, frame, keepalive.write_timeout, &client_id).await {
            return;
        }
    }

    log::debug!("Outbound queues of {client_id} closed");
    let mut sink = sink.lock().await;
    let mut pending = Vec::new();
    while let Ok(msg) = queues.legacy.try_recv() {
        pending.push(msg.encode());
    }
    while let Ok(msg) = queues.collab.try_recv() {
        pending.push(msg.encode());
    }
    for text in pending.into_iter().flatten() {
        if !write_frame(&mut sink, WsMessage::text(text), keepalive.write_timeout, &client_id).await {
            return;
        }
    }
    write_frame(&mut sink, WsMessage::Close(None), keepalive.write_timeout, &client_id).await;
}

async fn write_frame<S>(
    sink: &mut SplitSink<WebSocketStream<S>, WsMessage>,
    frame: WsMessage,
    write_timeout: Duration,
    client_id: &ClientId,
) -> bool
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match tokio::time::timeout(write_timeout, sink.send(frame)).await {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            log::warn!("Write error to {client_id}: {e}");
            false
        }
        Err(_) => {
            log::warn!("Write to {client_id} stalled for {write_timeout:?}");
            false
        }
    }
}
