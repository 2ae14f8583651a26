//! Hub actor: the directory of live rooms.
//!
//! Registrations and unregistrations are processed one at a time by a
//! single task, so two clients racing into the same new room can never
//! create it twice.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};

use crate::client::{ClientHandle, ClientId};
use crate::protocol::{CollabMessage, Message};
use crate::room::{Room, RoomHandle, RoomOptions};
use crate::storage::DocumentStore;

/// Capacity of each hub inbound stream.
const HUB_QUEUE_CAPACITY: usize = 256;

/// The hub task has stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("hub stopped")]
pub struct HubStopped;

struct Registration {
    client: ClientHandle,
    reply: oneshot::Sender<RoomHandle>,
}

/// Cloneable address of the hub.
#[derive(Clone)]
pub struct HubHandle {
    register_tx: mpsc::Sender<Registration>,
    unregister_tx: mpsc::Sender<ClientHandle>,
    inspect_tx: mpsc::Sender<oneshot::Sender<Vec<String>>>,
}

impl HubHandle {
    /// Admit a client to the room named by its `room_id`.
    ///
    /// When this returns the client has its join acknowledgment and
    /// version snapshot queued and the room handle to forward frames to.
    pub async fn register(&self, client: ClientHandle) -> Result<RoomHandle, HubStopped> {
        let (reply, room) = oneshot::channel();
        self.register_tx
            .send(Registration { client, reply })
            .await
            .map_err(|_| HubStopped)?;
        room.await.map_err(|_| HubStopped)
    }

    /// Remove a client from its room and close its outbound queues.
    pub async fn unregister(&self, client: ClientHandle) -> Result<(), HubStopped> {
        self.unregister_tx.send(client).await.map_err(|_| HubStopped)
    }

    /// Identifiers of the rooms currently in the directory, sorted.
    pub async fn active_rooms(&self) -> Result<Vec<String>, HubStopped> {
        let (reply, rooms) = oneshot::channel();
        self.inspect_tx.send(reply).await.map_err(|_| HubStopped)?;
        rooms.await.map_err(|_| HubStopped)
    }
}

struct RoomEntry {
    handle: RoomHandle,
    members: HashSet<ClientId>,
}

/// Directory of rooms, owned by the hub task.
pub struct Hub {
    rooms: HashMap<Arc<str>, RoomEntry>,
    store: Arc<dyn DocumentStore>,
    options: RoomOptions,
}

impl Hub {
    pub fn new(store: Arc<dyn DocumentStore>, options: RoomOptions) -> Self {
        Self {
            rooms: HashMap::new(),
            store,
            options,
        }
    }

    /// Start the hub task and return its handle.
    pub fn spawn(self) -> HubHandle {
        let (register_tx, register_rx) = mpsc::channel(HUB_QUEUE_CAPACITY);
        let (unregister_tx, unregister_rx) = mpsc::channel(HUB_QUEUE_CAPACITY);
        let (inspect_tx, inspect_rx) = mpsc::channel(HUB_QUEUE_CAPACITY);
        tokio::spawn(self.run(register_rx, unregister_rx, inspect_rx));
        HubHandle {
            register_tx,
            unregister_tx,
            inspect_tx,
        }
    }

    async fn run(
        mut self,
        mut register_rx: mpsc::Receiver<Registration>,
        mut unregister_rx: mpsc::Receiver<ClientHandle>,
        mut inspect_rx: mpsc::Receiver<oneshot::Sender<Vec<String>>>,
    ) {
        loop {
            tokio::select! {
                // Pending registrations settle before a directory inspection.
                biased;
                Some(Registration { client, reply }) = register_rx.recv() => {
                    let room = self.register(client);
                    let _ = reply.send(room);
                }
                Some(client) = unregister_rx.recv() => self.unregister(&client).await,
                Some(reply) = inspect_rx.recv() => {
                    let _ = reply.send(self.room_ids());
                }
                else => break,
            }
        }
        log::debug!("Hub stopped");
    }

    fn register(&mut self, client: ClientHandle) -> RoomHandle {
        let room_id = Arc::clone(client.room_id());
        let entry = self.rooms.entry(Arc::clone(&room_id)).or_insert_with(|| {
            log::info!("Creating room {room_id}");
            RoomEntry {
                handle: Room::open(Arc::clone(&room_id), Arc::clone(&self.store), self.options.clone())
                    .spawn(),
                members: HashSet::new(),
            }
        });
        entry.members.insert(client.id().clone());
        log::info!(
            "Client {} added to room {room_id} (total clients: {})",
            client.id(),
            entry.members.len()
        );

        // Queue the acknowledgment and snapshot before the room can route
        // anything to this client, so they are always its first messages.
        if client.try_send_legacy(Message::join(client.id().as_str())).is_err() {
            log::warn!("Could not queue join acknowledgment for {}", client.id());
        }
        let snapshot = entry.handle.snapshot();
        if client
            .try_send_collab(CollabMessage::version(snapshot.version, snapshot.content))
            .is_err()
        {
            log::warn!("Could not queue version snapshot for {}", client.id());
        }

        if entry.handle.join(client).is_err() {
            log::error!("Room {room_id} stopped while still in the directory");
        }
        entry.handle.clone()
    }

    async fn unregister(&mut self, client: &ClientHandle) {
        client.close();

        let room_id = client.room_id();
        let Some(entry) = self.rooms.get_mut(room_id) else {
            return;
        };
        if !entry.members.remove(client.id()) {
            return;
        }
        let _ = entry.handle.leave(client.id().clone());
        log::info!(
            "Client {} left room {room_id} (remaining clients: {})",
            client.id(),
            entry.members.len()
        );

        if entry.members.is_empty() {
            if let Some(entry) = self.rooms.remove(room_id) {
                entry.handle.close().await;
                log::info!("Room {room_id} removed (empty)");
            }
        }
    }

    fn room_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.rooms.keys().map(|id| id.to_string()).collect();
        ids.sort();
        ids
    }
}
