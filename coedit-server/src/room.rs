//! Room actor: the single writer of one document's state.
//!
//! ```text
//!  inbound tasks ──legacy──┐
//!  inbound tasks ──collab──┼──► Room::run ──► Document (positional)
//!  hub ──────────control───┘        │     └─► Version + ChangeLog
//!                                   │
//!                       try_send ───┴──► member outbound queues
//! ```
//!
//! Everything the room owns is mutated only inside [`Room::run`]. The one
//! exception is the published [`RoomSnapshot`], which the hub reads at join
//! time through [`RoomHandle::snapshot`].
//!
//! The two streams use different overflow policies. A full legacy queue
//! marks the member as unresponsive and evicts it; a full collab queue only
//! drops that message, since a client can always catch up with a pull.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{mpsc, oneshot};

use crate::client::{ClientHandle, ClientId, SendError};
use crate::document::Document;
use crate::protocol::{CollabMessage, CollabType, CollabUpdate, Message, MessageType};
use crate::storage::DocumentStore;

/// Immutable view of the room state handed out at join time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoomSnapshot {
    pub version: u64,
    pub content: String,
}

/// Room tuning knobs.
#[derive(Debug, Clone)]
pub struct RoomOptions {
    /// Capacity of each inbound stream (legacy, collab)
    pub queue_capacity: usize,
    /// Relay a `leave` message to the remaining members when a client leaves
    pub announce_departures: bool,
}

impl Default for RoomOptions {
    fn default() -> Self {
        Self {
            queue_capacity: 256,
            announce_departures: false,
        }
    }
}

/// The room's stream has shut down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("room closed")]
pub struct RoomClosed;

enum Control {
    Join(ClientHandle),
    Leave(ClientId),
    Close(oneshot::Sender<()>),
}

/// Cloneable address of a running room.
#[derive(Clone)]
pub struct RoomHandle {
    id: Arc<str>,
    legacy_tx: mpsc::Sender<(ClientId, Message)>,
    collab_tx: mpsc::Sender<CollabMessage>,
    control_tx: mpsc::UnboundedSender<Control>,
    snapshot: Arc<Mutex<RoomSnapshot>>,
}

impl RoomHandle {
    pub fn id(&self) -> &Arc<str> {
        &self.id
    }

    /// Enqueue a legacy operation originating from `origin`.
    pub async fn send_legacy(&self, origin: ClientId, msg: Message) -> Result<(), RoomClosed> {
        self.legacy_tx.send((origin, msg)).await.map_err(|_| RoomClosed)
    }

    /// Enqueue a collab request. `msg.user_id` must already carry the sender's identity.
    pub async fn send_collab(&self, msg: CollabMessage) -> Result<(), RoomClosed> {
        self.collab_tx.send(msg).await.map_err(|_| RoomClosed)
    }

    /// Current `(version, content)`, read under the snapshot lock.
    pub fn snapshot(&self) -> RoomSnapshot {
        self.snapshot.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub(crate) fn join(&self, client: ClientHandle) -> Result<(), RoomClosed> {
        self.control_tx.send(Control::Join(client)).map_err(|_| RoomClosed)
    }

    pub(crate) fn leave(&self, client_id: ClientId) -> Result<(), RoomClosed> {
        self.control_tx.send(Control::Leave(client_id)).map_err(|_| RoomClosed)
    }

    /// Stop the room after it has applied everything already queued.
    pub(crate) async fn close(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.control_tx.send(Control::Close(done_tx)).is_ok() {
            let _ = done_rx.await;
        }
    }
}

/// One document's authoritative state.
pub struct Room {
    id: Arc<str>,
    members: HashMap<ClientId, ClientHandle>,
    /// Identities removed for backpressure. Frames they still had in flight
    /// are dropped instead of applied.
    evicted: HashSet<ClientId>,
    document: Document,
    version: u64,
    change_log: Vec<CollabUpdate>,
    store: Arc<dyn DocumentStore>,
    options: RoomOptions,
    snapshot: Arc<Mutex<RoomSnapshot>>,
}

impl Room {
    /// Create a room, loading any persisted content for `id`.
    ///
    /// A missing or unreadable document starts the room empty.
    pub fn open(id: impl Into<Arc<str>>, store: Arc<dyn DocumentStore>, options: RoomOptions) -> Self {
        let id = id.into();
        let document = match store.load(&id) {
            Ok(Some(content)) => {
                log::info!("Loaded document for room {id} ({} characters)", content.chars().count());
                Document::with_content(content)
            }
            Ok(None) => {
                log::info!("No existing document for room {id}, starting fresh");
                Document::new()
            }
            Err(e) => {
                log::error!("Failed to load document for room {id}: {e}");
                Document::new()
            }
        };
        let snapshot = Arc::new(Mutex::new(RoomSnapshot {
            version: 0,
            content: document.content().to_string(),
        }));

        Self {
            id,
            members: HashMap::new(),
            evicted: HashSet::new(),
            document,
            version: 0,
            change_log: Vec::new(),
            store,
            options,
            snapshot,
        }
    }

    /// Start the actor loop and return its handle.
    pub fn spawn(self) -> RoomHandle {
        let (legacy_tx, legacy_rx) = mpsc::channel(self.options.queue_capacity);
        let (collab_tx, collab_rx) = mpsc::channel(self.options.queue_capacity);
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let handle = RoomHandle {
            id: Arc::clone(&self.id),
            legacy_tx,
            collab_tx,
            control_tx,
            snapshot: Arc::clone(&self.snapshot),
        };
        tokio::spawn(self.run(legacy_rx, collab_rx, control_rx));
        handle
    }

    async fn run(
        mut self,
        mut legacy_rx: mpsc::Receiver<(ClientId, Message)>,
        mut collab_rx: mpsc::Receiver<CollabMessage>,
        mut control_rx: mpsc::UnboundedReceiver<Control>,
    ) {
        log::debug!("Room {} started", self.id);
        let done = loop {
            tokio::select! {
                // Membership changes are applied before any frame that was
                // queued after them.
                biased;
                Some(cmd) = control_rx.recv() => match cmd {
                    Control::Join(client) => self.add_member(client),
                    Control::Leave(client_id) => self.remove_member(&client_id),
                    Control::Close(done) => break Some(done),
                },
                Some((origin, msg)) = legacy_rx.recv() => self.apply_operation(&origin, msg),
                Some(msg) = collab_rx.recv() => self.handle_collab_message(msg),
                else => break None,
            }
        };

        // Apply whatever was accepted before the close request.
        while let Ok((origin, msg)) = legacy_rx.try_recv() {
            self.apply_operation(&origin, msg);
        }
        while let Ok(msg) = collab_rx.try_recv() {
            self.handle_collab_message(msg);
        }

        drop(legacy_rx);
        drop(collab_rx);
        drop(control_rx);
        log::debug!("Room {} stopped", self.id);
        if let Some(done) = done {
            let _ = done.send(());
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn change_log(&self) -> &[CollabUpdate] {
        &self.change_log
    }

    pub fn document(&self) -> &Document {
        &self.document
    }

    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    pub fn is_evicted(&self, client_id: &ClientId) -> bool {
        self.evicted.contains(client_id)
    }

    pub fn is_member(&self, client_id: &ClientId) -> bool {
        self.members.contains_key(client_id)
    }

    pub fn add_member(&mut self, client: ClientHandle) {
        log::debug!("Client {} joined room {}", client.id(), self.id);
        self.members.insert(client.id().clone(), client);
    }

    /// Remove a member. Its queues are closed by the hub, not here.
    pub fn remove_member(&mut self, client_id: &ClientId) {
        if self.members.remove(client_id).is_none() {
            return;
        }
        log::debug!("Client {client_id} left room {} ({} remaining)", self.id, self.members.len());

        if self.options.announce_departures {
            let notice = Message::leave(client_id.as_str());
            for member in self.members.values() {
                if member.try_send_legacy(notice.clone()).is_err() {
                    log::debug!("Skipping leave notice for {}", member.id());
                }
            }
        }
    }

    /// Legacy stream: apply a positional edit, persist it, and relay the
    /// message to every member except `origin`.
    pub fn apply_operation(&mut self, origin: &ClientId, msg: Message) {
        if self.evicted.contains(origin) {
            log::debug!("Room {}: dropping {:?} from evicted client {origin}", self.id, msg.msg_type);
            return;
        }
        match msg.msg_type {
            MessageType::Insert => {
                let at = self.document.insert(msg.position, &msg.content);
                log::debug!("Room {}: insert {:?} at {at}", self.id, msg.content);
                self.persist();
            }
            MessageType::Delete => {
                let span = self.document.delete(msg.position, msg.content.chars().count());
                log::debug!("Room {}: delete {span:?}", self.id);
                self.persist();
            }
            MessageType::Cursor => {
                log::trace!("Room {}: cursor {} from {}", self.id, msg.position, msg.user_id);
            }
            MessageType::Join | MessageType::Leave => {}
        }
        self.relay(origin, &msg);
    }

    /// Collab stream: answer a pull or apply a push.
    pub fn handle_collab_message(&mut self, msg: CollabMessage) {
        if self.evicted.contains(&ClientId::from(msg.user_id.as_str())) {
            log::debug!("Room {}: dropping {:?} from evicted client {}", self.id, msg.msg_type, msg.user_id);
            return;
        }
        match msg.msg_type {
            CollabType::Pull => self.handle_pull(&msg),
            CollabType::Push => self.handle_push(msg),
            CollabType::Version | CollabType::Updates => {
                log::warn!("Room {}: ignoring server-only {:?} from {}", self.id, msg.msg_type, msg.user_id);
            }
        }
    }

    /// Log entries that advance `version` to the current version.
    pub fn changes_since(&self, version: u64) -> &[CollabUpdate] {
        let end = usize::try_from(self.version)
            .unwrap_or(usize::MAX)
            .min(self.change_log.len());
        let start = usize::try_from(version).unwrap_or(usize::MAX).min(end);
        &self.change_log[start..end]
    }

    /// Oldest version a push may still be based on.
    ///
    /// The change log is never pruned, so this is always zero and no push is
    /// ever stale. It becomes meaningful once old entries are dropped.
    pub fn history_floor(&self) -> u64 {
        self.version.saturating_sub(self.change_log.len() as u64)
    }

    fn handle_pull(&self, msg: &CollabMessage) {
        let updates = self.changes_since(msg.version).to_vec();
        log::debug!(
            "Room {}: pull from {} at version {} (current {}), {} updates",
            self.id,
            msg.user_id,
            msg.version,
            self.version,
            updates.len()
        );
        self.reply_collab(&msg.user_id, CollabMessage::updates(self.version, updates));
    }

    fn handle_push(&mut self, msg: CollabMessage) {
        log::debug!(
            "Room {}: push from {}, {} updates at version {} (current {})",
            self.id,
            msg.user_id,
            msg.updates.len(),
            msg.version,
            self.version
        );

        if msg.version < self.history_floor() {
            log::info!(
                "Room {}: push from {} at version {} is behind retained history, resending log",
                self.id,
                msg.user_id,
                msg.version
            );
            let backlog = self.changes_since(0).to_vec();
            self.reply_collab(&msg.user_id, CollabMessage::updates(self.version, backlog));
            return;
        }

        let mut accepted = Vec::with_capacity(msg.updates.len());
        for mut update in msg.updates {
            self.version += 1;
            update.version = self.version;
            self.change_log.push(update.clone());
            accepted.push(update);
        }
        debug_assert_eq!(self.change_log.len() as u64, self.version);
        self.publish_snapshot();

        // The sender is included: the broadcast doubles as its confirmation.
        let confirmation = CollabMessage::updates(self.version, accepted);
        for member in self.members.values() {
            match member.try_send_collab(confirmation.clone()) {
                Ok(()) => {}
                Err(SendError::Full) => {
                    log::warn!("Collab queue full for client {}, dropping updates", member.id());
                }
                Err(SendError::Closed) => {}
            }
        }
    }

    fn reply_collab(&self, user_id: &str, msg: CollabMessage) {
        let Some(member) = self.members.get(&ClientId::from(user_id)) else {
            log::debug!("Room {}: {user_id} is not a member, dropping reply", self.id);
            return;
        };
        if let Err(SendError::Full) = member.try_send_collab(msg) {
            log::warn!("Collab queue full for client {user_id}, dropping reply");
        }
    }

    fn relay(&mut self, origin: &ClientId, msg: &Message) {
        let mut unresponsive = Vec::new();
        let mut departed = Vec::new();
        for (id, member) in &self.members {
            if id == origin {
                continue;
            }
            match member.try_send_legacy(msg.clone()) {
                Ok(()) => {}
                Err(SendError::Full) => unresponsive.push(id.clone()),
                // Already unregistered, its Leave is on the way.
                Err(SendError::Closed) => departed.push(id.clone()),
            }
        }

        for id in departed {
            self.members.remove(&id);
        }
        for id in unresponsive {
            if let Some(member) = self.members.remove(&id) {
                log::warn!("Evicting unresponsive client {id} from room {}", self.id);
                member.close();
                self.evicted.insert(id);
            }
        }
    }

    fn persist(&self) {
        self.publish_snapshot();
        if let Err(e) = self.store.save(&self.id, self.document.content()) {
            log::error!("Failed to save document for room {}: {e}", self.id);
        }
    }

    fn publish_snapshot(&self) {
        let mut snapshot = self.snapshot.lock().unwrap_or_else(PoisonError::into_inner);
        snapshot.version = self.version;
        snapshot.content.clear();
        snapshot.content.push_str(self.document.content());
    }
}
