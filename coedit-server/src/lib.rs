//! # coedit-server — real-time collaborative text editing
//!
//! Clients connect over WebSocket to `/ws/{roomID}` and edit one shared
//! plain-text document per room. Two synchronization tracks share each
//! connection: positional insert/delete/cursor frames that are relayed to
//! peers, and a versioned change log that clients push to and pull from.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐  register/unregister  ┌──────────────┐
//! │  connection  │ ────────────────────► │     Hub      │
//! │ read + write │                       │ (directory)  │
//! └──────┬───────┘                       └──────┬───────┘
//!        │ frames                               │ create / close
//!        ▼                                      ▼
//! ┌──────────────┐   relay / broadcast   ┌──────────────┐
//! │ client queues│ ◄──────────────────── │     Room     │
//! │ legacy+collab│                       │ doc + log    │
//! └──────────────┘                       └──────┬───────┘
//!                                               │
//!                                       ┌───────┴───────┐
//!                                       │ DocumentStore │
//!                                       └───────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — JSON wire frames for both tracks
//! - [`document`] — character-indexed text buffer
//! - [`storage`] — per-room persistence (files or memory)
//! - [`client`] — connection identity, outbound queues and socket loops
//! - [`room`] — per-document actor
//! - [`hub`] — room directory actor
//! - [`server`] — listener, upgrade routing and configuration

pub mod client;
pub mod document;
pub mod hub;
pub mod protocol;
pub mod room;
pub mod server;
pub mod storage;

// Re-exports for convenience
pub use client::{ClientHandle, ClientId, ConnectionState};
pub use document::Document;
pub use hub::{Hub, HubHandle, HubStopped};
pub use protocol::{
    CollabMessage, CollabType, CollabUpdate, Message, MessageType, ProtocolError,
};
pub use room::{Room, RoomHandle, RoomOptions, RoomSnapshot};
pub use server::{ServerConfig, ServerError, ServerStats, SyncServer};
pub use storage::{DocumentStore, FileStore, MemoryStore, StoreConfig, StoreError};
