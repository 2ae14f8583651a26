//! Document persistence, keyed by room identifier.
//!
//! ```text
//! ┌─────────────┐  load (once, at room creation)  ┌───────────────┐
//! │ Room actor  │ ◄────────────────────────────── │ DocumentStore │
//! │             │ ──────────────────────────────► │  FileStore    │
//! └─────────────┘  save (every accepted edit)     │  MemoryStore  │
//!                                                 └───────────────┘
//! ```
//!
//! Stores are called synchronously from the room actor. A failed save is
//! logged by the caller and never rolls back the in-memory document; the
//! next edit writes the full content again.

pub mod file;
pub mod memory;

pub use file::{FileStore, StoreConfig};
pub use memory::MemoryStore;

/// Load/save contract for room documents.
pub trait DocumentStore: Send + Sync {
    /// Load the persisted content for a room. `Ok(None)` means nothing has
    /// been saved yet, which callers treat as an empty document.
    fn load(&self, room_id: &str) -> Result<Option<String>, StoreError>;

    /// Replace the persisted content for a room.
    fn save(&self, room_id: &str, content: &str) -> Result<(), StoreError>;
}

/// Storage errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid room identifier: {0:?}")]
    InvalidRoomId(String),
}

/// Whether a room identifier is safe to use as a routing key and file name.
///
/// Accepts ASCII alphanumerics, `-`, `_` and `.`, rejecting `.` and `..`.
pub fn is_valid_room_id(room_id: &str) -> bool {
    !room_id.is_empty()
        && room_id != "."
        && room_id != ".."
        && room_id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.'))
}
