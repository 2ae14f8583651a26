//! In-process document store for ephemeral servers and tests.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use super::{DocumentStore, StoreError};

#[derive(Debug, Default)]
pub struct MemoryStore {
    docs: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of rooms with saved content.
    pub fn len(&self) -> usize {
        self.docs.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl DocumentStore for MemoryStore {
    fn load(&self, room_id: &str) -> Result<Option<String>, StoreError> {
        let docs = self.docs.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(docs.get(room_id).cloned())
    }

    fn save(&self, room_id: &str, content: &str) -> Result<(), StoreError> {
        let mut docs = self.docs.lock().unwrap_or_else(PoisonError::into_inner);
        docs.insert(room_id.to_string(), content.to_string());
        Ok(())
    }
}
