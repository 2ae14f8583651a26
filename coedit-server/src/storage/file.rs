//! One plain-text file per room: `<dir>/doc-<room>.txt`.

use std::io::ErrorKind;
use std::path::PathBuf;

use super::{is_valid_room_id, DocumentStore, StoreError};

/// File store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Directory holding the document files
    pub path: PathBuf,
    /// File name prefix before the room identifier
    pub file_prefix: String,
    /// File extension, without the dot
    pub file_extension: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("documents"),
            file_prefix: "doc-".to_string(),
            file_extension: "txt".to_string(),
        }
    }
}

impl StoreConfig {
    /// Default naming inside a caller-provided (usually temporary) directory.
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }
}

/// Filesystem-backed document store.
#[derive(Debug, Clone)]
pub struct FileStore {
    config: StoreConfig,
}

impl FileStore {
    /// Open the store, creating the document directory if needed.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        std::fs::create_dir_all(&config.path)?;
        log::info!("Document store at {}", config.path.display());
        Ok(Self { config })
    }

    /// Path of the file backing `room_id`.
    pub fn path_for(&self, room_id: &str) -> Result<PathBuf, StoreError> {
        if !is_valid_room_id(room_id) {
            return Err(StoreError::InvalidRoomId(room_id.to_string()));
        }
        Ok(self.config.path.join(format!(
            "{}{room_id}.{}",
            self.config.file_prefix, self.config.file_extension
        )))
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }
}

impl DocumentStore for FileStore {
    fn load(&self, room_id: &str) -> Result<Option<String>, StoreError> {
        let path = self.path_for(room_id)?;
        match std::fs::read_to_string(&path) {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn save(&self, room_id: &str, content: &str) -> Result<(), StoreError> {
        let path = self.path_for(room_id)?;
        // The directory may have been removed while the server was running.
        std::fs::create_dir_all(&self.config.path)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}
