//! Key/value backends the session record is persisted through.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use crate::error::StorageError;

/// String key/value store with browser `localStorage` semantics.
pub trait StorageBackend: Send + Sync {
    fn get_item(&self, key: &str) -> Result<Option<String>, StorageError>;
    fn set_item(&self, key: &str, value: &str) -> Result<(), StorageError>;
    fn remove_item(&self, key: &str) -> Result<(), StorageError>;
}

#[derive(Debug, Default)]
pub struct InMemoryStorage {
    items: Mutex<HashMap<String, String>>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StorageBackend for InMemoryStorage {
    fn get_item(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.items.lock().get(key).cloned())
    }

    fn set_item(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.items.lock().insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove_item(&self, key: &str) -> Result<(), StorageError> {
        self.items.lock().remove(key);
        Ok(())
    }
}

/// One JSON file per key under a directory. Writes go through a temp file
/// and a rename so a crash never leaves a half-written document.
#[derive(Debug, Clone)]
pub struct FileStorage {
    dir: PathBuf,
}

impl FileStorage {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, key: &str) -> PathBuf {
        let name: String = key
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.dir.join(format!("{name}.json"))
    }
}

impl StorageBackend for FileStorage {
    fn get_item(&self, key: &str) -> Result<Option<String>, StorageError> {
        match std::fs::read_to_string(self.path_for(key)) {
            Ok(text) => Ok(Some(text)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StorageError::Io(e.to_string())),
        }
    }

    fn set_item(&self, key: &str, value: &str) -> Result<(), StorageError> {
        std::fs::create_dir_all(&self.dir).map_err(|e| StorageError::Io(e.to_string()))?;
        let path = self.path_for(key);
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, value).map_err(|e| StorageError::Io(e.to_string()))?;
        std::fs::rename(&tmp, &path).map_err(|e| StorageError::Io(e.to_string()))?;
        Ok(())
    }

    fn remove_item(&self, key: &str) -> Result<(), StorageError> {
        match std::fs::remove_file(self.path_for(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::Io(e.to_string())),
        }
    }
}

#[cfg(target_arch = "wasm32")]
mod wasm_storage {
    use super::StorageBackend;
    use crate::error::StorageError;

    /// Browser `window.localStorage`.
    #[derive(Debug, Default)]
    pub struct LocalStorage;

    impl LocalStorage {
        pub fn new() -> Result<Self, StorageError> {
            window_local_storage()?;
            Ok(Self)
        }
    }

    impl StorageBackend for LocalStorage {
        fn get_item(&self, key: &str) -> Result<Option<String>, StorageError> {
            window_local_storage()?
                .get_item(key)
                .map_err(|e| StorageError::Io(format!("get_item failed: {:?}", e)))
        }

        fn set_item(&self, key: &str, value: &str) -> Result<(), StorageError> {
            window_local_storage()?.set_item(key, value).map_err(|e| {
                let msg = format!("{:?}", e);
                if msg.contains("Quota") {
                    StorageError::QuotaExceeded
                } else {
                    StorageError::Io(format!("set_item failed: {msg}"))
                }
            })
        }

        fn remove_item(&self, key: &str) -> Result<(), StorageError> {
            window_local_storage()?
                .remove_item(key)
                .map_err(|e| StorageError::Io(format!("remove_item failed: {:?}", e)))
        }
    }

    fn window_local_storage() -> Result<web_sys::Storage, StorageError> {
        let win = web_sys::window().ok_or(StorageError::Unavailable)?;
        // Access throws in some private browsing modes.
        win.local_storage()
            .map_err(|_| StorageError::Unavailable)?
            .ok_or(StorageError::Unavailable)
    }
}

#[cfg(target_arch = "wasm32")]
pub use wasm_storage::LocalStorage;

/// Browser `localStorage`; always unavailable outside wasm32.
#[cfg(not(target_arch = "wasm32"))]
#[derive(Debug, Default)]
pub struct LocalStorage;

#[cfg(not(target_arch = "wasm32"))]
impl LocalStorage {
    pub fn new() -> Result<Self, StorageError> {
        Err(StorageError::Unavailable)
    }
}

#[cfg(not(target_arch = "wasm32"))]
impl StorageBackend for LocalStorage {
    fn get_item(&self, _key: &str) -> Result<Option<String>, StorageError> {
        Err(StorageError::Unavailable)
    }

    fn set_item(&self, _key: &str, _value: &str) -> Result<(), StorageError> {
        Err(StorageError::Unavailable)
    }

    fn remove_item(&self, _key: &str) -> Result<(), StorageError> {
        Err(StorageError::Unavailable)
    }
}
