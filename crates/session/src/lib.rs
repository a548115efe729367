//! Persisted user session: enabled layers, opacity, viewport per view,
//! panel layout and preferences.

pub mod debounce;
pub mod error;
pub mod memory;
pub mod migrate;
pub mod record;
pub mod store;

pub use debounce::Debouncer;
pub use error::{SessionError, StorageError};
pub use memory::{SessionMemory, SessionMemoryConfig};
pub use record::{
    LayerStateEntry, PanelPrefs, Preferences, SESSION_SCHEMA_VERSION, STORAGE_KEY, SessionRecord,
    Viewport,
};
pub use store::{FileStorage, InMemoryStorage, LocalStorage, StorageBackend};
