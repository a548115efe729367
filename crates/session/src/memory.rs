use std::sync::{Arc, Weak};
use std::time::Duration;

use foundation::{Clock, LayerId, PanelId, SystemClock, ViewId};
use parking_lot::Mutex;

use crate::debounce::Debouncer;
use crate::error::{SessionError, StorageError};
use crate::migrate::{self, DecodeOutcome};
use crate::record::{Preferences, STORAGE_KEY, SessionRecord, Viewport};
use crate::store::StorageBackend;

/// Default quiet period before a mutation is written.
pub const DEFAULT_SAVE_DEBOUNCE: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionMemoryConfig {
    pub key: String,
    pub debounce: Duration,
}

impl Default for SessionMemoryConfig {
    fn default() -> Self {
        Self {
            key: STORAGE_KEY.to_string(),
            debounce: DEFAULT_SAVE_DEBOUNCE,
        }
    }
}

impl SessionMemoryConfig {
    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = key.into();
        self
    }

    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }
}

#[derive(Debug)]
struct MemoryState {
    record: Option<SessionRecord>,
    dirty: bool,
    auto_save: bool,
    memory_only: bool,
}

struct Inner {
    config: SessionMemoryConfig,
    storage: Arc<dyn StorageBackend>,
    clock: Arc<dyn Clock>,
    state: Mutex<MemoryState>,
    debouncer: Debouncer,
}

/// The user's session: loaded once, mutated in memory, written back after a
/// quiet period.
///
/// Persistence problems never reach callers of `read`, `mutate` or
/// `force_flush`; they are logged and the session keeps working in memory.
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct SessionMemory {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for SessionMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionMemory")
            .field("config", &self.inner.config)
            .field("state", &*self.inner.state.lock())
            .finish_non_exhaustive()
    }
}

impl SessionMemory {
    pub fn new(storage: Arc<dyn StorageBackend>, config: SessionMemoryConfig) -> Self {
        Self::with_clock(storage, config, Arc::new(SystemClock))
    }

    pub fn with_clock(
        storage: Arc<dyn StorageBackend>,
        config: SessionMemoryConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let inner = Arc::new_cyclic(|weak: &Weak<Inner>| {
            let weak = weak.clone();
            Inner {
                debouncer: Debouncer::new(config.debounce, move || {
                    if let Some(inner) = weak.upgrade() {
                        inner.flush();
                    }
                }),
                config,
                storage,
                clock,
                state: Mutex::new(MemoryState {
                    record: None,
                    dirty: false,
                    auto_save: true,
                    memory_only: false,
                }),
            }
        });
        Self { inner }
    }

    /// Current record. The backing store is consulted only on first use.
    pub fn read(&self) -> SessionRecord {
        let mut state = self.inner.state.lock();
        self.inner.ensure_loaded(&mut state).clone()
    }

    /// Applies `patch` to the in-memory record and schedules a debounced write.
    /// The patched record is normalized (opacity clamped, duplicate ids and
    /// non-finite viewports dropped) before anyone can observe it.
    ///
    /// `patch` runs under the session lock and must not call back into this store.
    pub fn mutate(&self, patch: impl FnOnce(&mut SessionRecord)) {
        let schedule = {
            let mut state = self.inner.state.lock();
            let now = self.inner.clock.now_ms();
            let record = self.inner.ensure_loaded(&mut state);
            patch(record);
            record.normalize();
            record.last_updated_at = now;
            state.dirty = true;
            state.auto_save
        };
        if schedule {
            self.inner.debouncer.trigger();
        }
    }

    /// Cancels any pending debounce and writes now.
    pub fn force_flush(&self) {
        self.inner.debouncer.cancel();
        self.inner.flush();
    }

    pub fn export_snapshot(&self) -> Result<String, SessionError> {
        let record = self.read();
        serde_json::to_string_pretty(&record).map_err(|e| SessionError::Encode(e.to_string()))
    }

    /// Replaces the session with `text` and writes it immediately.
    pub fn import_snapshot(&self, text: &str) -> Result<SessionRecord, SessionError> {
        let decoded = migrate::decode(text)?;
        if let DecodeOutcome::Migrated { from } = &decoded.outcome {
            tracing::info!(from_version = %from, "Imported session migrated");
        }
        {
            let mut state = self.inner.state.lock();
            state.record = Some(decoded.record.clone());
            state.dirty = true;
        }
        self.force_flush();
        tracing::info!(layers = decoded.record.layer_states.len(), "Session imported");
        Ok(decoded.record)
    }

    /// Resets to the default record and writes it immediately.
    pub fn clear(&self) {
        {
            let mut state = self.inner.state.lock();
            let mut record = SessionRecord::default();
            record.last_updated_at = self.inner.clock.now_ms();
            state.record = Some(record);
            state.dirty = true;
        }
        self.force_flush();
        tracing::info!("Session cleared");
    }

    /// With auto-save off, mutations accumulate without scheduling writes.
    pub fn set_auto_save(&self, enabled: bool) {
        let schedule = {
            let mut state = self.inner.state.lock();
            state.auto_save = enabled;
            enabled && state.dirty
        };
        if !enabled {
            self.inner.debouncer.cancel();
        } else if schedule {
            self.inner.debouncer.trigger();
        }
    }

    pub fn auto_save(&self) -> bool {
        self.inner.state.lock().auto_save
    }

    pub fn is_dirty(&self) -> bool {
        self.inner.state.lock().dirty
    }

    /// True once the backing store reported it is unavailable.
    pub fn is_memory_only(&self) -> bool {
        self.inner.state.lock().memory_only
    }

    pub fn preferences(&self) -> Preferences {
        self.read().preferences
    }

    pub fn set_preferences(&self, preferences: Preferences) {
        self.mutate(|r| r.preferences = preferences);
    }

    /// Records a layer's enabled flag and opacity, unless the user opted out.
    pub fn remember_layer(&self, id: &LayerId, enabled: bool, opacity: f64) {
        if !self.preferences().remember_layer_states {
            return;
        }
        let now = self.inner.clock.now_ms();
        self.mutate(|r| r.upsert_layer_state(id.clone(), enabled, opacity, now));
    }

    pub fn remember_viewport(&self, view: &ViewId, viewport: Viewport) {
        if !self.preferences().remember_viewport || !viewport.is_finite() {
            return;
        }
        self.mutate(|r| {
            r.viewport_by_view.insert(view.clone(), viewport);
        });
    }

    /// Viewport to restore for `view`, honouring the restore preferences.
    pub fn restored_viewport(&self, view: &ViewId) -> Option<Viewport> {
        let record = self.read();
        let prefs = record.preferences;
        if !prefs.auto_restore_session || !prefs.remember_viewport {
            return None;
        }
        record.viewport_by_view.get(view).cloned()
    }

    pub fn set_panel_active(&self, panel: &PanelId, active: bool) {
        self.mutate(|r| r.set_panel_active(panel.clone(), active));
    }

    pub fn set_panel_pref(&self, panel: &PanelId, key: &str, value: serde_json::Value) {
        self.mutate(|r| {
            r.panel_prefs_by_id
                .entry(panel.clone())
                .or_default()
                .insert(key.to_string(), value);
        });
    }
}

impl Inner {
    fn ensure_loaded<'a>(&self, state: &'a mut MemoryState) -> &'a mut SessionRecord {
        if state.record.is_none() {
            let record = self.load(state);
            state.record = Some(record);
        }
        state.record.get_or_insert_with(SessionRecord::default)
    }

    fn load(&self, state: &mut MemoryState) -> SessionRecord {
        let text = match self.storage.get_item(&self.config.key) {
            Ok(Some(text)) => text,
            Ok(None) => {
                tracing::debug!(key = %self.config.key, "No saved session, starting fresh");
                return SessionRecord::default();
            }
            Err(e) => {
                self.note_storage_error(state, &e, "read");
                return SessionRecord::default();
            }
        };

        match migrate::decode(&text) {
            Ok(decoded) => {
                match &decoded.outcome {
                    DecodeOutcome::Current => {}
                    DecodeOutcome::Repaired => {
                        tracing::warn!(key = %self.config.key, "Saved session had malformed fields, repaired");
                    }
                    DecodeOutcome::Migrated { from } => {
                        tracing::info!(key = %self.config.key, from_version = %from, "Saved session migrated");
                    }
                }
                tracing::info!(
                    layers = decoded.record.layer_states.len(),
                    views = decoded.record.viewport_by_view.len(),
                    "Session restored"
                );
                decoded.record
            }
            Err(e) => {
                tracing::warn!(key = %self.config.key, error = %e, "Discarding unreadable session");
                SessionRecord::default()
            }
        }
    }

    fn flush(&self) {
        let mut state = self.state.lock();
        if !state.dirty || state.memory_only {
            return;
        }
        let Some(record) = state.record.as_ref() else {
            return;
        };
        let text = match serde_json::to_string(record) {
            Ok(text) => text,
            Err(e) => {
                tracing::error!(error = %e, "Failed to encode session");
                return;
            }
        };

        match self.storage.set_item(&self.config.key, &text) {
            Ok(()) => {
                state.dirty = false;
                tracing::trace!(key = %self.config.key, bytes = text.len(), "Session saved");
            }
            Err(e) => self.note_storage_error(&mut state, &e, "write"),
        }
    }

    fn note_storage_error(&self, state: &mut MemoryState, e: &StorageError, op: &str) {
        match e {
            StorageError::Unavailable => {
                if !state.memory_only {
                    tracing::warn!(key = %self.config.key, "Session storage unavailable, keeping session in memory only");
                }
                state.memory_only = true;
            }
            StorageError::QuotaExceeded | StorageError::Io(_) => {
                tracing::warn!(key = %self.config.key, op, error = %e, "Session storage failed");
            }
        }
    }
}
