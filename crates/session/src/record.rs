use std::collections::BTreeMap;

use foundation::{EpochMillis, LayerId, PanelId, ViewId};
use serde::{Deserialize, Serialize};

/// Schema version written by this build.
pub const SESSION_SCHEMA_VERSION: &str = "2";

/// Versions [`crate::migrate::decode`] knows how to read.
pub const KNOWN_SCHEMA_VERSIONS: &[&str] = &["1", "2"];

/// Storage key the whole record is written under.
pub const STORAGE_KEY: &str = "climate-studio.session";

/// View a version-1 document's single viewport belongs to.
pub const LEGACY_VIEW: &str = "climate";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LayerStateEntry {
    pub id: LayerId,
    pub enabled: bool,
    pub opacity: f64,
    pub last_viewed_at: EpochMillis,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Viewport {
    /// `[lng, lat]`
    pub center: [f64; 2],
    pub zoom: f64,
    pub pitch: f64,
    pub bearing: f64,
}

impl Default for Viewport {
    fn default() -> Self {
        // Contiguous US.
        Self {
            center: [-98.5795, 39.8283],
            zoom: 4.0,
            pitch: 0.0,
            bearing: 0.0,
        }
    }
}

impl Viewport {
    pub fn is_finite(&self) -> bool {
        self.center.iter().all(|v| v.is_finite())
            && self.zoom.is_finite()
            && self.pitch.is_finite()
            && self.bearing.is_finite()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Preferences {
    pub auto_restore_session: bool,
    pub remember_layer_states: bool,
    pub remember_viewport: bool,
}

impl Default for Preferences {
    fn default() -> Self {
        Self {
            auto_restore_session: true,
            remember_layer_states: true,
            remember_viewport: true,
        }
    }
}

pub type PanelPrefs = serde_json::Map<String, serde_json::Value>;

/// The single persisted session document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub layer_states: Vec<LayerStateEntry>,
    pub viewport_by_view: BTreeMap<ViewId, Viewport>,
    pub active_panel_ids: Vec<PanelId>,
    pub panel_prefs_by_id: BTreeMap<PanelId, PanelPrefs>,
    pub preferences: Preferences,
    pub schema_version: String,
    pub last_updated_at: EpochMillis,
}

impl Default for SessionRecord {
    fn default() -> Self {
        Self {
            layer_states: Vec::new(),
            viewport_by_view: BTreeMap::new(),
            active_panel_ids: Vec::new(),
            panel_prefs_by_id: BTreeMap::new(),
            preferences: Preferences::default(),
            schema_version: SESSION_SCHEMA_VERSION.to_string(),
            last_updated_at: EpochMillis::ZERO,
        }
    }
}

/// Clamps to `[0, 1]`; NaN becomes fully opaque.
pub fn clamp_opacity(value: f64) -> f64 {
    if value.is_nan() { 1.0 } else { value.clamp(0.0, 1.0) }
}

impl SessionRecord {
    pub fn layer_state(&self, id: &LayerId) -> Option<&LayerStateEntry> {
        self.layer_states.iter().find(|e| &e.id == id)
    }

    /// Inserts or replaces the entry for `id`.
    pub fn upsert_layer_state(&mut self, id: LayerId, enabled: bool, opacity: f64, at: EpochMillis) {
        let opacity = clamp_opacity(opacity);
        match self.layer_states.iter_mut().find(|e| e.id == id) {
            Some(entry) => {
                entry.enabled = enabled;
                entry.opacity = opacity;
                entry.last_viewed_at = at;
            }
            None => self.layer_states.push(LayerStateEntry {
                id,
                enabled,
                opacity,
                last_viewed_at: at,
            }),
        }
    }

    pub fn enabled_layers(&self) -> impl Iterator<Item = &LayerStateEntry> {
        self.layer_states.iter().filter(|e| e.enabled)
    }

    pub fn set_panel_active(&mut self, panel: PanelId, active: bool) {
        let present = self.active_panel_ids.iter().any(|p| p == &panel);
        if active && !present {
            self.active_panel_ids.push(panel);
        } else if !active && present {
            self.active_panel_ids.retain(|p| p != &panel);
        }
    }

    /// Restores invariants a hand-edited or older document may break:
    /// opacity range, finite viewports, duplicate layer and panel ids.
    pub(crate) fn normalize(&mut self) {
        // Last entry for an id wins.
        let mut kept: Vec<LayerStateEntry> = Vec::with_capacity(self.layer_states.len());
        for entry in self.layer_states.drain(..).rev() {
            if entry.id.is_empty() || kept.iter().any(|k| k.id == entry.id) {
                continue;
            }
            kept.push(entry);
        }
        kept.reverse();
        for entry in &mut kept {
            entry.opacity = clamp_opacity(entry.opacity);
        }
        self.layer_states = kept;

        self.viewport_by_view.retain(|_, v| v.is_finite());

        let mut panels: Vec<PanelId> = Vec::with_capacity(self.active_panel_ids.len());
        for p in self.active_panel_ids.drain(..) {
            if !p.is_empty() && !panels.contains(&p) {
                panels.push(p);
            }
        }
        self.active_panel_ids = panels;

        self.schema_version = SESSION_SCHEMA_VERSION.to_string();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn default_record_uses_camel_case() {
        let json = serde_json::to_value(SessionRecord::default()).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "layerStates": [],
                "viewportByView": {},
                "activePanelIds": [],
                "panelPrefsById": {},
                "preferences": {
                    "autoRestoreSession": true,
                    "rememberLayerStates": true,
                    "rememberViewport": true
                },
                "schemaVersion": "2",
                "lastUpdatedAt": 0
            })
        );
    }

    #[test]
    fn upsert_replaces_existing_entry() {
        let mut r = SessionRecord::default();
        r.upsert_layer_state("dams".into(), true, 0.5, EpochMillis(1));
        r.upsert_layer_state("dams".into(), false, 2.0, EpochMillis(2));
        assert_eq!(r.layer_states.len(), 1);
        let e = r.layer_state(&"dams".into()).unwrap();
        assert!(!e.enabled);
        assert_eq!(e.opacity, 1.0);
        assert_eq!(e.last_viewed_at, EpochMillis(2));
    }

    #[test]
    fn normalize_dedupes_and_clamps() {
        let mut r = SessionRecord::default();
        r.layer_states = vec![
            LayerStateEntry {
                id: "dams".into(),
                enabled: true,
                opacity: 0.3,
                last_viewed_at: EpochMillis(1),
            },
            LayerStateEntry {
                id: "".into(),
                enabled: true,
                opacity: 0.3,
                last_viewed_at: EpochMillis(1),
            },
            LayerStateEntry {
                id: "dams".into(),
                enabled: false,
                opacity: -1.0,
                last_viewed_at: EpochMillis(2),
            },
        ];
        r.active_panel_ids = vec!["a".into(), "a".into(), "b".into()];
        r.viewport_by_view.insert(
            "climate".into(),
            Viewport {
                zoom: f64::NAN,
                ..Viewport::default()
            },
        );
        r.schema_version = "1".into();
        r.normalize();

        assert_eq!(r.layer_states.len(), 1);
        assert!(!r.layer_states[0].enabled);
        assert_eq!(r.layer_states[0].opacity, 0.0);
        assert_eq!(r.active_panel_ids, vec![PanelId::from("a"), PanelId::from("b")]);
        assert!(r.viewport_by_view.is_empty());
        assert_eq!(r.schema_version, SESSION_SCHEMA_VERSION);
    }

    #[test]
    fn panel_activation_is_a_set() {
        let mut r = SessionRecord::default();
        r.set_panel_active("groundwater".into(), true);
        r.set_panel_active("groundwater".into(), true);
        assert_eq!(r.active_panel_ids.len(), 1);
        r.set_panel_active("groundwater".into(), false);
        assert!(r.active_panel_ids.is_empty());
    }
}
