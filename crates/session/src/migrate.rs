//! Decoding of persisted session documents, including older schema versions.
//!
//! A document at the current version is parsed strictly first. If that fails,
//! or the document is at an older known version, it is rebuilt field by field:
//! unknown fields are dropped, missing or malformed fields take their defaults
//! and malformed layer entries are skipped. Documents without a version or at
//! an unknown version are rejected.

use serde_json::{Map, Value};

use foundation::{EpochMillis, LayerId, PanelId, ViewId};

use crate::error::SessionError;
use crate::record::{
    KNOWN_SCHEMA_VERSIONS, LEGACY_VIEW, LayerStateEntry, Preferences, SESSION_SCHEMA_VERSION,
    SessionRecord, Viewport, clamp_opacity,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeOutcome {
    /// Parsed as-is.
    Current,
    /// Current version, but some fields had to be repaired.
    Repaired,
    /// Upgraded from an older schema version.
    Migrated { from: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Decoded {
    pub record: SessionRecord,
    pub outcome: DecodeOutcome,
}

pub fn decode(text: &str) -> Result<Decoded, SessionError> {
    let value: Value =
        serde_json::from_str(text).map_err(|e| SessionError::InvalidSnapshot(e.to_string()))?;
    let Value::Object(obj) = value else {
        return Err(SessionError::InvalidSnapshot(
            "expected a JSON object".to_string(),
        ));
    };

    let version = match obj.get("schemaVersion") {
        None | Some(Value::Null) => return Err(SessionError::MissingSchemaVersion),
        Some(Value::String(s)) => s.trim().to_string(),
        // Early builds wrote the version as a number.
        Some(Value::Number(n)) => n.to_string(),
        Some(other) => {
            return Err(SessionError::InvalidSnapshot(format!(
                "schemaVersion must be a string, got {other}"
            )));
        }
    };
    if !KNOWN_SCHEMA_VERSIONS.contains(&version.as_str()) {
        return Err(SessionError::UnsupportedSchemaVersion(version));
    }

    if version == SESSION_SCHEMA_VERSION {
        if let Ok(mut record) = serde_json::from_value::<SessionRecord>(Value::Object(obj.clone())) {
            let before = record.clone();
            record.normalize();
            let outcome = if record == before {
                DecodeOutcome::Current
            } else {
                DecodeOutcome::Repaired
            };
            return Ok(Decoded { record, outcome });
        }
        return Ok(Decoded {
            record: salvage(&obj),
            outcome: DecodeOutcome::Repaired,
        });
    }

    Ok(Decoded {
        record: salvage(&obj),
        outcome: DecodeOutcome::Migrated { from: version },
    })
}

fn salvage(obj: &Map<String, Value>) -> SessionRecord {
    let mut record = SessionRecord::default();

    if let Some(Value::Array(entries)) = obj.get("layerStates") {
        record.layer_states = entries.iter().filter_map(layer_entry).collect();
    }

    if let Some(Value::Object(views)) = obj.get("viewportByView") {
        for (view, raw) in views {
            if let Some(vp) = viewport(raw) {
                record.viewport_by_view.insert(ViewId::new(view.as_str()), vp);
            }
        }
    } else if let Some(vp) = obj.get("viewport").and_then(viewport) {
        record.viewport_by_view.insert(ViewId::new(LEGACY_VIEW), vp);
    }

    if let Some(Value::Array(panels)) = obj.get("activePanelIds") {
        record.active_panel_ids = panels
            .iter()
            .filter_map(Value::as_str)
            .map(PanelId::new)
            .collect();
    }

    if let Some(Value::Object(prefs)) = obj.get("panelPrefsById") {
        for (panel, raw) in prefs {
            if let Value::Object(map) = raw {
                record.panel_prefs_by_id.insert(PanelId::new(panel.as_str()), map.clone());
            }
        }
    }

    if let Some(Value::Object(prefs)) = obj.get("preferences") {
        let defaults = Preferences::default();
        let flag = |name: &str, fallback: bool| {
            prefs.get(name).and_then(Value::as_bool).unwrap_or(fallback)
        };
        record.preferences = Preferences {
            auto_restore_session: flag("autoRestoreSession", defaults.auto_restore_session),
            remember_layer_states: flag("rememberLayerStates", defaults.remember_layer_states),
            remember_viewport: flag("rememberViewport", defaults.remember_viewport),
        };
    }

    record.last_updated_at = obj
        .get("lastUpdatedAt")
        .and_then(Value::as_u64)
        .map(EpochMillis)
        .unwrap_or_default();

    record.normalize();
    record
}

fn layer_entry(raw: &Value) -> Option<LayerStateEntry> {
    let obj = raw.as_object()?;
    let id = obj.get("id")?.as_str()?.trim();
    if id.is_empty() {
        return None;
    }
    let enabled = obj.get("enabled")?.as_bool()?;
    let opacity = match obj.get("opacity") {
        None | Some(Value::Null) => 1.0,
        Some(v) => clamp_opacity(v.as_f64()?),
    };
    let last_viewed_at = obj
        .get("lastViewedAt")
        .and_then(Value::as_u64)
        .map(EpochMillis)
        .unwrap_or_default();
    Some(LayerStateEntry {
        id: LayerId::new(id),
        enabled,
        opacity,
        last_viewed_at,
    })
}

fn viewport(raw: &Value) -> Option<Viewport> {
    let obj = raw.as_object()?;
    let center = obj.get("center")?.as_array()?;
    if center.len() != 2 {
        return None;
    }
    let num = |name: &str| obj.get(name).and_then(Value::as_f64);
    let vp = Viewport {
        center: [center[0].as_f64()?, center[1].as_f64()?],
        zoom: num("zoom")?,
        pitch: num("pitch").unwrap_or(0.0),
        bearing: num("bearing").unwrap_or(0.0),
    };
    vp.is_finite().then_some(vp)
}
