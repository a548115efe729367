use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use foundation::{EpochMillis, LayerId};
use serde::Serialize;

/// Content hash of a payload (blake3, hex).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct DataVersion(String);

impl DataVersion {
    pub fn of(bytes: &[u8]) -> Self {
        Self(blake3::hash(bytes).to_hex().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 12 hex digits, for logs.
    pub fn short(&self) -> &str {
        &self.0[..self.0.len().min(12)]
    }
}

impl fmt::Display for DataVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Raw layer data as retrieved (GeoJSON, tile metadata, ...). Opaque to the
/// reconciler; interpreted by the rendering surface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerPayload {
    pub bytes: Bytes,
    pub content_type: Option<String>,
}

impl LayerPayload {
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self {
            bytes: bytes.into(),
            content_type: None,
        }
    }

    pub fn json(value: &serde_json::Value) -> Self {
        Self {
            bytes: Bytes::from(value.to_string()),
            content_type: Some("application/json".to_string()),
        }
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn version(&self) -> DataVersion {
        DataVersion::of(&self.bytes)
    }

    pub fn to_json(&self) -> Option<serde_json::Value> {
        serde_json::from_slice(&self.bytes).ok()
    }
}

/// Immutable cache entry; replaced wholesale on refresh.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedPayload {
    pub payload: LayerPayload,
    pub version: DataVersion,
    pub fetched_at: EpochMillis,
}

/// Last good payload per layer.
#[derive(Debug, Default)]
pub struct PayloadCache {
    entries: HashMap<LayerId, Arc<CachedPayload>>,
}

impl PayloadCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &LayerId) -> Option<Arc<CachedPayload>> {
        self.entries.get(id).cloned()
    }

    pub fn insert(&mut self, id: LayerId, payload: LayerPayload, at: EpochMillis) -> Arc<CachedPayload> {
        let entry = Arc::new(CachedPayload {
            version: payload.version(),
            payload,
            fetched_at: at,
        });
        self.entries.insert(id, Arc::clone(&entry));
        entry
    }

    pub fn remove(&mut self, id: &LayerId) -> Option<Arc<CachedPayload>> {
        self.entries.remove(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn total_bytes(&self) -> usize {
        self.entries.values().map(|e| e.payload.len()).sum()
    }
}
