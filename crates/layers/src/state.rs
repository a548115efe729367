use foundation::{EpochMillis, LayerId};
use serde::Serialize;

use crate::payload::DataVersion;
use crate::surface::PrimitiveHandle;
use crate::symbology::PrimitiveRole;

/// What the user wants for one layer. Independent of the active view.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DesiredLayerState {
    pub enabled: bool,
    pub opacity: f64,
    pub last_interacted_at: EpochMillis,
    /// Monotonic interaction counter; orders interactions within the same millisecond.
    pub interaction_seq: u64,
}

impl DesiredLayerState {
    pub fn new(opacity: f64) -> Self {
        Self {
            enabled: false,
            opacity,
            last_interacted_at: EpochMillis::ZERO,
            interaction_seq: 0,
        }
    }
}

/// What is currently drawn for one layer. Owned by the reconciler.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderedLayerHandle {
    pub layer_id: LayerId,
    pub primitives: Vec<(PrimitiveRole, PrimitiveHandle)>,
    pub data_version: DataVersion,
    pub opacity: f64,
    pub visible: bool,
    pub degraded: bool,
}

impl RenderedLayerHandle {
    pub fn primitive_ids(&self) -> impl Iterator<Item = PrimitiveHandle> + '_ {
        self.primitives.iter().map(|(_, h)| *h)
    }
}

/// Outcome counts of one reconcile pass.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct ReconcileSummary {
    pub removed: usize,
    pub added: usize,
    pub updated: usize,
}

impl ReconcileSummary {
    pub fn is_noop(&self) -> bool {
        self.removed == 0 && self.added == 0 && self.updated == 0
    }
}

/// A desired, renderable layer that owns a detail panel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PanelCandidate {
    pub layer_id: LayerId,
    pub panel_kind: String,
    pub last_interacted_at: EpochMillis,
}
