use foundation::LayerId;
use resilience::CircuitState;
use serde::Serialize;

use crate::payload::DataVersion;

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LayerStatus {
    /// Not enabled, or enabled but hidden in the active view.
    #[default]
    Idle,
    Loading,
    Ready,
    /// Rendering cached data after a failed refresh.
    Degraded,
    /// Enabled, but no data could be retrieved.
    Failed,
    /// Enabled, but the surface lacks a required capability.
    Unsupported,
    /// Enabled layer without a data source whose dataset has not been supplied.
    AwaitingData,
}

impl LayerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LayerStatus::Idle => "idle",
            LayerStatus::Loading => "loading",
            LayerStatus::Ready => "ready",
            LayerStatus::Degraded => "degraded",
            LayerStatus::Failed => "failed",
            LayerStatus::Unsupported => "unsupported",
            LayerStatus::AwaitingData => "awaiting_data",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LayerStatusReport {
    pub layer_id: LayerId,
    pub status: LayerStatus,
    pub degraded: bool,
    pub data_version: Option<DataVersion>,
    pub last_error: Option<String>,
    /// Automatic retries already scheduled since the last success.
    pub scheduled_retries: u32,
    pub retry_pending: bool,
    /// True once automatic retries ran out; only a manual retry or re-enable fetches again.
    pub retries_exhausted: bool,
    pub circuit: Option<CircuitState>,
}
