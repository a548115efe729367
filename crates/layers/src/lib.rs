//! Map layer reconciliation for the climate dashboard.
//!
//! [`Reconciler`] turns the user's desired layer selection into primitives on a
//! [`RenderSurface`], loading data through the resilience layer and
//! remembering choices in the session.

pub mod climate;
pub mod definition;
pub mod error;
pub mod payload;
pub mod reconciler;
pub mod source;
pub mod state;
pub mod status;
pub mod surface;
pub mod symbology;
pub mod template;

pub use definition::{LayerCatalog, LayerDefinition, RenderKind};
pub use error::LayerError;
pub use payload::{CachedPayload, DataVersion, LayerPayload, PayloadCache};
pub use reconciler::{ActivePanel, Reconciler, ReconcilerConfig, ReconcilerDeps};
pub use source::{HttpLayerFetcher, LayerFetcher};
pub use state::{DesiredLayerState, PanelCandidate, ReconcileSummary, RenderedLayerHandle};
pub use status::{LayerStatus, LayerStatusReport};
pub use surface::{PrimitiveHandle, RenderSurface, ResetCallback, SurfaceError};
pub use symbology::{PrimitiveRole, PrimitiveStyle};
