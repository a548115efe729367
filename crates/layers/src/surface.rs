//! The seam between the reconciler and whatever draws the map.

use thiserror::Error;

use crate::definition::RenderKind;
use crate::payload::LayerPayload;
use crate::symbology::PrimitiveStyle;

/// Opaque handle to one drawn primitive, issued by the surface.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PrimitiveHandle(pub u64);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SurfaceError {
    #[error("surface rejected {source_id}: {reason}")]
    Rejected { source_id: String, reason: String },

    #[error("surface is not ready")]
    NotReady,
}

pub type ResetCallback = Box<dyn Fn() + Send + Sync>;

/// A map rendering surface.
///
/// Methods are synchronous and may be called while the reconciler holds its
/// state lock, so implementations must not call back into the reconciler
/// from inside them. A reset callback may fire from any thread; the
/// reconciler only schedules work in response.
pub trait RenderSurface: Send + Sync {
    fn add_primitive(
        &self,
        source_id: &str,
        kind: RenderKind,
        payload: &LayerPayload,
        style: &PrimitiveStyle,
    ) -> Result<PrimitiveHandle, SurfaceError>;

    /// Idempotent; unknown handles are ignored.
    fn remove_primitive(&self, handle: PrimitiveHandle);

    fn set_opacity(&self, handle: PrimitiveHandle, opacity: f64);

    fn set_visibility(&self, handle: PrimitiveHandle, visible: bool);

    /// Registers a callback fired when the surface loses everything drawn on
    /// it (style reload, context loss).
    fn on_surface_reset(&self, callback: ResetCallback);

    fn has_capability(&self, tag: &str) -> bool;
}
