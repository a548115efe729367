use serde::{Deserialize, Serialize};

/// Drawing role of one primitive within a layer.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrimitiveRole {
    Points,
    Lines,
    Fill,
    Outline,
    Raster,
    Symbols,
    Labels,
}

impl PrimitiveRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            PrimitiveRole::Points => "points",
            PrimitiveRole::Lines => "lines",
            PrimitiveRole::Fill => "fill",
            PrimitiveRole::Outline => "outline",
            PrimitiveRole::Raster => "raster",
            PrimitiveRole::Symbols => "symbols",
            PrimitiveRole::Labels => "labels",
        }
    }
}

/// What the reconciler asks a surface to apply to a primitive. Colours,
/// widths and the like belong to the surface.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct PrimitiveStyle {
    pub role: PrimitiveRole,
    pub opacity: f64,
    pub visible: bool,
}

impl PrimitiveStyle {
    /// Fully transparent primitives are hidden rather than drawn at zero alpha.
    pub fn new(role: PrimitiveRole, opacity: f64) -> Self {
        Self {
            role,
            opacity,
            visible: opacity > 0.0,
        }
    }
}
