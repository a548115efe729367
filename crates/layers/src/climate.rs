//! Built-in layer catalog for the climate dashboard and its data service.

use std::collections::BTreeMap;

use crate::definition::{LayerCatalog, LayerDefinition, RenderKind};
use crate::error::LayerError;

pub const DEFAULT_API_BASE: &str = "http://127.0.0.1:5000";
pub const DEFAULT_SCENARIO: &str = "rcp45";
pub const DEFAULT_YEAR: u32 = 2050;
pub const DEFAULT_SLR_FEET: u32 = 3;

/// Capability tag for 3D terrain rendering.
pub const ADVANCED_3D: &str = "advanced-3d-renderer";

pub const VIEW_CLIMATE: &str = "climate";
pub const VIEW_WATER: &str = "water";
pub const VIEW_INDUSTRY: &str = "industry";

/// Template variables for [`climate_catalog`] data sources.
pub fn template_vars(api_base: &str, scenario: &str, year: u32) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("api_base".to_string(), api_base.trim_end_matches('/').to_string()),
        ("scenario".to_string(), scenario.to_string()),
        ("year".to_string(), year.to_string()),
        ("slr_feet".to_string(), DEFAULT_SLR_FEET.to_string()),
    ])
}

pub fn default_template_vars() -> BTreeMap<String, String> {
    template_vars(DEFAULT_API_BASE, DEFAULT_SCENARIO, DEFAULT_YEAR)
}

pub fn climate_layers() -> Vec<LayerDefinition> {
    vec![
        LayerDefinition::new("temperature_projection", RenderKind::Raster)
            .with_title("Future Temperature Anomaly")
            .with_data_source(
                "{api_base}/api/climate/temperature-projection/tiles?year={year}&scenario={scenario}&mode=anomaly",
            )
            .with_default_opacity(0.6)
            .visible_in([VIEW_CLIMATE])
            .with_panel("climate-projection"),
        LayerDefinition::new("sea_level_rise", RenderKind::Polygon)
            .with_title("Sea Level Rise")
            .with_data_source("{api_base}/api/climate/sea-level-rise?feet={slr_feet}")
            .with_default_opacity(0.5)
            .visible_in([VIEW_CLIMATE, VIEW_WATER])
            .with_panel("sea-level-rise"),
        LayerDefinition::new("urban_heat_island", RenderKind::Raster)
            .with_title("Urban Heat Island")
            .with_data_source("{api_base}/api/climate/urban-heat-island/tiles?season=summer")
            .with_default_opacity(0.7)
            .visible_in([VIEW_CLIMATE]),
        LayerDefinition::new("topographic_relief", RenderKind::Raster)
            .with_title("Topographic Relief")
            .with_data_source("{api_base}/api/climate/topographic-relief/tiles?style=classic")
            .with_default_opacity(0.8)
            .requires(ADVANCED_3D),
        LayerDefinition::new("precipitation_drought", RenderKind::Raster)
            .with_title("Precipitation & Drought")
            .with_data_source(
                "{api_base}/api/climate/precipitation-drought/tiles?scenario={scenario}&year={year}&metric=drought_index",
            )
            .with_default_opacity(0.65)
            .visible_in([VIEW_CLIMATE, VIEW_WATER])
            .with_panel("precipitation-drought"),
        LayerDefinition::new("urban_expansion", RenderKind::Raster)
            .with_title("Urban Expansion")
            .with_data_source(
                "{api_base}/api/climate/urban-expansion/tiles?year={year}&scenario={scenario}",
            )
            .with_default_opacity(0.6)
            .visible_in([VIEW_CLIMATE, VIEW_INDUSTRY]),
        LayerDefinition::new("groundwater", RenderKind::Polygon)
            .with_title("Groundwater Depletion")
            .with_data_source("{api_base}/api/climate/groundwater")
            .with_default_opacity(0.6)
            .visible_in([VIEW_WATER])
            .with_panel("groundwater"),
        LayerDefinition::new("metro_humidity", RenderKind::SymbolComposite)
            .with_title("Metro Humidity & Wet Bulb")
            .with_data_source("{api_base}/api/climate/metro-humidity")
            .visible_in([VIEW_CLIMATE])
            .with_panel("metro-humidity"),
        LayerDefinition::new("megaregions", RenderKind::SymbolComposite)
            .with_title("Megaregion Population")
            .with_data_source("{api_base}/api/climate/population?year={year}&scenario={scenario}")
            .visible_in([VIEW_CLIMATE, VIEW_INDUSTRY])
            .with_panel("megaregion"),
        LayerDefinition::new("factories", RenderKind::Point)
            .with_title("Factories")
            .visible_in([VIEW_INDUSTRY])
            .with_panel("factory"),
        LayerDefinition::new("dams", RenderKind::Point)
            .with_title("Dams")
            .visible_in([VIEW_WATER])
            .with_panel("dam"),
        LayerDefinition::new("rivers", RenderKind::Line)
            .with_title("Major Rivers")
            .visible_in([VIEW_WATER]),
    ]
}

pub fn climate_catalog() -> Result<LayerCatalog, LayerError> {
    LayerCatalog::new(climate_layers())
}
