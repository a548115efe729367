use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use foundation::{LayerId, ViewId};
use resilience::RetryPolicy;
use serde::{Deserialize, Serialize};

use crate::error::LayerError;
use crate::symbology::PrimitiveRole;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RenderKind {
    Point,
    Line,
    Polygon,
    Raster,
    SymbolComposite,
}

impl RenderKind {
    /// Primitives a layer of this kind is drawn with, in draw order.
    pub fn roles(&self) -> &'static [PrimitiveRole] {
        match self {
            RenderKind::Point => &[PrimitiveRole::Points],
            RenderKind::Line => &[PrimitiveRole::Lines],
            RenderKind::Polygon => &[PrimitiveRole::Fill, PrimitiveRole::Outline],
            RenderKind::Raster => &[PrimitiveRole::Raster],
            RenderKind::SymbolComposite => &[PrimitiveRole::Symbols, PrimitiveRole::Labels],
        }
    }
}

/// Static catalog entry for one map layer.
#[derive(Debug, Clone, PartialEq)]
pub struct LayerDefinition {
    pub id: LayerId,
    pub title: String,
    pub render_kind: RenderKind,
    /// URL template with `{name}` placeholders. `None` means the caller supplies the dataset.
    pub data_source: Option<String>,
    pub default_opacity: f64,
    /// Views the layer may render in; empty means every view.
    pub visible_in_views: BTreeSet<ViewId>,
    pub requires_capability: Option<String>,
    pub right_panel_kind: Option<String>,
    pub retry_policy: Option<RetryPolicy>,
}

impl LayerDefinition {
    pub fn new(id: impl Into<LayerId>, render_kind: RenderKind) -> Self {
        let id = id.into();
        Self {
            title: id.to_string(),
            id,
            render_kind,
            data_source: None,
            default_opacity: 1.0,
            visible_in_views: BTreeSet::new(),
            requires_capability: None,
            right_panel_kind: None,
            retry_policy: None,
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    pub fn with_data_source(mut self, template: impl Into<String>) -> Self {
        self.data_source = Some(template.into());
        self
    }

    pub fn with_default_opacity(mut self, opacity: f64) -> Self {
        self.default_opacity = opacity;
        self
    }

    pub fn visible_in<I, V>(mut self, views: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<ViewId>,
    {
        self.visible_in_views = views.into_iter().map(Into::into).collect();
        self
    }

    pub fn requires(mut self, capability: impl Into<String>) -> Self {
        self.requires_capability = Some(capability.into());
        self
    }

    pub fn with_panel(mut self, kind: impl Into<String>) -> Self {
        self.right_panel_kind = Some(kind.into());
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    pub fn visible_in_view(&self, view: &ViewId) -> bool {
        self.visible_in_views.is_empty() || self.visible_in_views.contains(view)
    }

    pub fn validate(&self) -> Result<(), LayerError> {
        let invalid = |reason: &str| LayerError::InvalidDefinition {
            layer: self.id.clone(),
            reason: reason.to_string(),
        };
        if self.id.is_empty() {
            return Err(invalid("empty id"));
        }
        if !(0.0..=1.0).contains(&self.default_opacity) {
            return Err(invalid("default opacity must be within [0, 1]"));
        }
        if self.data_source.as_deref().is_some_and(|s| s.trim().is_empty()) {
            return Err(invalid("empty data source"));
        }
        if self.requires_capability.as_deref().is_some_and(|s| s.trim().is_empty()) {
            return Err(invalid("empty capability tag"));
        }
        if self.right_panel_kind.as_deref().is_some_and(|s| s.trim().is_empty()) {
            return Err(invalid("empty panel kind"));
        }
        if self.visible_in_views.iter().any(ViewId::is_empty) {
            return Err(invalid("empty view id"));
        }
        Ok(())
    }
}

/// Validated, immutable set of layer definitions keyed by id.
#[derive(Debug, Clone, Default)]
pub struct LayerCatalog {
    definitions: BTreeMap<LayerId, Arc<LayerDefinition>>,
}

impl LayerCatalog {
    pub fn new(definitions: impl IntoIterator<Item = LayerDefinition>) -> Result<Self, LayerError> {
        let mut map = BTreeMap::new();
        for def in definitions {
            def.validate()?;
            if map.contains_key(&def.id) {
                return Err(LayerError::DuplicateLayer(def.id));
            }
            map.insert(def.id.clone(), Arc::new(def));
        }
        Ok(Self { definitions: map })
    }

    pub fn get(&self, id: &LayerId) -> Option<&Arc<LayerDefinition>> {
        self.definitions.get(id)
    }

    /// Definitions in id order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<LayerDefinition>> {
        self.definitions.values()
    }

    pub fn ids(&self) -> impl Iterator<Item = &LayerId> {
        self.definitions.keys()
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }
}
