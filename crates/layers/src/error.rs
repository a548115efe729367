use foundation::LayerId;
use thiserror::Error;

/// Programmer errors: bad catalog entries and calls naming layers that do not exist.
/// Data retrieval failures never surface through this type.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LayerError {
    #[error("unknown layer {0}")]
    UnknownLayer(LayerId),

    #[error("duplicate layer id {0} in catalog")]
    DuplicateLayer(LayerId),

    #[error("invalid definition for layer {layer}: {reason}")]
    InvalidDefinition { layer: LayerId, reason: String },

    #[error("layer {layer}: data source uses unknown placeholder {{{name}}}")]
    UnknownPlaceholder { layer: LayerId, name: String },

    #[error("layer {0} fetches its own data; datasets can only be supplied to layers without a data source")]
    HasDataSource(LayerId),
}
