use thiserror::Error;

/// Failure reported by a [`crate::StorageBackend`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StorageError {
    /// No backing store in this environment (private browsing, native build).
    #[error("storage unavailable")]
    Unavailable,

    #[error("storage quota exceeded")]
    QuotaExceeded,

    #[error("storage error: {0}")]
    Io(String),
}

/// Errors surfaced by the session store. Only import and export return these;
/// routine reads and writes degrade and log instead.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("invalid session snapshot: {0}")]
    InvalidSnapshot(String),

    #[error("session snapshot has no schemaVersion")]
    MissingSchemaVersion,

    #[error("unsupported session schema version {0:?}")]
    UnsupportedSchemaVersion(String),

    #[error("failed to encode session: {0}")]
    Encode(String),

    #[error(transparent)]
    Storage(#[from] StorageError),
}
