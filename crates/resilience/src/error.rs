//! Error taxonomy for wrapped data retrieval.

use std::time::Duration;

use http::StatusCode;
use thiserror::Error;

use crate::circuit::CircuitKey;

/// Failure of a single retrieval attempt.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    /// The attempt exceeded its per-attempt timeout.
    #[error("request timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    /// The remote host refused the connection.
    #[error("connection refused: {0}")]
    ConnectionRefused(String),

    /// Host name could not be resolved.
    #[error("DNS resolution failed: {0}")]
    Dns(String),

    /// Any other transport-level failure (reset, TLS, broken body stream).
    #[error("transport error: {0}")]
    Transport(String),

    /// The server answered with a non-success status.
    #[error("HTTP {status} from {url}")]
    Status { status: StatusCode, url: String },

    /// The response arrived but could not be used.
    #[error("malformed response: {0}")]
    Malformed(String),
}

impl FetchError {
    pub fn status(status: StatusCode, url: impl Into<String>) -> Self {
        FetchError::Status {
            status,
            url: url.into(),
        }
    }

    /// Whether another attempt could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            FetchError::Timeout(_)
            | FetchError::ConnectionRefused(_)
            | FetchError::Dns(_)
            | FetchError::Transport(_) => true,
            FetchError::Status { status, .. } => is_retryable_status(*status),
            FetchError::Malformed(_) => false,
        }
    }
}

/// 408, 429 and the gateway/server-overload 5xx family.
pub fn is_retryable_status(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::REQUEST_TIMEOUT
            | StatusCode::TOO_MANY_REQUESTS
            | StatusCode::INTERNAL_SERVER_ERROR
            | StatusCode::BAD_GATEWAY
            | StatusCode::SERVICE_UNAVAILABLE
            | StatusCode::GATEWAY_TIMEOUT
    )
}

/// Terminal outcome of [`crate::Resilience::execute`] when no value was produced.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResilienceError {
    /// The circuit for this key is open; no attempt was made.
    #[error("circuit open for {key}, next attempt allowed in {}ms", .retry_after.as_millis())]
    CircuitOpen {
        key: CircuitKey,
        retry_after: Duration,
    },

    /// Every allowed attempt failed with a retryable error.
    #[error("{key}: giving up after {attempts} attempt(s): {source}")]
    Exhausted {
        key: CircuitKey,
        attempts: u32,
        #[source]
        source: FetchError,
    },

    /// The failure cannot be fixed by retrying (4xx, malformed payload).
    #[error("{key}: non-retryable failure: {source}")]
    NonRetryable {
        key: CircuitKey,
        #[source]
        source: FetchError,
    },
}

impl ResilienceError {
    pub fn key(&self) -> &CircuitKey {
        match self {
            ResilienceError::CircuitOpen { key, .. }
            | ResilienceError::Exhausted { key, .. }
            | ResilienceError::NonRetryable { key, .. } => key,
        }
    }

    pub fn is_circuit_open(&self) -> bool {
        matches!(self, ResilienceError::CircuitOpen { .. })
    }

    /// Persistent problems that retrying will not fix.
    pub fn is_persistent(&self) -> bool {
        matches!(self, ResilienceError::NonRetryable { .. })
    }

    pub fn fetch_error(&self) -> Option<&FetchError> {
        match self {
            ResilienceError::CircuitOpen { .. } => None,
            ResilienceError::Exhausted { source, .. }
            | ResilienceError::NonRetryable { source, .. } => Some(source),
        }
    }
}
