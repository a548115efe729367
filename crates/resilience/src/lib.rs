//! Resilient data retrieval: retry with backoff, per-(layer, endpoint)
//! circuit breakers and an advisory health monitor.

use std::future::Future;
use std::pin::Pin;

pub mod circuit;
pub mod error;
pub mod fetch;
pub mod health;
pub mod policy;
pub mod service;

pub use circuit::{CircuitConfig, CircuitKey, CircuitRegistry, CircuitState, CircuitStatus};
pub use error::{FetchError, ResilienceError, is_retryable_status};
pub use fetch::{HttpFetcher, HttpHealthProbe};
pub use health::{HealthMonitor, HealthProbe, HealthStatus};
pub use policy::{HashJitter, JitterSource, NoJitter, RetryPolicy};
pub use service::{Resilience, ResilienceConfig};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
