use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use foundation::{Clock, LayerId, SystemClock};
use parking_lot::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::circuit::{CircuitConfig, CircuitKey, CircuitRegistry, CircuitState};
use crate::error::{FetchError, ResilienceError};
use crate::health::{
    DEFAULT_HEALTH_INTERVAL, DEFAULT_PROBE_TIMEOUT, HealthMonitor, HealthProbe, HealthStatus,
};
use crate::policy::{HashJitter, JitterSource, RetryPolicy};

#[derive(Debug, Clone, PartialEq)]
pub struct ResilienceConfig {
    /// Policy used by layers without an override.
    pub retry: RetryPolicy,
    pub circuit: CircuitConfig,
    pub health_interval: Duration,
    pub probe_timeout: Duration,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            circuit: CircuitConfig::default(),
            health_interval: DEFAULT_HEALTH_INTERVAL,
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
        }
    }
}

impl ResilienceConfig {
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_circuit(mut self, circuit: CircuitConfig) -> Self {
        self.circuit = circuit;
        self
    }

    pub fn with_health_interval(mut self, interval: Duration) -> Self {
        self.health_interval = interval;
        self
    }
}

/// Wraps every remote retrieval with retry, backoff and a per-(layer, endpoint)
/// circuit breaker. Shared by all layers of a process.
pub struct Resilience {
    config: ResilienceConfig,
    circuits: CircuitRegistry,
    layer_policies: RwLock<HashMap<LayerId, RetryPolicy>>,
    jitter: Arc<dyn JitterSource>,
    clock: Arc<dyn Clock>,
    health: Option<Arc<HealthMonitor>>,
}

impl std::fmt::Debug for Resilience {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resilience")
            .field("config", &self.config)
            .field("circuits", &self.circuits)
            .field("health", &self.health)
            .finish_non_exhaustive()
    }
}

impl Resilience {
    pub fn new(config: ResilienceConfig) -> Self {
        Self::with_parts(config, Arc::new(SystemClock), Arc::new(HashJitter::new()))
    }

    pub fn with_parts(
        config: ResilienceConfig,
        clock: Arc<dyn Clock>,
        jitter: Arc<dyn JitterSource>,
    ) -> Self {
        Self {
            circuits: CircuitRegistry::new(config.circuit.clone(), clock.clone()),
            config,
            layer_policies: RwLock::new(HashMap::new()),
            jitter,
            clock,
            health: None,
        }
    }

    /// Attaches a health probe; it only runs once [`Self::start_health_monitor`] is called.
    pub fn with_health_probe(mut self, probe: Arc<dyn HealthProbe>) -> Self {
        self.health = Some(Arc::new(HealthMonitor::new(
            probe,
            self.config.health_interval,
            self.config.probe_timeout,
            self.clock.clone(),
        )));
        self
    }

    pub fn config(&self) -> &ResilienceConfig {
        &self.config
    }

    pub fn circuits(&self) -> &CircuitRegistry {
        &self.circuits
    }

    pub fn set_layer_policy(&self, layer_id: LayerId, policy: RetryPolicy) {
        self.layer_policies.write().insert(layer_id, policy);
    }

    pub fn clear_layer_policy(&self, layer_id: &LayerId) {
        self.layer_policies.write().remove(layer_id);
    }

    pub fn policy_for(&self, layer_id: &LayerId) -> RetryPolicy {
        self.layer_policies
            .read()
            .get(layer_id)
            .cloned()
            .unwrap_or_else(|| self.config.retry.clone())
    }

    /// Runs `op` under the circuit for `key`, retrying retryable failures.
    ///
    /// `op` is called once per attempt and each attempt is bounded by the
    /// policy's attempt timeout. Only the terminal outcome moves the circuit.
    pub async fn execute<T, F, Fut>(&self, key: &CircuitKey, mut op: F) -> Result<T, ResilienceError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, FetchError>>,
    {
        if let Err(retry_after) = self.circuits.try_acquire(key) {
            tracing::debug!(
                circuit = %key,
                retry_after_ms = retry_after.as_millis() as u64,
                "Circuit open, failing fast"
            );
            return Err(ResilienceError::CircuitOpen {
                key: key.clone(),
                retry_after,
            });
        }

        let policy = self.policy_for(&key.layer_id);
        let attempts = policy.attempts();
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            let outcome = match tokio::time::timeout(policy.attempt_timeout, op()).await {
                Ok(result) => result,
                Err(_) => Err(FetchError::Timeout(policy.attempt_timeout)),
            };

            match outcome {
                Ok(value) => {
                    if attempt > 1 {
                        tracing::info!(circuit = %key, attempt, "Request succeeded after retry");
                    }
                    self.circuits.record_success(key);
                    return Ok(value);
                }
                Err(source) if !source.is_retryable() => {
                    self.circuits.record_failure(key);
                    return Err(ResilienceError::NonRetryable {
                        key: key.clone(),
                        source,
                    });
                }
                Err(source) if attempt >= attempts => {
                    self.circuits.record_failure(key);
                    return Err(ResilienceError::Exhausted {
                        key: key.clone(),
                        attempts: attempt,
                        source,
                    });
                }
                Err(source) => {
                    let delay = policy.delay(attempt, self.jitter.sample());
                    tracing::debug!(
                        circuit = %key,
                        attempt,
                        max_attempts = attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %source,
                        "Retryable failure, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    pub fn reset_circuit(&self, key: &CircuitKey) {
        self.circuits.reset(key);
    }

    pub fn reset_all_circuits(&self) {
        self.circuits.reset_all();
    }

    /// Resets every circuit owned by `layer_id` (used on re-enable and manual retry).
    pub fn reset_layer(&self, layer_id: &LayerId) {
        self.circuits.reset_layer(layer_id);
    }

    pub fn circuit_state(&self, key: &CircuitKey) -> CircuitState {
        self.circuits.state(key)
    }

    /// Last recorded probe result; `unknown` when no probe is attached or none has run.
    pub fn health_status(&self) -> HealthStatus {
        self.health
            .as_ref()
            .map(|h| h.status())
            .unwrap_or_default()
    }

    pub fn health_monitor(&self) -> Option<&Arc<HealthMonitor>> {
        self.health.as_ref()
    }

    /// Starts the background probe loop. Returns `None` when no probe is attached.
    pub fn start_health_monitor(&self, cancel: CancellationToken) -> Option<JoinHandle<()>> {
        self.health.as_ref().map(|h| h.spawn(cancel))
    }
}
