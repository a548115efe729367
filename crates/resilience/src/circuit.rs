//! Per-(layer, endpoint) circuit breaker.
//!
//! # State Machine
//!
//! ```text
//! Closed   --[failure_threshold consecutive failures]--> Open
//! Open     --[open_timeout elapsed since opening]------> HalfOpen
//! HalfOpen --[success_threshold consecutive successes]-> Closed
//! HalfOpen --[any failure]-----------------------------> Open
//! Closed   --[reset_timeout without activity]----------> Closed (counters cleared)
//! ```
//!
//! Counters move on terminal outcomes of a wrapped call, not on individual
//! retry attempts. Time-driven transitions are applied lazily whenever a
//! circuit is consulted, so no timer task is needed.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use foundation::{Clock, EpochMillis, LayerId};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// Identifies one circuit: a layer talking to one endpoint.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CircuitKey {
    pub layer_id: LayerId,
    pub endpoint: String,
}

impl CircuitKey {
    pub fn new(layer_id: impl Into<LayerId>, endpoint: impl Into<String>) -> Self {
        Self {
            layer_id: layer_id.into(),
            endpoint: endpoint.into(),
        }
    }
}

impl fmt::Display for CircuitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.layer_id, self.endpoint)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitStatus {
    /// Calls flow normally.
    Closed,
    /// Calls fail fast without touching the network.
    Open,
    /// Trial calls are let through to test recovery.
    HalfOpen,
}

impl CircuitStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitStatus::Closed => "closed",
            CircuitStatus::Open => "open",
            CircuitStatus::HalfOpen => "half_open",
        }
    }

    /// Wording for status indicators.
    pub fn display_status(&self) -> &'static str {
        match self {
            CircuitStatus::Closed => "Online",
            CircuitStatus::Open => "Unavailable",
            CircuitStatus::HalfOpen => "Reconnecting...",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CircuitConfig {
    /// Consecutive failures that trip a closed circuit (default: 5).
    pub failure_threshold: u32,
    /// Consecutive half-open successes needed to close (default: 2).
    pub success_threshold: u32,
    /// Time an open circuit waits before letting a trial call through (default: 60s).
    pub open_timeout: Duration,
    /// Idle time after which a closed circuit forgets its counters (default: 5min).
    pub reset_timeout: Duration,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            open_timeout: Duration::from_secs(60),
            reset_timeout: Duration::from_secs(300),
        }
    }
}

/// Read-only snapshot of one circuit, for status indicators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CircuitState {
    pub state: CircuitStatus,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub opened_at: Option<EpochMillis>,
}

impl Default for CircuitState {
    fn default() -> Self {
        Self {
            state: CircuitStatus::Closed,
            consecutive_failures: 0,
            consecutive_successes: 0,
            opened_at: None,
        }
    }
}

#[derive(Debug)]
struct Circuit {
    state: CircuitStatus,
    consecutive_failures: u32,
    consecutive_successes: u32,
    opened_at: Option<Instant>,
    opened_at_ms: Option<EpochMillis>,
    last_activity: Instant,
}

impl Circuit {
    fn new(now: Instant) -> Self {
        Self {
            state: CircuitStatus::Closed,
            consecutive_failures: 0,
            consecutive_successes: 0,
            opened_at: None,
            opened_at_ms: None,
            last_activity: now,
        }
    }

    fn tick(&mut self, key: &CircuitKey, now: Instant, config: &CircuitConfig) {
        match self.state {
            CircuitStatus::Open => {
                let Some(opened_at) = self.opened_at else {
                    return;
                };
                if now.saturating_duration_since(opened_at) >= config.open_timeout {
                    self.state = CircuitStatus::HalfOpen;
                    self.consecutive_successes = 0;
                    tracing::info!(circuit = %key, "Circuit half-open, allowing trial requests");
                }
            }
            CircuitStatus::Closed => {
                let idle = now.saturating_duration_since(self.last_activity);
                if (self.consecutive_failures > 0 || self.consecutive_successes > 0)
                    && idle >= config.reset_timeout
                {
                    tracing::debug!(
                        circuit = %key,
                        idle_secs = idle.as_secs(),
                        "Circuit idle past reset timeout, clearing counters"
                    );
                    self.consecutive_failures = 0;
                    self.consecutive_successes = 0;
                }
            }
            CircuitStatus::HalfOpen => {}
        }
    }

    fn admit(&mut self, key: &CircuitKey, now: Instant, config: &CircuitConfig) -> Result<(), Duration> {
        self.tick(key, now, config);
        match self.state {
            CircuitStatus::Open => {
                let elapsed = self
                    .opened_at
                    .map(|at| now.saturating_duration_since(at))
                    .unwrap_or_default();
                Err(config.open_timeout.saturating_sub(elapsed))
            }
            CircuitStatus::Closed | CircuitStatus::HalfOpen => Ok(()),
        }
    }

    fn on_success(&mut self, key: &CircuitKey, now: Instant, config: &CircuitConfig) {
        self.tick(key, now, config);
        self.last_activity = now;
        self.consecutive_failures = 0;
        self.consecutive_successes = self.consecutive_successes.saturating_add(1);

        if self.state == CircuitStatus::HalfOpen
            && self.consecutive_successes >= config.success_threshold
        {
            self.state = CircuitStatus::Closed;
            self.opened_at = None;
            self.opened_at_ms = None;
            tracing::info!(circuit = %key, "Circuit CLOSED - endpoint recovered");
        }
    }

    fn on_failure(
        &mut self,
        key: &CircuitKey,
        now: Instant,
        now_ms: EpochMillis,
        config: &CircuitConfig,
    ) {
        self.tick(key, now, config);
        self.last_activity = now;
        self.consecutive_successes = 0;
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);

        let trip = match self.state {
            CircuitStatus::Closed => self.consecutive_failures >= config.failure_threshold,
            CircuitStatus::HalfOpen => true,
            CircuitStatus::Open => false,
        };
        if trip {
            self.state = CircuitStatus::Open;
            self.opened_at = Some(now);
            self.opened_at_ms = Some(now_ms);
            tracing::warn!(
                circuit = %key,
                consecutive_failures = self.consecutive_failures,
                open_secs = config.open_timeout.as_secs(),
                "Circuit OPENED - failing fast"
            );
        }
    }

    fn snapshot(&self) -> CircuitState {
        CircuitState {
            state: self.state,
            consecutive_failures: self.consecutive_failures,
            consecutive_successes: self.consecutive_successes,
            opened_at: self.opened_at_ms,
        }
    }
}

/// All circuits of a process, keyed by (layer, endpoint).
pub struct CircuitRegistry {
    config: CircuitConfig,
    clock: Arc<dyn Clock>,
    circuits: DashMap<CircuitKey, Circuit>,
}

impl fmt::Debug for CircuitRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitRegistry")
            .field("config", &self.config)
            .field("circuits", &self.circuits.len())
            .finish_non_exhaustive()
    }
}

impl CircuitRegistry {
    pub fn new(config: CircuitConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            circuits: DashMap::new(),
        }
    }

    pub fn config(&self) -> &CircuitConfig {
        &self.config
    }

    /// Checks whether a call may proceed. `Err` carries the remaining open time.
    pub fn try_acquire(&self, key: &CircuitKey) -> Result<(), Duration> {
        let now = Instant::now();
        self.circuits
            .entry(key.clone())
            .or_insert_with(|| Circuit::new(now))
            .admit(key, now, &self.config)
    }

    pub fn record_success(&self, key: &CircuitKey) {
        let now = Instant::now();
        self.circuits
            .entry(key.clone())
            .or_insert_with(|| Circuit::new(now))
            .on_success(key, now, &self.config);
    }

    pub fn record_failure(&self, key: &CircuitKey) {
        let now = Instant::now();
        let now_ms = self.clock.now_ms();
        self.circuits
            .entry(key.clone())
            .or_insert_with(|| Circuit::new(now))
            .on_failure(key, now, now_ms, &self.config);
    }

    /// Current state, with time-driven transitions applied.
    pub fn state(&self, key: &CircuitKey) -> CircuitState {
        let now = Instant::now();
        match self.circuits.get_mut(key) {
            Some(mut circuit) => {
                circuit.tick(key, now, &self.config);
                circuit.snapshot()
            }
            None => CircuitState::default(),
        }
    }

    /// Forces a circuit back to closed with zero counters.
    pub fn reset(&self, key: &CircuitKey) {
        if let Some(mut circuit) = self.circuits.get_mut(key) {
            if circuit.state != CircuitStatus::Closed {
                tracing::info!(circuit = %key, "Circuit reset by request");
            }
            *circuit = Circuit::new(Instant::now());
        }
    }

    pub fn reset_all(&self) {
        let now = Instant::now();
        for mut circuit in self.circuits.iter_mut() {
            *circuit.value_mut() = Circuit::new(now);
        }
        tracing::info!(circuits = self.circuits.len(), "All circuits reset");
    }

    /// Resets every circuit belonging to one layer.
    pub fn reset_layer(&self, layer_id: &LayerId) {
        let now = Instant::now();
        for mut circuit in self.circuits.iter_mut() {
            if &circuit.key().layer_id == layer_id {
                *circuit.value_mut() = Circuit::new(now);
            }
        }
    }

    pub fn keys(&self) -> Vec<CircuitKey> {
        let mut keys: Vec<CircuitKey> = self.circuits.iter().map(|c| c.key().clone()).collect();
        keys.sort();
        keys
    }
}
