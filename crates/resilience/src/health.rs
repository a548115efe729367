//! Background health probing of the data service.
//!
//! The probe result is advisory: it feeds status indicators and logs, and
//! never opens or closes per-layer circuits.

use std::sync::Arc;
use std::time::Duration;

use foundation::{Clock, EpochMillis};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::BoxFuture;
use crate::error::FetchError;

/// Default interval between probes.
pub const DEFAULT_HEALTH_INTERVAL: Duration = Duration::from_secs(30);
/// Default timeout for a single probe.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// A lightweight request that tells whether the backing service is up.
pub trait HealthProbe: Send + Sync {
    /// Human-readable probe target, for logs.
    fn target(&self) -> &str;

    fn probe(&self) -> BoxFuture<'_, Result<(), FetchError>>;
}

/// Point-in-time result of the most recent probe.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthStatus {
    pub reachable: bool,
    pub latency_ms: Option<u64>,
    pub last_checked_at: Option<EpochMillis>,
    pub last_error: Option<String>,
    pub consecutive_failures: u32,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match (self.last_checked_at, self.reachable) {
            (None, _) => "unknown",
            (Some(_), true) => "healthy",
            (Some(_), false) => "unreachable",
        }
    }
}

pub struct HealthMonitor {
    probe: Arc<dyn HealthProbe>,
    interval: Duration,
    timeout: Duration,
    clock: Arc<dyn Clock>,
    status: RwLock<HealthStatus>,
}

impl std::fmt::Debug for HealthMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthMonitor")
            .field("target", &self.probe.target())
            .field("interval", &self.interval)
            .field("status", &*self.status.read())
            .finish_non_exhaustive()
    }
}

impl HealthMonitor {
    pub fn new(
        probe: Arc<dyn HealthProbe>,
        interval: Duration,
        timeout: Duration,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            probe,
            interval,
            timeout,
            clock,
            status: RwLock::new(HealthStatus::default()),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn status(&self) -> HealthStatus {
        self.status.read().clone()
    }

    /// Runs one probe immediately and records the result.
    pub async fn check_now(&self) -> HealthStatus {
        let started = Instant::now();
        let result = match tokio::time::timeout(self.timeout, self.probe.probe()).await {
            Ok(r) => r,
            Err(_) => Err(FetchError::Timeout(self.timeout)),
        };
        let latency_ms = started.elapsed().as_millis() as u64;
        let checked_at = self.clock.now_ms();

        let mut status = self.status.write();
        let was_reachable = status.reachable;
        let first_check = status.last_checked_at.is_none();
        status.last_checked_at = Some(checked_at);

        match result {
            Ok(()) => {
                status.reachable = true;
                status.latency_ms = Some(latency_ms);
                status.last_error = None;
                status.consecutive_failures = 0;
                if !was_reachable {
                    tracing::info!(target_url = self.probe.target(), latency_ms, "Data service reachable");
                } else {
                    tracing::trace!(target_url = self.probe.target(), latency_ms, "Health probe ok");
                }
            }
            Err(e) => {
                status.reachable = false;
                status.latency_ms = None;
                status.last_error = Some(e.to_string());
                status.consecutive_failures = status.consecutive_failures.saturating_add(1);
                if was_reachable || first_check {
                    tracing::warn!(target_url = self.probe.target(), error = %e, "Data service unreachable");
                } else {
                    tracing::debug!(
                        target_url = self.probe.target(),
                        error = %e,
                        consecutive_failures = status.consecutive_failures,
                        "Health probe still failing"
                    );
                }
            }
        }

        status.clone()
    }

    /// Probes on a fixed interval until `cancel` fires. The first probe runs immediately.
    pub fn spawn(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let monitor = Arc::clone(self);
        tokio::spawn(async move {
            tracing::debug!(
                target_url = monitor.probe.target(),
                interval_secs = monitor.interval.as_secs(),
                "Health monitor started"
            );
            let mut interval = tokio::time::interval(monitor.interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        monitor.check_now().await;
                    }
                }
            }
            tracing::debug!("Health monitor stopped");
        })
    }
}
