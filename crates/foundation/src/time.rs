//! Time primitives.

use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Wall-clock timestamp in milliseconds since the Unix epoch.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EpochMillis(pub u64);

impl EpochMillis {
    pub const ZERO: EpochMillis = EpochMillis(0);

    pub fn saturating_add(self, d: Duration) -> Self {
        EpochMillis(self.0.saturating_add(d.as_millis() as u64))
    }

    pub fn since(self, earlier: EpochMillis) -> Duration {
        Duration::from_millis(self.0.saturating_sub(earlier.0))
    }
}

/// Source of wall-clock timestamps.
///
/// Persisted and user-visible timestamps go through this seam so tests can
/// pin them. Durations (timeouts, backoff) use the async runtime's clock instead.
pub trait Clock: Send + Sync + Debug {
    fn now_ms(&self) -> EpochMillis;
}

#[derive(Debug, Default, Copy, Clone)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> EpochMillis {
        let ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        EpochMillis(ms)
    }
}

/// Manually driven clock for deterministic tests and replays.
#[derive(Debug, Default)]
pub struct ManualClock {
    ms: AtomicU64,
}

impl ManualClock {
    pub fn new(start: EpochMillis) -> Self {
        Self {
            ms: AtomicU64::new(start.0),
        }
    }

    pub fn set(&self, t: EpochMillis) {
        self.ms.store(t.0, Ordering::SeqCst);
    }

    pub fn advance(&self, d: Duration) {
        self.ms.fetch_add(d.as_millis() as u64, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> EpochMillis {
        EpochMillis(self.ms.load(Ordering::SeqCst))
    }
}
