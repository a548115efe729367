//! Retry policy and backoff schedule.

use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Default number of attempts for a retryable failure.
pub const DEFAULT_MAX_RETRIES: u32 = 3;
/// Delay before the first retry.
pub const DEFAULT_INITIAL_DELAY: Duration = Duration::from_secs(1);
/// Upper bound for any single backoff delay.
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(10);
/// Timeout applied to each individual attempt.
pub const DEFAULT_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(60);

/// How a retryable failure is retried.
///
/// `max_retries` counts attempts in total: a policy with `max_retries = 3`
/// gives up after the third failed attempt and sleeps twice in between.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
    /// Relative jitter applied to each delay (0.2 = ±20%).
    pub jitter: f64,
    pub attempt_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            initial_delay: DEFAULT_INITIAL_DELAY,
            multiplier: 2.0,
            max_delay: DEFAULT_MAX_DELAY,
            jitter: 0.2,
            attempt_timeout: DEFAULT_ATTEMPT_TIMEOUT,
        }
    }
}

impl RetryPolicy {
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = timeout;
        self
    }

    /// Total attempts this policy allows (always at least one).
    pub fn attempts(&self) -> u32 {
        self.max_retries.max(1)
    }

    /// Delay before the `retry`-th retry (1-based), without jitter:
    /// `min(initial_delay * multiplier^(retry - 1), max_delay)`.
    pub fn base_delay(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(63) as i32;
        let secs = self.initial_delay.as_secs_f64() * self.multiplier.max(1.0).powi(exponent);
        let capped = secs.min(self.max_delay.as_secs_f64());
        if capped.is_finite() {
            Duration::from_secs_f64(capped.max(0.0))
        } else {
            self.max_delay
        }
    }

    /// Jittered delay. `unit` is a sample in `[-1, 1]`.
    pub fn delay(&self, retry: u32, unit: f64) -> Duration {
        let base = self.base_delay(retry).as_secs_f64();
        let factor = 1.0 + self.jitter * unit.clamp(-1.0, 1.0);
        Duration::from_secs_f64((base * factor).max(0.0))
    }
}

/// Source of jitter samples in `[-1, 1]`.
pub trait JitterSource: Send + Sync + Debug {
    fn sample(&self) -> f64;
}

/// No jitter; delays are exactly the base schedule.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoJitter;

impl JitterSource for NoJitter {
    fn sample(&self) -> f64 {
        0.0
    }
}

/// Jitter derived from a keyed hash of a per-process seed and a counter.
///
/// Uniform enough to desynchronise retry storms across layers; not meant
/// for anything security related.
#[derive(Debug)]
pub struct HashJitter {
    seed: [u8; 32],
    counter: AtomicU64,
}

impl HashJitter {
    pub fn new() -> Self {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        Self::with_seed(&nanos.to_le_bytes())
    }

    pub fn with_seed(seed: &[u8]) -> Self {
        Self {
            seed: *blake3::hash(seed).as_bytes(),
            counter: AtomicU64::new(0),
        }
    }
}

impl Default for HashJitter {
    fn default() -> Self {
        Self::new()
    }
}

impl JitterSource for HashJitter {
    fn sample(&self) -> f64 {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        let hash = blake3::keyed_hash(&self.seed, &n.to_le_bytes());
        let mut word = [0u8; 8];
        word.copy_from_slice(&hash.as_bytes()[..8]);
        // 53 bits of mantissa -> [0, 1), then map onto [-1, 1).
        let unit = (u64::from_le_bytes(word) >> 11) as f64 / (1u64 << 53) as f64;
        unit * 2.0 - 1.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_then_caps() {
        let p = RetryPolicy::default();
        let ms: Vec<u128> = (1..=6).map(|n| p.base_delay(n).as_millis()).collect();
        assert_eq!(ms, vec![1000, 2000, 4000, 8000, 10000, 10000]);
    }

    #[test]
    fn backoff_matches_closed_form() {
        let p = RetryPolicy::default();
        for n in 1..=10u32 {
            let expected = (1000u64 * 2u64.pow(n - 1)).min(10_000);
            assert_eq!(p.base_delay(n), Duration::from_millis(expected));
        }
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let p = RetryPolicy::default();
        let close = |d: Duration, ms: f64| (d.as_secs_f64() * 1000.0 - ms).abs() < 0.01;
        assert!(close(p.delay(2, 1.0), 2400.0));
        assert!(close(p.delay(2, -1.0), 1600.0));
        assert!(close(p.delay(2, 7.0), 2400.0));
        assert_eq!(p.delay(2, 0.0), Duration::from_secs(2));

        let j = HashJitter::with_seed(b"test");
        for _ in 0..1000 {
            let s = j.sample();
            assert!((-1.0..1.0).contains(&s));
        }
    }

    #[test]
    fn hash_jitter_varies() {
        let j = HashJitter::with_seed(b"seed");
        let a = j.sample();
        let b = j.sample();
        assert_ne!(a, b);
    }

    #[test]
    fn at_least_one_attempt() {
        assert_eq!(RetryPolicy::default().with_max_retries(0).attempts(), 1);
        assert_eq!(RetryPolicy::default().attempts(), 3);
    }
}
