//! Reconcile loop primitives.
//!
//! Helpers for level-triggered loops that converge observed state toward a
//! declared spec:
//!
//! - **Desired state**: the declared spec, identified by its [`SpecHash`].
//! - **Observed state**: instance phases and health from collaborators.
//! - **Convergence**: issuing only the deltas between the two.
//!
//! # Invariants
//!
//! - All helpers are pure or keyed by caller-supplied time, so a reconcile
//!   pass can be re-run from scratch with the same outcome.
//! - Ordering helpers are stable and deterministic.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use rand::Rng;
use serde::Serialize;
use sha2::{Digest, Sha256};

/// Convergence status for a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConvergenceStatus {
    /// Observed state matches desired state.
    Converged,

    /// Deltas are still being applied.
    Converging,

    /// Retries are exhausted and operator action is required.
    Diverged,

    /// Not enough observations yet.
    Unknown,
}

/// A spec hash for deterministic change detection.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct SpecHash(String);

impl SpecHash {
    /// Hashes any serializable spec.
    ///
    /// The value goes through `serde_json::Value` first; its object map is
    /// key-ordered, so field order in the source type does not matter.
    pub fn of<T: Serialize>(spec: &T) -> Result<Self, serde_json::Error> {
        let value = serde_json::to_value(spec)?;
        Self::from_json(&value)
    }

    pub fn from_json(json: &serde_json::Value) -> Result<Self, serde_json::Error> {
        let canonical = serde_json::to_vec(json)?;
        let digest = Sha256::digest(&canonical);
        // 128 bits is plenty for change detection
        Ok(Self(format!("sha256:{}", hex::encode(&digest[..16]))))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SpecHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Drain priority for scale-down victims.
///
/// Lower values are drained first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum DrainPriority {
    /// Never placed; removing it costs nothing.
    Unplaced = 0,

    /// Placed but not yet confirmed started.
    Starting = 1,

    /// Running but failing health checks.
    Unhealthy = 2,

    /// Serving traffic (drain last).
    Ready = 3,
}

/// Orders candidates so the first element is the first to drain.
///
/// `key` typically combines a [`DrainPriority`] with tie-breakers such as
/// QoS class and readiness time. The sort is stable.
pub fn select_for_drain<T, K, F>(candidates: Vec<T>, key: F) -> Vec<T>
where
    K: Ord,
    F: Fn(&T) -> K,
{
    let mut keyed: Vec<(K, T)> = candidates.into_iter().map(|c| (key(&c), c)).collect();
    keyed.sort_by(|(a, _), (b, _)| a.cmp(b));
    keyed.into_iter().map(|(_, c)| c).collect()
}

/// Sliding-window retry budget keyed by resource.
///
/// Callers pass the current time explicitly so the budget can be evaluated
/// deterministically.
#[derive(Debug, Clone)]
pub struct RetryTracker<K: Ord> {
    max_retries: u32,
    window: Duration,
    /// key -> (count, first failure in the current window)
    failures: BTreeMap<K, (u32, Instant)>,
}

impl<K: Ord + Clone> RetryTracker<K> {
    pub fn new(max_retries: u32, window: Duration) -> Self {
        Self {
            max_retries,
            window,
            failures: BTreeMap::new(),
        }
    }

    /// Records a failure. Returns true once the budget is exhausted.
    pub fn record_failure(&mut self, key: &K, now: Instant) -> bool {
        let (count, first) = self.failures.entry(key.clone()).or_insert((0, now));

        if now.saturating_duration_since(*first) > self.window {
            *count = 0;
            *first = now;
        }

        *count += 1;
        *count > self.max_retries
    }

    pub fn is_exhausted(&self, key: &K, now: Instant) -> bool {
        let Some((count, first)) = self.failures.get(key) else {
            return false;
        };
        if now.saturating_duration_since(*first) > self.window {
            return false;
        }
        *count > self.max_retries
    }

    /// Failures counted in the current window.
    pub fn failures(&self, key: &K, now: Instant) -> u32 {
        match self.failures.get(key) {
            Some((count, first)) if now.saturating_duration_since(*first) <= self.window => *count,
            _ => 0,
        }
    }

    pub fn clear(&mut self, key: &K) {
        self.failures.remove(key);
    }

    /// Drops entries whose window has passed.
    pub fn prune(&mut self, now: Instant) {
        let window = self.window;
        self.failures
            .retain(|_, (_, first)| now.saturating_duration_since(*first) <= window);
    }
}

/// Capped exponential backoff with optional jitter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    /// Delay before the first retry.
    pub base: Duration,

    pub max: Duration,

    /// Jitter factor (0.0 to 1.0). Zero gives exact delays.
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(2),
            max: DEFAULT_BACKOFF_CAP,
            jitter: 0.0,
        }
    }
}

impl BackoffPolicy {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            jitter: 0.0,
        }
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Delay before retry number `attempt` (0-based). Never exceeds `max`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = 2.0_f64.powi(attempt.min(63) as i32);
        let secs = (self.base.as_secs_f64() * exp).min(self.max.as_secs_f64());

        let secs = if self.jitter > 0.0 {
            let spread = secs * self.jitter;
            let offset = rand::rng().random_range(-spread..=spread);
            (secs + offset).clamp(0.0, self.max.as_secs_f64())
        } else {
            secs
        };

        Duration::from_secs_f64(secs)
    }
}

/// Counts consecutive observations of a condition.
///
/// Used for cooldown windows: the streak resets the moment the condition
/// is not observed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsecutiveCounter {
    streak: u32,
}

impl ConsecutiveCounter {
    pub fn observe(&mut self, holds: bool) -> u32 {
        self.streak = if holds { self.streak.saturating_add(1) } else { 0 };
        self.streak
    }

    pub fn streak(&self) -> u32 {
        self.streak
    }

    pub fn reset(&mut self) {
        self.streak = 0;
    }
}

/// Default reconcile interval.
pub const DEFAULT_RECONCILE_INTERVAL: Duration = Duration::from_secs(30);

/// Default restart budget per instance.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default restart budget window.
pub const DEFAULT_RETRY_WINDOW: Duration = Duration::from_secs(10 * 60);

/// Default cap for exponential backoff.
pub const DEFAULT_BACKOFF_CAP: Duration = Duration::from_secs(5 * 60);
