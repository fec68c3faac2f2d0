//! Reconciliation loop primitives.
//!
//! This library provides helpers for implementing reconciliation loops
//! that converge desired state to observed state. Key concepts:
//!
//! - **Desired state**: What the system should look like (submitted specs).
//! - **Observed state**: What the system actually looks like (runtime view).
//! - **Convergence**: The process of making observed match desired.
//!
//! # Invariants
//!
//! - All decisions are pure functions of their inputs, so re-running a pass
//!   against unchanged state yields the same (usually empty) plan
//! - Scale-down selection is deterministic: most recently created first
//! - Retry delays grow exponentially and never exceed the configured maximum

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};

/// Convergence status for a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConvergenceStatus {
    /// Resource has converged (observed matches desired).
    Converged,

    /// Resource is converging (observed is moving toward desired).
    Converging,

    /// Resource cannot currently converge (e.g. unschedulable replicas).
    Diverged,

    /// Status is unknown (not reconciled yet).
    Unknown,
}

impl ConvergenceStatus {
    /// Returns true if the resource has converged.
    pub fn is_converged(&self) -> bool {
        matches!(self, Self::Converged)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Converged => "converged",
            Self::Converging => "converging",
            Self::Diverged => "diverged",
            Self::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for ConvergenceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A template hash for deterministic comparison.
///
/// Used to detect instances created from an older pod template.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SpecHash(String);

impl SpecHash {
    /// Compute a hash from canonical JSON.
    pub fn from_json(json: &serde_json::Value) -> Self {
        let canonical = canonical_json(json);
        let digest = Sha256::digest(canonical.as_bytes());
        Self(format!("sha256:{}", hex::encode(&digest[..16])))
    }

    /// Wrap a previously computed hash string (e.g. read back from storage).
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Get the hash string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SpecHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Produce canonical JSON (sorted keys, no extra whitespace).
fn canonical_json(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Object(map) => {
            let mut pairs: Vec<_> = map.iter().collect();
            pairs.sort_by_key(|(k, _)| *k);
            let inner: Vec<String> = pairs
                .iter()
                .map(|(k, v)| format!("{}:{}", quote(k), canonical_json(v)))
                .collect();
            format!("{{{}}}", inner.join(","))
        }
        serde_json::Value::Array(arr) => {
            let inner: Vec<String> = arr.iter().map(canonical_json).collect();
            format!("[{}]", inner.join(","))
        }
        serde_json::Value::String(s) => quote(s),
        other => other.to_string(),
    }
}

// serde_json's string serializer already escapes per RFC 8259.
fn quote(s: &str) -> String {
    serde_json::Value::String(s.to_string()).to_string()
}

/// Split instances into those built from the desired template and the rest.
///
/// Returns `(matching, outdated)`.
pub fn classify_instances<I, F>(
    instances: I,
    desired_spec_hash: &SpecHash,
    get_spec_hash: F,
) -> (Vec<I::Item>, Vec<I::Item>)
where
    I: IntoIterator,
    F: Fn(&I::Item) -> &SpecHash,
{
    instances
        .into_iter()
        .partition(|instance| get_spec_hash(instance) == desired_spec_hash)
}

/// Counts of active instances fed into [`RollingStrategy::plan`].
///
/// "Active" means Running or Pending and not already being terminated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ActiveCounts {
    pub matching_running: u32,
    pub matching_pending: u32,
    pub outdated_running: u32,
    pub outdated_pending: u32,
}

impl ActiveCounts {
    pub fn matching(&self) -> u32 {
        self.matching_running + self.matching_pending
    }

    pub fn outdated(&self) -> u32 {
        self.outdated_running + self.outdated_pending
    }

    pub fn total(&self) -> u32 {
        self.matching() + self.outdated()
    }
}

/// Actions for one reconciliation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScalePlan {
    /// New instances to request from placement.
    pub start: u32,

    /// Outdated instances to terminate.
    pub drain_outdated: u32,

    /// Surplus current-template instances to terminate.
    pub drain_matching: u32,
}

impl ScalePlan {
    pub fn is_empty(&self) -> bool {
        self.start == 0 && self.drain_outdated == 0 && self.drain_matching == 0
    }
}

/// Rollout strategy used when the pod template changes.
#[derive(Debug, Clone)]
pub struct RollingStrategy {
    /// Maximum number of instances that can exist above the desired count.
    pub max_surge: u32,

    /// Maximum number of instances that can be unavailable during rollout.
    pub max_unavailable: u32,
}

impl Default for RollingStrategy {
    fn default() -> Self {
        Self {
            max_surge: 1,
            max_unavailable: 0,
        }
    }
}

impl RollingStrategy {
    /// Compute the actions for one pass.
    ///
    /// With no outdated instances this is the plain replica deficit:
    /// `desired - active` instances to start, or `active - desired` to drain.
    pub fn plan(&self, desired: u32, counts: ActiveCounts) -> ScalePlan {
        let matching = counts.matching();
        let outdated = counts.outdated();

        if outdated == 0 {
            return if matching > desired {
                ScalePlan {
                    drain_matching: matching - desired,
                    ..ScalePlan::default()
                }
            } else {
                ScalePlan {
                    start: desired - matching,
                    ..ScalePlan::default()
                }
            };
        }

        let max_total = desired + self.max_surge;
        let total = counts.total();

        // Anything above the surge ceiling goes first, outdated before matching.
        let excess = total.saturating_sub(max_total);
        let excess_outdated = excess.min(outdated);
        let excess_matching = (excess - excess_outdated).min(matching.saturating_sub(desired));

        let total_after = total - excess_outdated - excess_matching;
        let need = desired.saturating_sub(matching - excess_matching);
        let start = need.min(max_total.saturating_sub(total_after));

        // Outdated replicas still serve, so they count toward availability.
        let available = (counts.matching_running + counts.outdated_running)
            .saturating_sub(excess_outdated.min(counts.outdated_running));
        let min_available = desired.saturating_sub(self.max_unavailable);
        let can_drain = available.saturating_sub(min_available);
        let drain_outdated = excess_outdated + can_drain.min(outdated - excess_outdated);

        ScalePlan {
            start,
            drain_outdated,
            drain_matching: excess_matching,
        }
    }
}

/// Select `count` instances to terminate, most recently created first.
///
/// `created` must give a total order; callers use a creation sequence so
/// instances created in the same batch still have a deterministic order.
pub fn select_for_termination<T, K, F>(mut instances: Vec<T>, count: usize, created: F) -> Vec<T>
where
    K: Ord,
    F: Fn(&T) -> K,
{
    instances.sort_by(|a, b| created(b).cmp(&created(a)));
    instances.truncate(count);
    instances
}

/// Exponential backoff configuration.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    /// Base delay for first retry.
    pub base: Duration,

    /// Maximum delay.
    pub max: Duration,

    /// Jitter factor (0.0 to 1.0).
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: DEFAULT_BACKOFF_BASE,
            max: DEFAULT_BACKOFF_MAX,
            jitter: 0.2,
        }
    }
}

impl BackoffPolicy {
    /// Calculate delay after the given number of consecutive failures (1-based).
    pub fn delay(&self, failures: u32) -> Duration {
        let exp = failures.saturating_sub(1).min(30) as i32;
        let delay = self.base.as_millis() as f64 * 2.0_f64.powi(exp);
        let max = self.max.as_millis() as f64;
        let delay = delay.min(max);

        let jitter = if self.jitter > 0.0 {
            delay * self.jitter * (rand::random::<f64>() * 2.0 - 1.0)
        } else {
            0.0
        };

        Duration::from_millis((delay + jitter).clamp(0.0, max) as u64)
    }
}

#[derive(Debug, Clone)]
struct RetryState {
    failures: u32,
    next_attempt: Instant,
    last_error: String,
}

/// Per-key retry tracker for failed operations.
///
/// Keys are scoped to a single unit of work (one instance, one pending
/// replica slot) so that one failing operation never delays another.
#[derive(Debug, Clone)]
pub struct RetryTracker {
    policy: BackoffPolicy,
    entries: BTreeMap<String, RetryState>,
}

impl RetryTracker {
    /// Create a new retry tracker.
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            policy,
            entries: BTreeMap::new(),
        }
    }

    /// Record a failure for a key.
    ///
    /// Returns the delay before the key may be attempted again.
    pub fn record_failure(&mut self, key: &str, error: impl Into<String>) -> Duration {
        self.record_failure_at(key, error, Instant::now())
    }

    pub fn record_failure_at(
        &mut self,
        key: &str,
        error: impl Into<String>,
        now: Instant,
    ) -> Duration {
        let failures = self.entries.get(key).map_or(0, |s| s.failures) + 1;
        let delay = self.policy.delay(failures);
        self.entries.insert(
            key.to_string(),
            RetryState {
                failures,
                next_attempt: now + delay,
                last_error: error.into(),
            },
        );
        delay
    }

    /// Check whether a key may be attempted now.
    pub fn is_ready(&self, key: &str) -> bool {
        self.is_ready_at(key, Instant::now())
    }

    pub fn is_ready_at(&self, key: &str, now: Instant) -> bool {
        self.entries
            .get(key)
            .is_none_or(|s| now >= s.next_attempt)
    }

    /// Time remaining until a key may be attempted again.
    pub fn retry_in(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        self.entries
            .get(key)
            .map(|s| s.next_attempt.saturating_duration_since(now))
    }

    /// Consecutive failures recorded for a key.
    pub fn failures(&self, key: &str) -> u32 {
        self.entries.get(key).map_or(0, |s| s.failures)
    }

    pub fn last_error(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(|s| s.last_error.as_str())
    }

    /// Clear failure tracking for a key (on success).
    pub fn clear(&mut self, key: &str) {
        self.entries.remove(key);
    }

    /// Clear every key starting with `prefix`.
    pub fn clear_prefix(&mut self, prefix: &str) {
        self.entries.retain(|k, _| !k.starts_with(prefix));
    }

    /// Earliest retry still in the future among keys starting with `prefix`.
    ///
    /// Keys already retryable are skipped: the caller either retried them in
    /// the pass that asks, or no longer needs them.
    pub fn next_retry_with_prefix(&self, prefix: &str) -> Option<Instant> {
        let now = Instant::now();
        self.entries
            .iter()
            .filter(|(k, s)| k.starts_with(prefix) && s.next_attempt > now)
            .map(|(_, s)| s.next_attempt)
            .min()
    }

    /// Clear every key for which `stale` returns true.
    pub fn clear_matching(&mut self, mut stale: impl FnMut(&str) -> bool) {
        self.entries.retain(|k, _| !stale(k));
    }
}

/// Default interval of the periodic safety-net pass.
pub const DEFAULT_RECONCILE_INTERVAL: Duration = Duration::from_secs(10);

/// Default interval between full relists of the runtime.
pub const DEFAULT_RELIST_INTERVAL: Duration = Duration::from_secs(15);

/// Default first retry delay.
pub const DEFAULT_BACKOFF_BASE: Duration = Duration::from_millis(500);

/// Default retry delay ceiling.
pub const DEFAULT_BACKOFF_MAX: Duration = Duration::from_secs(30);
