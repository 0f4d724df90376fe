//! Security event counting for external auditing
//!
//! Every rejected token increments exactly one counter keyed by its
//! [`FailureKind`]. Counting is independent of logging: the opaque parse path
//! for refresh tokens logs nothing and counts nothing, every other failure is
//! counted even when its log line is filtered out.
//!
//! With the `metrics` feature the counters are mirrored to the `metrics`
//! facade. A recorder must be installed by the application (e.g. via
//! `metrics-exporter-prometheus`).
//!
//! ## Metrics Provided
//!
//! - `tokenguard_security_events_total` - Counter of rejected tokens (labels: kind)
//! - `tokenguard_token_cache_total` - Counter of cache lookups (labels: outcome)
//! - `tokenguard_key_rotations_total` - Counter of key set rotations (labels: issuer)

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

#[cfg(feature = "metrics")]
use metrics::{counter, describe_counter};

#[cfg(feature = "metrics")]
use std::sync::Once;

use crate::error::FailureKind;

#[cfg(feature = "metrics")]
static INIT: Once = Once::new();

/// Lock-free per-kind failure counters.
#[derive(Debug)]
pub struct SecurityEventCounter {
    counters: [AtomicU64; FailureKind::ALL.len()],
}

impl Default for SecurityEventCounter {
    fn default() -> Self {
        Self::new()
    }
}

impl SecurityEventCounter {
    /// Create a counter set with every kind at zero
    pub fn new() -> Self {
        init_metrics();
        Self {
            counters: std::array::from_fn(|_| AtomicU64::new(0)),
        }
    }

    /// Record one occurrence of `kind`
    pub fn increment(&self, kind: FailureKind) {
        self.counters[kind.index()].fetch_add(1, Ordering::Relaxed);
        record_security_event(kind);
    }

    /// Current count for `kind`
    pub fn count(&self, kind: FailureKind) -> u64 {
        self.counters[kind.index()].load(Ordering::Relaxed)
    }

    /// Sum over all kinds
    pub fn total(&self) -> u64 {
        self.counters
            .iter()
            .map(|c| c.load(Ordering::Relaxed))
            .sum()
    }

    /// Non-zero counts, ordered by kind
    pub fn snapshot(&self) -> BTreeMap<FailureKind, u64> {
        FailureKind::ALL
            .iter()
            .filter_map(|&kind| {
                let count = self.count(kind);
                (count > 0).then_some((kind, count))
            })
            .collect()
    }

    /// Zero all counters
    pub fn reset(&self) {
        for c in &self.counters {
            c.store(0, Ordering::Relaxed);
        }
    }
}

/// Register metric descriptions. Idempotent.
#[cfg(feature = "metrics")]
pub fn init_metrics() {
    INIT.call_once(|| {
        describe_counter!(
            "tokenguard_security_events_total",
            "Rejected tokens by failure kind"
        );
        describe_counter!(
            "tokenguard_token_cache_total",
            "Access token cache lookups by outcome"
        );
        describe_counter!(
            "tokenguard_key_rotations_total",
            "Key set rotations detected by background refresh"
        );
    });
}

#[cfg(feature = "metrics")]
fn record_security_event(kind: FailureKind) {
    counter!("tokenguard_security_events_total", "kind" => kind.as_str()).increment(1);
}

#[cfg(feature = "metrics")]
pub(crate) fn record_cache_lookup(hit: bool) {
    let outcome = if hit { "hit" } else { "miss" };
    counter!("tokenguard_token_cache_total", "outcome" => outcome).increment(1);
}

#[cfg(feature = "metrics")]
pub(crate) fn record_key_rotation(issuer: &str) {
    counter!("tokenguard_key_rotations_total", "issuer" => issuer.to_owned()).increment(1);
}

// No-op versions when metrics feature is disabled
#[cfg(not(feature = "metrics"))]
#[allow(missing_docs)]
pub fn init_metrics() {}

#[cfg(not(feature = "metrics"))]
fn record_security_event(_kind: FailureKind) {}

#[cfg(not(feature = "metrics"))]
pub(crate) fn record_cache_lookup(_hit: bool) {}

#[cfg(not(feature = "metrics"))]
pub(crate) fn record_key_rotation(_issuer: &str) {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counts_per_kind() {
        let counter = SecurityEventCounter::new();
        counter.increment(FailureKind::TokenExpired);
        counter.increment(FailureKind::TokenExpired);
        counter.increment(FailureKind::KeyNotFound);

        assert_eq!(counter.count(FailureKind::TokenExpired), 2);
        assert_eq!(counter.count(FailureKind::KeyNotFound), 1);
        assert_eq!(counter.count(FailureKind::TokenEmpty), 0);
        assert_eq!(counter.total(), 3);

        let snapshot = counter.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[&FailureKind::TokenExpired], 2);
    }

    #[test]
    fn test_reset() {
        let counter = SecurityEventCounter::new();
        counter.increment(FailureKind::InvalidFormat);
        counter.reset();
        assert_eq!(counter.total(), 0);
        assert!(counter.snapshot().is_empty());
    }

    #[test]
    fn test_init_metrics_idempotent() {
        init_metrics();
        init_metrics();
    }
}
