//! Per-call validation context
//!
//! A [`ValidationContext`] is captured once at the start of a validation call
//! and passed down to every time-based check, so `exp` and `nbf` are compared
//! against the same instant.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Default clock skew tolerance applied to `nbf`.
pub const DEFAULT_CLOCK_SKEW: Duration = Duration::from_secs(60);

/// Captured wall-clock time plus skew tolerance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValidationContext {
    now_epoch_secs: i64,
    clock_skew: Duration,
}

impl ValidationContext {
    /// Capture the current time
    pub fn now(clock_skew: Duration) -> Self {
        let now_epoch_secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| i64::try_from(d.as_secs()).unwrap_or(i64::MAX));
        Self {
            now_epoch_secs,
            clock_skew,
        }
    }

    /// Fixed time, for replaying a validation at a known instant
    pub fn at(now_epoch_secs: i64, clock_skew: Duration) -> Self {
        Self {
            now_epoch_secs,
            clock_skew,
        }
    }

    /// Captured time in seconds since the Unix epoch
    pub fn now_epoch_secs(&self) -> i64 {
        self.now_epoch_secs
    }

    /// Tolerated clock skew
    pub fn clock_skew(&self) -> Duration {
        self.clock_skew
    }

    /// Whether a token with this `exp` is expired.
    ///
    /// Per RFC 7519 §4.1.4 the token must not be accepted on or after `exp`.
    /// No skew is applied to expiration.
    pub fn is_expired(&self, exp: i64) -> bool {
        self.now_epoch_secs >= exp
    }

    /// Whether a token with this `nbf` is not yet valid, allowing for skew
    pub fn is_before_not_before(&self, nbf: i64) -> bool {
        let skew = i64::try_from(self.clock_skew.as_secs()).unwrap_or(i64::MAX);
        nbf > self.now_epoch_secs.saturating_add(skew)
    }

    /// Time left until `exp`, zero if already reached
    pub fn remaining_lifetime(&self, exp: i64) -> Duration {
        let remaining = exp.saturating_sub(self.now_epoch_secs);
        Duration::from_secs(u64::try_from(remaining).unwrap_or(0))
    }
}
