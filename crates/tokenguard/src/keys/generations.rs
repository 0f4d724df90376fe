//! Active and retired key set generations
//!
//! A [`KeyGenerations`] value is immutable: rotation builds a new value which
//! the loader publishes atomically. Instants are passed in so visibility is a
//! pure function of the arguments.

use std::sync::Arc;
use std::time::{Duration, Instant};

use super::key_set::{KeyInfo, KeySet};

/// A key set replaced by a newer one, still usable within the grace period.
#[derive(Debug, Clone)]
pub struct RetiredKeySet {
    keys: Arc<KeySet>,
    retired_at: Instant,
}

impl RetiredKeySet {
    /// The retired keys
    pub fn keys(&self) -> &Arc<KeySet> {
        &self.keys
    }

    /// When the set was replaced
    pub fn retired_at(&self) -> Instant {
        self.retired_at
    }

    fn visible(&self, now: Instant, grace_period: Duration) -> bool {
        now.saturating_duration_since(self.retired_at) < grace_period
    }
}

/// The current key set plus retired ones, oldest first.
#[derive(Debug, Clone, Default)]
pub struct KeyGenerations {
    current: Arc<KeySet>,
    retired: Vec<RetiredKeySet>,
}

impl KeyGenerations {
    /// Start with `current` and nothing retired
    pub fn new(current: Arc<KeySet>) -> Self {
        Self {
            current,
            retired: Vec::new(),
        }
    }

    /// Active key set
    pub fn current(&self) -> &Arc<KeySet> {
        &self.current
    }

    /// Retired key sets, oldest first
    pub fn retired(&self) -> &[RetiredKeySet] {
        &self.retired
    }

    /// Replace the active set with `next`, retiring the old one at `now`.
    ///
    /// An empty active set is not retired. Generations already past
    /// `grace_period` are dropped, then the oldest are evicted until at most
    /// `max_retired` remain. A zero grace period retains nothing.
    #[must_use]
    pub fn rotate(
        &self,
        next: Arc<KeySet>,
        now: Instant,
        grace_period: Duration,
        max_retired: usize,
    ) -> Self {
        if grace_period.is_zero() || max_retired == 0 {
            return Self::new(next);
        }

        let mut retired: Vec<RetiredKeySet> = self
            .retired
            .iter()
            .filter(|generation| generation.visible(now, grace_period))
            .cloned()
            .collect();
        if !self.current.is_empty() {
            retired.push(RetiredKeySet {
                keys: Arc::clone(&self.current),
                retired_at: now,
            });
        }
        if retired.len() > max_retired {
            let excess = retired.len() - max_retired;
            retired.drain(..excess);
        }

        Self {
            current: next,
            retired,
        }
    }

    /// Find `kid` in the active set, then in retired sets still within
    /// `grace_period`, newest first.
    pub fn lookup(&self, kid: &str, now: Instant, grace_period: Duration) -> Option<Arc<KeyInfo>> {
        if let Some(key) = self.current.get(kid) {
            return Some(key);
        }
        if grace_period.is_zero() {
            return None;
        }
        self.retired
            .iter()
            .rev()
            .filter(|generation| generation.visible(now, grace_period))
            .find_map(|generation| generation.keys.get(kid))
    }
}
