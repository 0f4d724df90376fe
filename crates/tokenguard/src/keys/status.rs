//! Loader status machine
//!
//! `Undefined -> Loading -> {Ok, Error}`, with `Error -> Loading` on a later
//! cycle. Once `Ok`, a loader stays `Ok`: later cycles that fail keep serving
//! the content that made it `Ok`.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

/// Key material availability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum LoaderStatus {
    /// No load attempted yet
    Undefined = 0,
    /// First load, or a retry after failure, in progress
    Loading = 1,
    /// Key material available
    Ok = 2,
    /// Last load failed and nothing was ever loaded
    Error = 3,
}

impl LoaderStatus {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => LoaderStatus::Loading,
            2 => LoaderStatus::Ok,
            3 => LoaderStatus::Error,
            _ => LoaderStatus::Undefined,
        }
    }

    /// Whether `self -> next` is a legal transition
    pub fn can_transition_to(self, next: LoaderStatus) -> bool {
        matches!(
            (self, next),
            (LoaderStatus::Undefined, LoaderStatus::Loading)
                | (LoaderStatus::Error, LoaderStatus::Loading)
                | (LoaderStatus::Loading, LoaderStatus::Ok)
                | (LoaderStatus::Loading, LoaderStatus::Error)
        )
    }
}

impl fmt::Display for LoaderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            LoaderStatus::Undefined => "undefined",
            LoaderStatus::Loading => "loading",
            LoaderStatus::Ok => "ok",
            LoaderStatus::Error => "error",
        };
        f.write_str(label)
    }
}

/// Atomic holder enforcing the legal transitions.
#[derive(Debug)]
pub struct StatusCell(AtomicU8);

impl Default for StatusCell {
    fn default() -> Self {
        Self(AtomicU8::new(LoaderStatus::Undefined as u8))
    }
}

impl StatusCell {
    /// Current status, one atomic load
    pub fn get(&self) -> LoaderStatus {
        LoaderStatus::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Enter `Loading` from `Undefined` or `Error`. Returns the status the
    /// cell holds afterwards; an `Ok` cell is left untouched.
    pub fn begin_load(&self) -> LoaderStatus {
        for from in [LoaderStatus::Undefined, LoaderStatus::Error] {
            if self.transition(from, LoaderStatus::Loading) {
                return LoaderStatus::Loading;
            }
        }
        self.get()
    }

    /// Record a successful load
    pub fn succeed(&self) {
        self.transition(LoaderStatus::Loading, LoaderStatus::Ok);
    }

    /// Record a failed load; only a `Loading` cell becomes `Error`
    pub fn fail(&self) {
        self.transition(LoaderStatus::Loading, LoaderStatus::Error);
    }

    fn transition(&self, from: LoaderStatus, to: LoaderStatus) -> bool {
        debug_assert!(from.can_transition_to(to));
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path() {
        let cell = StatusCell::default();
        assert_eq!(cell.get(), LoaderStatus::Undefined);
        assert_eq!(cell.begin_load(), LoaderStatus::Loading);
        cell.succeed();
        assert_eq!(cell.get(), LoaderStatus::Ok);
    }

    #[test]
    fn test_ok_is_never_reloaded() {
        let cell = StatusCell::default();
        cell.begin_load();
        cell.succeed();

        assert_eq!(cell.begin_load(), LoaderStatus::Ok);
        cell.fail();
        assert_eq!(cell.get(), LoaderStatus::Ok);
    }

    #[test]
    fn test_error_recovers_through_loading() {
        let cell = StatusCell::default();
        cell.begin_load();
        cell.fail();
        assert_eq!(cell.get(), LoaderStatus::Error);

        assert_eq!(cell.begin_load(), LoaderStatus::Loading);
        cell.succeed();
        assert_eq!(cell.get(), LoaderStatus::Ok);
    }

    #[test]
    fn test_transition_table() {
        use LoaderStatus::*;
        assert!(Undefined.can_transition_to(Loading));
        assert!(Error.can_transition_to(Loading));
        assert!(!Ok.can_transition_to(Loading));
        assert!(!Loading.can_transition_to(Undefined));
        assert!(!Undefined.can_transition_to(Ok));
    }
}
