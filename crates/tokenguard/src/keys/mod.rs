//! Key material resolution
//!
//! Every issuer owns one [`KeyMaterialLoader`]. Loaders are lazy: nothing is
//! read or fetched until [`KeyMaterialLoader::ensure_loaded`] is first awaited.
//! Lookups through [`KeyMaterialLoader::key_info`] and status reads never
//! block, also while a load or refresh is in progress.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::KeyLoadError;

pub mod discovery;
pub mod generations;
pub mod http;
pub mod http_loader;
pub mod key_set;
pub mod static_loader;
pub mod status;

pub use discovery::{DiscoveryDocument, DiscoveryResolver};
pub use generations::{KeyGenerations, RetiredKeySet};
pub use http::{ConditionalFetcher, FetchOutcome};
pub use http_loader::{HttpKeyLoader, RefreshOutcome};
pub use key_set::{KeyInfo, KeySet, KeyType};
pub use static_loader::StaticKeyLoader;
pub use status::{LoaderStatus, StatusCell};

/// Resolves verification keys for one issuer.
#[async_trait]
pub trait KeyMaterialLoader: Send + Sync + fmt::Debug {
    /// Issuer the keys belong to
    fn issuer(&self) -> &str;

    /// Perform the first load if it has not happened yet, and return the
    /// resulting status. Concurrent callers share one load.
    async fn ensure_loaded(&self) -> LoaderStatus;

    /// Key with `kid`, if currently visible
    fn key_info(&self, kid: &str) -> Option<Arc<KeyInfo>>;

    /// Current status
    fn status(&self) -> LoaderStatus;

    /// Error of the most recent failed load, cleared by a successful one
    fn last_error(&self) -> Option<KeyLoadError>;

    /// Stop background work
    fn shutdown(&self) {}
}
