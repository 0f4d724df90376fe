//! Key material from inline content or a file
//!
//! Loaded once on first use and never refreshed.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use tokio::sync::OnceCell;
use tracing::{error, info};

use super::key_set::{KeyInfo, KeySet};
use super::status::{LoaderStatus, StatusCell};
use super::KeyMaterialLoader;
use crate::error::KeyLoadError;
use crate::monitor::{MeasurementType, PerformanceMonitor};

#[derive(Debug, Clone)]
enum StaticSource {
    Inline(String),
    File(PathBuf),
}

/// Loader for a fixed key set document.
#[derive(Debug)]
pub struct StaticKeyLoader {
    issuer: String,
    source: StaticSource,
    keys: OnceCell<Arc<KeySet>>,
    status: StatusCell,
    last_error: ArcSwapOption<KeyLoadError>,
    monitor: Arc<PerformanceMonitor>,
}

impl StaticKeyLoader {
    /// Keys from an in-memory document
    pub fn inline(
        issuer: impl Into<String>,
        content: impl Into<String>,
        monitor: Arc<PerformanceMonitor>,
    ) -> Self {
        Self::new(issuer.into(), StaticSource::Inline(content.into()), monitor)
    }

    /// Keys from a document on disk
    pub fn file(
        issuer: impl Into<String>,
        path: impl Into<PathBuf>,
        monitor: Arc<PerformanceMonitor>,
    ) -> Self {
        Self::new(issuer.into(), StaticSource::File(path.into()), monitor)
    }

    fn new(issuer: String, source: StaticSource, monitor: Arc<PerformanceMonitor>) -> Self {
        Self {
            issuer,
            source,
            keys: OnceCell::new(),
            status: StatusCell::default(),
            last_error: ArcSwapOption::empty(),
            monitor,
        }
    }

    async fn read(&self) -> Result<KeySet, KeyLoadError> {
        match &self.source {
            StaticSource::Inline(content) => KeySet::parse(content.as_bytes()),
            StaticSource::File(path) => {
                let content = tokio::fs::read(path).await.map_err(|e| KeyLoadError::Io {
                    path: path.clone(),
                    reason: e.to_string(),
                })?;
                KeySet::parse(&content)
            }
        }
    }

    async fn load(&self) -> Arc<KeySet> {
        self.status.begin_load();
        let started = Instant::now();
        let result = self.read().await;
        self.monitor
            .record_since(MeasurementType::JwksOperations, started);

        match result {
            Ok(keys) => {
                info!(issuer = %self.issuer, keys = keys.len(), "Loaded static key set");
                self.status.succeed();
                Arc::new(keys)
            }
            Err(e) => {
                error!(issuer = %self.issuer, error = %e, "Failed to load static key set");
                self.last_error.store(Some(Arc::new(e)));
                self.status.fail();
                Arc::new(KeySet::default())
            }
        }
    }
}

#[async_trait]
impl KeyMaterialLoader for StaticKeyLoader {
    fn issuer(&self) -> &str {
        &self.issuer
    }

    async fn ensure_loaded(&self) -> LoaderStatus {
        self.keys.get_or_init(|| self.load()).await;
        self.status.get()
    }

    fn key_info(&self, kid: &str) -> Option<Arc<KeyInfo>> {
        self.keys.get().and_then(|keys| keys.get(kid))
    }

    fn status(&self) -> LoaderStatus {
        self.status.get()
    }

    fn last_error(&self) -> Option<KeyLoadError> {
        self.last_error.load().as_deref().cloned()
    }
}
