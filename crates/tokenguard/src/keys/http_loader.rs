//! Remote key material with background refresh and rotation grace period
//!
//! [`HttpKeyLoader`] fetches a key set directly or through discovery, keeps
//! it in an [`ArcSwap`] snapshot for lock-free lookups, and refreshes it on a
//! fixed interval. Content that actually changed retires the previous key set
//! into [`KeyGenerations`]; unchanged content (304 or identical bytes) leaves
//! the generations untouched.

use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use arc_swap::{ArcSwap, ArcSwapOption};
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, OnceCell};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::discovery::DiscoveryResolver;
use super::generations::KeyGenerations;
use super::http::{ConditionalFetcher, FetchOutcome};
use super::key_set::{KeyInfo, KeySet};
use super::status::{LoaderStatus, StatusCell};
use super::KeyMaterialLoader;
use crate::config::{HttpLoaderConfig, KeyEndpoint};
use crate::error::{ConfigError, KeyLoadError};
use crate::monitor::{MeasurementType, PerformanceMonitor};
use crate::retry::RetryStrategy;
use crate::security_events::record_key_rotation;

/// What a load cycle did to the key material.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// Content identical to what is already active
    Unchanged,
    /// New content became active
    Changed {
        /// Usable keys in the new set
        keys: usize,
        /// Whether a previous non-empty set was retired
        rotated: bool,
    },
}

/// HTTP key loader for one issuer.
#[derive(Debug)]
pub struct HttpKeyLoader {
    issuer: String,
    config: HttpLoaderConfig,
    client: reqwest::Client,
    resolver: Option<DiscoveryResolver>,
    fetcher: OnceCell<ConditionalFetcher>,
    generations: ArcSwap<KeyGenerations>,
    status: StatusCell,
    last_error: ArcSwapOption<KeyLoadError>,
    write_lock: AsyncMutex<()>,
    first_load: OnceCell<()>,
    cancel: CancellationToken,
    refresh_task: Mutex<Option<JoinHandle<()>>>,
    retry: RetryStrategy,
    monitor: Arc<PerformanceMonitor>,
    this: Weak<HttpKeyLoader>,
}

impl HttpKeyLoader {
    /// Create a loader; nothing is fetched until first use.
    ///
    /// # Errors
    ///
    /// [`ConfigError::HttpClient`] if the HTTP client cannot be built.
    pub fn new(
        issuer: impl Into<String>,
        config: HttpLoaderConfig,
        monitor: Arc<PerformanceMonitor>,
    ) -> Result<Arc<Self>, ConfigError> {
        let issuer = issuer.into();
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .user_agent(concat!("tokenguard/", env!("CARGO_PKG_VERSION")))
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| ConfigError::HttpClient(e.to_string()))?;

        let (resolver, fetcher) = match &config.endpoint {
            KeyEndpoint::Jwks(url) => (
                None,
                OnceCell::new_with(Some(ConditionalFetcher::new(
                    client.clone(),
                    url.clone(),
                    config.max_response_size,
                ))),
            ),
            KeyEndpoint::Discovery(url) => (
                Some(DiscoveryResolver::new(
                    client.clone(),
                    url.clone(),
                    issuer.clone(),
                    config.max_response_size,
                )),
                OnceCell::new(),
            ),
        };
        let retry = RetryStrategy::new(config.retry.clone(), Arc::clone(&monitor));

        Ok(Arc::new_cyclic(|this| Self {
            issuer,
            config,
            client,
            resolver,
            fetcher,
            generations: ArcSwap::from_pointee(KeyGenerations::default()),
            status: StatusCell::default(),
            last_error: ArcSwapOption::empty(),
            write_lock: AsyncMutex::new(()),
            first_load: OnceCell::new(),
            cancel: CancellationToken::new(),
            refresh_task: Mutex::new(None),
            retry,
            monitor,
            this: this.clone(),
        }))
    }

    /// Loader settings
    pub fn config(&self) -> &HttpLoaderConfig {
        &self.config
    }

    /// Snapshot of the active and retired key sets
    pub fn generations(&self) -> Arc<KeyGenerations> {
        self.generations.load_full()
    }

    /// Retry counters of the fetch strategy
    pub fn retry_strategy(&self) -> &RetryStrategy {
        &self.retry
    }

    /// Run one load cycle now, performing the first load if needed.
    ///
    /// # Errors
    ///
    /// The error of this cycle. With previously loaded content the loader
    /// keeps serving it regardless.
    pub async fn refresh(&self) -> Result<RefreshOutcome, KeyLoadError> {
        if self.first_load.initialized() {
            return self.load_cycle().await;
        }
        self.ensure_loaded().await;
        match self.last_error() {
            Some(e) => Err(e),
            None => Ok(RefreshOutcome::Changed {
                keys: self.generations.load().current().len(),
                rotated: false,
            }),
        }
    }

    async fn fetcher(&self) -> Result<&ConditionalFetcher, KeyLoadError> {
        self.fetcher
            .get_or_try_init(|| async {
                let resolver = self.resolver.as_ref().ok_or_else(|| {
                    KeyLoadError::InvalidDiscoveryDocument("no key set location".into())
                })?;
                let url = resolver.jwks_uri().await?;
                Ok::<_, KeyLoadError>(ConditionalFetcher::new(
                    self.client.clone(),
                    url,
                    self.config.max_response_size,
                ))
            })
            .await
    }

    async fn fetch_and_apply(&self) -> Result<RefreshOutcome, KeyLoadError> {
        let fetcher = self.fetcher().await?;
        let (body, etag) = match fetcher.fetch().await? {
            FetchOutcome::NotModified | FetchOutcome::Unchanged => {
                debug!(issuer = %self.issuer, "Key set unchanged");
                return Ok(RefreshOutcome::Unchanged);
            }
            FetchOutcome::Changed { body, etag } => (body, etag),
        };

        let keys = Arc::new(KeySet::parse(&body)?);
        fetcher.store(body, etag);

        let current = self.generations.load_full();
        let rotated = !current.current().is_empty();
        let key_count = keys.len();
        let next = current.rotate(
            keys,
            Instant::now(),
            self.config.grace_period,
            self.config.max_retired_key_sets,
        );
        self.generations.store(Arc::new(next));

        if rotated {
            info!(
                issuer = %self.issuer,
                keys = key_count,
                grace_period_secs = self.config.grace_period.as_secs(),
                "Key set rotated"
            );
            record_key_rotation(&self.issuer);
        } else {
            info!(issuer = %self.issuer, keys = key_count, "Loaded key set");
        }

        Ok(RefreshOutcome::Changed {
            keys: key_count,
            rotated,
        })
    }

    async fn load_cycle(&self) -> Result<RefreshOutcome, KeyLoadError> {
        let _guard = self.write_lock.lock().await;
        self.status.begin_load();

        let started = Instant::now();
        let result = self
            .retry
            .execute("key_set_fetch", &self.cancel, |_| self.fetch_and_apply())
            .await;
        self.monitor
            .record_since(MeasurementType::JwksOperations, started);

        match &result {
            Ok(_) => {
                self.last_error.store(None);
                self.status.succeed();
            }
            Err(KeyLoadError::Cancelled) => {
                debug!(issuer = %self.issuer, "Key set load cancelled");
                self.status.fail();
            }
            Err(e) => {
                self.last_error.store(Some(Arc::new(e.clone())));
                if self.status.get() == LoaderStatus::Ok {
                    warn!(
                        issuer = %self.issuer,
                        error = %e,
                        "Key set refresh failed, serving cached keys"
                    );
                } else {
                    error!(issuer = %self.issuer, error = %e, "Key set load failed");
                    self.status.fail();
                }
            }
        }
        result
    }

    fn schedule_refresh(&self) {
        let interval = self.config.refresh_interval;
        if interval.is_zero() || self.cancel.is_cancelled() {
            return;
        }

        let this = self.this.clone();
        let cancel = self.cancel.clone();
        let issuer = self.issuer.clone();
        let handle = tokio::spawn(async move {
            let start = tokio::time::Instant::now() + interval;
            let mut ticker = tokio::time::interval_at(start, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let Some(loader) = this.upgrade() else {
                    break;
                };
                // Outcome is logged by the cycle itself
                let _ = loader.load_cycle().await;
            }
            debug!(issuer = %issuer, "Key refresh task stopped");
        });
        *self.refresh_task.lock() = Some(handle);
    }

    /// Whether the background refresh task is running
    pub fn is_refreshing(&self) -> bool {
        self.refresh_task
            .lock()
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    /// Refresh interval in effect
    pub fn refresh_interval(&self) -> Duration {
        self.config.refresh_interval
    }
}

#[async_trait]
impl KeyMaterialLoader for HttpKeyLoader {
    fn issuer(&self) -> &str {
        &self.issuer
    }

    async fn ensure_loaded(&self) -> LoaderStatus {
        self.first_load
            .get_or_init(|| async {
                // Result is recorded in status and last_error
                let _ = self.load_cycle().await;
                self.schedule_refresh();
            })
            .await;
        self.status.get()
    }

    fn key_info(&self, kid: &str) -> Option<Arc<KeyInfo>> {
        self.generations
            .load()
            .lookup(kid, Instant::now(), self.config.grace_period)
    }

    fn status(&self) -> LoaderStatus {
        self.status.get()
    }

    fn last_error(&self) -> Option<KeyLoadError> {
        self.last_error.load().as_deref().cloned()
    }

    fn shutdown(&self) {
        self.cancel.cancel();
        if let Some(task) = self.refresh_task.lock().take() {
            task.abort();
        }
    }
}

impl Drop for HttpKeyLoader {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
