//! Token validator facade
//!
//! ```rust,no_run
//! use tokenguard::{IssuerConfig, TokenValidator};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let issuer = IssuerConfig::builder()
//!     .issuer("https://idp.example.com")
//!     .expected_audience("orders-api")
//!     .jwks_file("/etc/tokenguard/jwks.json")
//!     .build()?;
//!
//! let validator = TokenValidator::builder().issuer(issuer).build()?;
//! let token = validator.validate_access_token("eyJ...").await?;
//! println!("subject: {:?}", token.subject());
//! # Ok(())
//! # }
//! ```

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tracing::{info, warn};

use super::cache::TokenCache;
use super::pipeline::{IssuerValidators, ValidationPipeline};
use crate::config::{CacheConfig, IssuerConfig, KeySource, MonitorSettings, ValidatorSettings};
use crate::context::DEFAULT_CLOCK_SKEW;
use crate::error::{ConfigError, Result};
use crate::keys::{HttpKeyLoader, KeyMaterialLoader, LoaderStatus, StaticKeyLoader};
use crate::monitor::PerformanceMonitor;
use crate::security_events::SecurityEventCounter;
use crate::token::{
    AccessTokenContent, IdTokenContent, ParserConfig, RefreshTokenContent, TokenParser,
};

/// Validates access, ID and refresh tokens for a set of issuers.
///
/// Cheap to share behind an [`Arc`]; all methods take `&self`.
#[derive(Debug)]
pub struct TokenValidator {
    pipeline: ValidationPipeline,
    monitor: Arc<PerformanceMonitor>,
    events: Arc<SecurityEventCounter>,
}

impl TokenValidator {
    /// Start configuring a validator
    pub fn builder() -> TokenValidatorBuilder {
        TokenValidatorBuilder::default()
    }

    /// Validate an access token, answering repeats from the cache.
    ///
    /// # Errors
    ///
    /// The [`ValidationError`](crate::ValidationError) of the first failing stage.
    pub async fn validate_access_token(&self, token: &str) -> Result<AccessTokenContent> {
        self.pipeline.validate_access_token(token).await
    }

    /// Validate an ID token.
    ///
    /// # Errors
    ///
    /// The [`ValidationError`](crate::ValidationError) of the first failing stage.
    pub async fn validate_id_token(&self, token: &str) -> Result<IdTokenContent> {
        self.pipeline.validate_id_token(token).await
    }

    /// Accept a refresh token, JWT or opaque.
    ///
    /// # Errors
    ///
    /// Only for blank or oversized input.
    pub fn validate_refresh_token(&self, token: &str) -> Result<RefreshTokenContent> {
        self.pipeline.validate_refresh_token(token)
    }

    /// Load every issuer's keys now instead of on first use.
    ///
    /// Loads run concurrently. Returns the resulting status per issuer; a
    /// failed load is reported, not raised, and is retried by the loader.
    pub async fn initialize(&self) -> BTreeMap<String, LoaderStatus> {
        let mut loads = JoinSet::new();
        for issuer in self.pipeline.issuers() {
            let loader = Arc::clone(issuer.loader());
            loads.spawn(async move {
                let status = loader.ensure_loaded().await;
                (loader.issuer().to_owned(), status)
            });
        }

        let mut statuses = BTreeMap::new();
        while let Some(joined) = loads.join_next().await {
            match joined {
                Ok((issuer, status)) => {
                    if status != LoaderStatus::Ok {
                        warn!(issuer = %issuer, status = %status, "Key material not available after initialization");
                    }
                    statuses.insert(issuer, status);
                }
                Err(e) => warn!(error = %e, "Key material load task failed"),
            }
        }
        info!(issuers = statuses.len(), "Token validator initialized");
        statuses
    }

    /// Stop background key refreshes and drop cached tokens
    pub fn shutdown(&self) {
        for issuer in self.pipeline.issuers() {
            issuer.loader().shutdown();
        }
        self.pipeline.cache().clear();
        info!("Token validator shut down");
    }

    /// Loader status per issuer
    pub fn loader_status(&self) -> BTreeMap<String, LoaderStatus> {
        self.pipeline
            .issuers()
            .map(|v| (v.config().issuer().to_owned(), v.loader().status()))
            .collect()
    }

    /// Key material loader of `issuer`
    pub fn key_loader(&self, issuer: &str) -> Option<&Arc<dyn KeyMaterialLoader>> {
        self.pipeline.issuer(issuer).map(IssuerValidators::loader)
    }

    /// Stage latencies
    pub fn performance_monitor(&self) -> &Arc<PerformanceMonitor> {
        &self.monitor
    }

    /// Failure counts per kind
    pub fn security_events(&self) -> &Arc<SecurityEventCounter> {
        &self.events
    }

    /// Access token cache
    pub fn cache(&self) -> &TokenCache {
        self.pipeline.cache()
    }
}

/// Builder for [`TokenValidator`]
#[derive(Debug)]
pub struct TokenValidatorBuilder {
    issuers: Vec<(IssuerConfig, Option<Arc<dyn KeyMaterialLoader>>)>,
    parser: ParserConfig,
    cache: CacheConfig,
    clock_skew: Duration,
    monitor: Option<Arc<PerformanceMonitor>>,
    events: Option<Arc<SecurityEventCounter>>,
}

impl Default for TokenValidatorBuilder {
    fn default() -> Self {
        Self {
            issuers: Vec::new(),
            parser: ParserConfig::default(),
            cache: CacheConfig::default(),
            clock_skew: DEFAULT_CLOCK_SKEW,
            monitor: None,
            events: None,
        }
    }
}

impl TokenValidatorBuilder {
    /// Builder pre-filled from a settings file.
    ///
    /// # Errors
    ///
    /// Any issuer entry that does not form a valid [`IssuerConfig`].
    pub fn from_settings(settings: &ValidatorSettings) -> Result<Self, ConfigError> {
        let mut builder = Self::default()
            .parser_config(settings.parser.clone())
            .cache_config(settings.cache.clone())
            .clock_skew(settings.clock_skew())
            .performance_monitor(monitor_from_settings(&settings.monitor));
        for issuer in settings.issuer_configs()? {
            builder = builder.issuer(issuer);
        }
        Ok(builder)
    }

    /// Add an issuer; its key loader is created from its key source
    pub fn issuer(mut self, config: IssuerConfig) -> Self {
        self.issuers.push((config, None));
        self
    }

    /// Add an issuer whose keys come from `loader` instead of its key source
    pub fn issuer_with_loader(
        mut self,
        config: IssuerConfig,
        loader: Arc<dyn KeyMaterialLoader>,
    ) -> Self {
        self.issuers.push((config, Some(loader)));
        self
    }

    /// Token size limits
    pub fn parser_config(mut self, parser: ParserConfig) -> Self {
        self.parser = parser;
        self
    }

    /// Access token cache settings
    pub fn cache_config(mut self, cache: CacheConfig) -> Self {
        self.cache = cache;
        self
    }

    /// Tolerated clock skew for `nbf`
    pub fn clock_skew(mut self, skew: Duration) -> Self {
        self.clock_skew = skew;
        self
    }

    /// Share a performance monitor
    pub fn performance_monitor(mut self, monitor: Arc<PerformanceMonitor>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    /// Share a security event counter
    pub fn security_events(mut self, events: Arc<SecurityEventCounter>) -> Self {
        self.events = Some(events);
        self
    }

    /// Build the validator. Disabled issuers are skipped.
    ///
    /// # Errors
    ///
    /// - [`ConfigError::DuplicateIssuer`] if an issuer is configured twice
    /// - [`ConfigError::HttpClient`] if an HTTP loader cannot be created
    pub fn build(self) -> Result<TokenValidator, ConfigError> {
        let monitor = self
            .monitor
            .unwrap_or_else(|| Arc::new(PerformanceMonitor::default()));
        let events = self
            .events
            .unwrap_or_else(|| Arc::new(SecurityEventCounter::new()));

        let mut issuers = HashMap::new();
        for (config, loader) in self.issuers {
            if !config.is_enabled() {
                info!(issuer = %config.issuer(), "Skipping disabled issuer");
                continue;
            }
            if issuers.contains_key(config.issuer()) {
                return Err(ConfigError::DuplicateIssuer(config.issuer().to_owned()));
            }

            let loader = match loader {
                Some(loader) => loader,
                None => create_loader(&config, &monitor)?,
            };
            info!(issuer = %config.issuer(), "Configured issuer");
            issuers.insert(
                config.issuer().to_owned(),
                IssuerValidators::new(config, loader, Arc::clone(&monitor)),
            );
        }

        let pipeline = ValidationPipeline::new(
            TokenParser::new(self.parser, Arc::clone(&events)),
            issuers,
            TokenCache::new(&self.cache, Arc::clone(&monitor)),
            self.clock_skew,
            Arc::clone(&monitor),
            Arc::clone(&events),
        );

        Ok(TokenValidator {
            pipeline,
            monitor,
            events,
        })
    }
}

fn create_loader(
    config: &IssuerConfig,
    monitor: &Arc<PerformanceMonitor>,
) -> Result<Arc<dyn KeyMaterialLoader>, ConfigError> {
    let issuer = config.issuer();
    let monitor = Arc::clone(monitor);
    let loader: Arc<dyn KeyMaterialLoader> = match config.key_source() {
        KeySource::Inline(content) => {
            Arc::new(StaticKeyLoader::inline(issuer, content.clone(), monitor))
        }
        KeySource::File(path) => Arc::new(StaticKeyLoader::file(issuer, path.clone(), monitor)),
        KeySource::Http(http) => HttpKeyLoader::new(issuer, http.clone(), monitor)?,
    };
    Ok(loader)
}

fn monitor_from_settings(settings: &MonitorSettings) -> Arc<PerformanceMonitor> {
    let monitor = if settings.enabled {
        PerformanceMonitor::builder()
            .window_size(settings.window_size)
            .enable_all()
            .build()
    } else {
        PerformanceMonitor::disabled()
    };
    Arc::new(monitor)
}

#[cfg(test)]
mod tests {
    use super::*;

    const JWKS: &str = r#"{"keys":[]}"#;

    fn issuer(name: &str) -> IssuerConfig {
        IssuerConfig::builder()
            .issuer(name)
            .jwks_content(JWKS)
            .build()
            .unwrap()
    }

    #[test]
    fn test_duplicate_issuer_rejected() {
        let err = TokenValidator::builder()
            .issuer(issuer("https://a"))
            .issuer(issuer("https://a"))
            .build()
            .unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateIssuer(i) if i == "https://a"));
    }

    #[test]
    fn test_disabled_issuer_skipped() {
        let disabled = IssuerConfig::builder()
            .enabled(false)
            .jwks_content(JWKS)
            .build()
            .unwrap();
        let validator = TokenValidator::builder()
            .issuer(issuer("https://a"))
            .issuer(disabled)
            .build()
            .unwrap();

        let statuses = validator.loader_status();
        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses["https://a"], LoaderStatus::Undefined);
    }

    #[tokio::test]
    async fn test_initialize_loads_all_issuers() {
        let validator = TokenValidator::builder()
            .issuer(issuer("https://a"))
            .issuer(issuer("https://b"))
            .build()
            .unwrap();

        let statuses = validator.initialize().await;
        assert_eq!(statuses.len(), 2);
        assert!(statuses.values().all(|s| *s == LoaderStatus::Ok));
    }

    #[test]
    fn test_monitor_from_settings() {
        let disabled = monitor_from_settings(&MonitorSettings {
            enabled: false,
            window_size: 10,
        });
        assert!(!disabled.is_enabled(crate::monitor::MeasurementType::TokenParsing));

        let enabled = monitor_from_settings(&MonitorSettings::default());
        assert!(enabled.is_enabled(crate::monitor::MeasurementType::CompleteValidation));
    }
}
