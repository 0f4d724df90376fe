//! Issuer configuration and settings files
//!
//! [`IssuerConfig`] is the validated, immutable per-issuer configuration the
//! validator is built from. It can be assembled programmatically with
//! [`IssuerConfig::builder`] or deserialized as [`ValidatorSettings`] from a
//! TOML, YAML or JSON file with `TOKENGUARD__` environment overrides.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use jsonwebtoken::Algorithm;
use serde::{Deserialize, Serialize};
use url::{Host, Url};

use crate::context::DEFAULT_CLOCK_SKEW;
use crate::error::ConfigError;
use crate::keys::KeyType;
use crate::monitor::DEFAULT_WINDOW_SIZE;
use crate::retry::RetryConfig;
use crate::token::{ClaimMapper, ClaimMappers, MapperKind, ParserConfig};

/// Default interval between background key refreshes.
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(600);
/// Default time a retired key set stays usable.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(300);
/// Default number of retired key sets kept.
pub const DEFAULT_MAX_RETIRED_KEY_SETS: usize = 3;
/// Default HTTP request timeout.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
/// Default maximum size of key set and discovery responses (256 KiB).
pub const DEFAULT_MAX_RESPONSE_SIZE: usize = 256 * 1024;
/// Default number of validated access tokens cached.
pub const DEFAULT_CACHE_MAX_SIZE: u64 = 1000;

/// Algorithms accepted when an issuer configures none.
pub const DEFAULT_ALGORITHMS: [Algorithm; 8] = [
    Algorithm::RS256,
    Algorithm::RS384,
    Algorithm::RS512,
    Algorithm::PS256,
    Algorithm::PS384,
    Algorithm::PS512,
    Algorithm::ES256,
    Algorithm::ES384,
];

/// Where an HTTP loader finds the key set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyEndpoint {
    /// Key set URL
    Jwks(Url),
    /// Discovery document URL supplying `jwks_uri`
    Discovery(Url),
}

impl KeyEndpoint {
    /// Configured URL
    pub fn url(&self) -> &Url {
        match self {
            KeyEndpoint::Jwks(url) | KeyEndpoint::Discovery(url) => url,
        }
    }
}

/// Remote key set settings.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpLoaderConfig {
    /// Key set or discovery location
    pub endpoint: KeyEndpoint,
    /// Interval between background refreshes; zero disables refreshing
    pub refresh_interval: Duration,
    /// Per-request timeout
    pub request_timeout: Duration,
    /// Maximum response body size
    pub max_response_size: usize,
    /// How long a replaced key set remains usable; zero disables
    pub grace_period: Duration,
    /// Maximum retired key sets kept
    pub max_retired_key_sets: usize,
    /// Retry policy per fetch
    pub retry: RetryConfig,
}

impl HttpLoaderConfig {
    /// Fetch the key set from `url` directly
    pub fn jwks(url: Url) -> Self {
        Self::with_endpoint(KeyEndpoint::Jwks(url))
    }

    /// Resolve the key set through the discovery document at `url`
    pub fn discovery(url: Url) -> Self {
        Self::with_endpoint(KeyEndpoint::Discovery(url))
    }

    fn with_endpoint(endpoint: KeyEndpoint) -> Self {
        Self {
            endpoint,
            refresh_interval: DEFAULT_REFRESH_INTERVAL,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            max_response_size: DEFAULT_MAX_RESPONSE_SIZE,
            grace_period: DEFAULT_GRACE_PERIOD,
            max_retired_key_sets: DEFAULT_MAX_RETIRED_KEY_SETS,
            retry: RetryConfig::default(),
        }
    }

    /// Set the refresh interval
    pub fn refresh_interval(mut self, interval: Duration) -> Self {
        self.refresh_interval = interval;
        self
    }

    /// Set the request timeout
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Set the response size limit
    pub fn max_response_size(mut self, max: usize) -> Self {
        self.max_response_size = max;
        self
    }

    /// Set the rotation grace period
    pub fn grace_period(mut self, grace: Duration) -> Self {
        self.grace_period = grace;
        self
    }

    /// Set the retired key set cap
    pub fn max_retired_key_sets(mut self, max: usize) -> Self {
        self.max_retired_key_sets = max;
        self
    }

    /// Set the retry policy
    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    fn validate(&self) -> Result<(), ConfigError> {
        require_secure_url(self.endpoint.url())?;
        if self.request_timeout.is_zero() {
            return Err(ConfigError::InvalidValue {
                field: "request_timeout",
                reason: "must be greater than zero".into(),
            });
        }
        if self.max_response_size == 0 {
            return Err(ConfigError::InvalidValue {
                field: "max_response_size",
                reason: "must be greater than zero".into(),
            });
        }
        Ok(())
    }
}

/// Key URLs must use https, except for loopback hosts.
fn require_secure_url(url: &Url) -> Result<(), ConfigError> {
    let loopback = match url.host() {
        Some(Host::Domain(domain)) => domain.eq_ignore_ascii_case("localhost"),
        Some(Host::Ipv4(ip)) => ip.is_loopback(),
        Some(Host::Ipv6(ip)) => ip.is_loopback(),
        None => false,
    };
    match url.scheme() {
        "https" => Ok(()),
        "http" if loopback => Ok(()),
        scheme => Err(ConfigError::InvalidValue {
            field: "url",
            reason: format!("{url} uses {scheme}; https is required for non-loopback hosts"),
        }),
    }
}

/// Source of an issuer's verification keys.
#[derive(Debug, Clone, PartialEq)]
pub enum KeySource {
    /// Key set document held in memory
    Inline(String),
    /// Key set document on disk
    File(PathBuf),
    /// Key set fetched over HTTP
    Http(HttpLoaderConfig),
}

/// Validated per-issuer configuration.
#[derive(Debug, Clone)]
pub struct IssuerConfig {
    issuer: String,
    enabled: bool,
    expected_audiences: Vec<String>,
    expected_client_ids: Vec<String>,
    algorithms: Vec<Algorithm>,
    claim_mappers: ClaimMappers,
    claim_sub_optional: bool,
    key_source: KeySource,
}

impl IssuerConfig {
    /// Start building a configuration
    pub fn builder() -> IssuerConfigBuilder {
        IssuerConfigBuilder::default()
    }

    /// Issuer identifier, matched exactly against `iss`
    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    /// Whether tokens from this issuer are accepted
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Accepted audiences; empty accepts any
    pub fn expected_audiences(&self) -> &[String] {
        &self.expected_audiences
    }

    /// Accepted `azp` values; empty skips the check
    pub fn expected_client_ids(&self) -> &[String] {
        &self.expected_client_ids
    }

    /// Signature algorithm allow-list
    pub fn algorithms(&self) -> &[Algorithm] {
        &self.algorithms
    }

    /// Claim mapper resolution
    pub fn claim_mappers(&self) -> &ClaimMappers {
        &self.claim_mappers
    }

    /// Whether access tokens may omit `sub`
    pub fn claim_sub_optional(&self) -> bool {
        self.claim_sub_optional
    }

    /// Key source
    pub fn key_source(&self) -> &KeySource {
        &self.key_source
    }
}

/// Builder for [`IssuerConfig`].
#[derive(Debug, Default)]
pub struct IssuerConfigBuilder {
    issuer: Option<String>,
    disabled: bool,
    expected_audiences: Vec<String>,
    expected_client_ids: Vec<String>,
    algorithms: Option<Vec<Algorithm>>,
    claim_mappers: HashMap<String, Arc<dyn ClaimMapper>>,
    claim_sub_optional: bool,
    jwks_content: Option<String>,
    jwks_file: Option<PathBuf>,
    http: Option<HttpLoaderConfig>,
}

impl IssuerConfigBuilder {
    /// Issuer identifier
    pub fn issuer(mut self, issuer: impl Into<String>) -> Self {
        self.issuer = Some(issuer.into());
        self
    }

    /// Enable or disable the issuer
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.disabled = !enabled;
        self
    }

    /// Add an accepted audience
    pub fn expected_audience(mut self, audience: impl Into<String>) -> Self {
        self.expected_audiences.push(audience.into());
        self
    }

    /// Add an accepted authorized party
    pub fn expected_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.expected_client_ids.push(client_id.into());
        self
    }

    /// Replace the algorithm allow-list
    pub fn algorithms(mut self, algorithms: impl IntoIterator<Item = Algorithm>) -> Self {
        self.algorithms = Some(algorithms.into_iter().collect());
        self
    }

    /// Override the mapper for claim `name`
    pub fn claim_mapper(mut self, name: impl Into<String>, mapper: Arc<dyn ClaimMapper>) -> Self {
        self.claim_mappers.insert(name.into(), mapper);
        self
    }

    /// Accept access tokens without `sub`
    pub fn claim_sub_optional(mut self, optional: bool) -> Self {
        self.claim_sub_optional = optional;
        self
    }

    /// Use an in-memory key set document
    pub fn jwks_content(mut self, content: impl Into<String>) -> Self {
        self.jwks_content = Some(content.into());
        self
    }

    /// Read the key set document from `path`
    pub fn jwks_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.jwks_file = Some(path.into());
        self
    }

    /// Fetch the key set over HTTP
    pub fn http_loader(mut self, config: HttpLoaderConfig) -> Self {
        self.http = Some(config);
        self
    }

    /// Validate and build.
    ///
    /// # Errors
    ///
    /// - [`ConfigError::KeySourceCount`] unless exactly one key source is set
    /// - [`ConfigError::MissingIssuerIdentifier`] if an enabled issuer has no identifier
    /// - [`ConfigError::InvalidValue`] for an empty or symmetric algorithm list,
    ///   or an insecure or malformed HTTP loader configuration
    pub fn build(self) -> Result<IssuerConfig, ConfigError> {
        let issuer = self.issuer.unwrap_or_default();

        let mut sources = Vec::with_capacity(1);
        if let Some(content) = self.jwks_content {
            sources.push(KeySource::Inline(content));
        }
        if let Some(path) = self.jwks_file {
            sources.push(KeySource::File(path));
        }
        if let Some(http) = self.http {
            sources.push(KeySource::Http(http));
        }
        let found = sources.len();
        let key_source = match sources.pop() {
            Some(source) if found == 1 => source,
            _ => return Err(ConfigError::KeySourceCount { issuer, found }),
        };

        if !self.disabled && issuer.trim().is_empty() {
            return Err(ConfigError::MissingIssuerIdentifier);
        }

        let algorithms = self
            .algorithms
            .unwrap_or_else(|| DEFAULT_ALGORITHMS.to_vec());
        if algorithms.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "algorithms",
                reason: "at least one algorithm is required".into(),
            });
        }
        if let Some(symmetric) = algorithms
            .iter()
            .find(|alg| KeyType::for_algorithm(**alg).is_none())
        {
            return Err(ConfigError::InvalidValue {
                field: "algorithms",
                reason: format!("{symmetric:?} cannot be verified with a public key"),
            });
        }

        if let KeySource::Http(http) = &key_source {
            http.validate()?;
        }

        Ok(IssuerConfig {
            issuer,
            enabled: !self.disabled,
            expected_audiences: self.expected_audiences,
            expected_client_ids: self.expected_client_ids,
            algorithms,
            claim_mappers: ClaimMappers::new(self.claim_mappers),
            claim_sub_optional: self.claim_sub_optional,
            key_source,
        })
    }
}

/// Token cache settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum cached access tokens; zero disables caching
    pub max_size: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_size: DEFAULT_CACHE_MAX_SIZE,
        }
    }
}

/// Performance monitor settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorSettings {
    /// Record measurements at all
    pub enabled: bool,
    /// Samples kept per measurement
    pub window_size: usize,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            window_size: DEFAULT_WINDOW_SIZE,
        }
    }
}

/// One issuer in a settings file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IssuerSettings {
    /// Issuer identifier
    pub issuer: Option<String>,
    /// Set to `false` to reject the issuer's tokens
    pub enabled: Option<bool>,
    /// Accepted audiences
    pub audiences: Vec<String>,
    /// Accepted authorized parties
    pub client_ids: Vec<String>,
    /// Algorithm names; empty means the defaults
    pub algorithms: Vec<String>,
    /// Accept access tokens without `sub`
    pub claim_sub_optional: bool,
    /// Mapper overrides by claim name
    pub claim_mappers: HashMap<String, MapperKind>,
    /// Inline key set document
    pub jwks_content: Option<String>,
    /// Key set file
    pub jwks_file: Option<PathBuf>,
    /// Key set URL
    pub jwks_url: Option<String>,
    /// Discovery document URL
    pub discovery_url: Option<String>,
    /// Background refresh interval in seconds
    pub refresh_interval_secs: Option<u64>,
    /// Rotation grace period in seconds
    pub grace_period_secs: Option<u64>,
    /// Retired key sets kept
    pub max_retired_key_sets: Option<usize>,
    /// HTTP request timeout in seconds
    pub request_timeout_secs: Option<u64>,
    /// HTTP response size limit in bytes
    pub max_response_size: Option<usize>,
    /// Fetch attempts per refresh
    pub retry_max_attempts: Option<u32>,
}

impl IssuerSettings {
    /// Convert into a validated [`IssuerConfig`].
    ///
    /// # Errors
    ///
    /// As [`IssuerConfigBuilder::build`], plus [`ConfigError::InvalidValue`]
    /// for unknown algorithm names or unparsable URLs.
    pub fn into_issuer_config(self) -> Result<IssuerConfig, ConfigError> {
        let mut builder = IssuerConfig::builder()
            .enabled(self.enabled.unwrap_or(true))
            .claim_sub_optional(self.claim_sub_optional);
        if let Some(issuer) = self.issuer {
            builder = builder.issuer(issuer);
        }
        for audience in self.audiences {
            builder = builder.expected_audience(audience);
        }
        for client_id in self.client_ids {
            builder = builder.expected_client_id(client_id);
        }
        if !self.algorithms.is_empty() {
            let algorithms = self
                .algorithms
                .iter()
                .map(|name| {
                    Algorithm::from_str(name).map_err(|_| ConfigError::InvalidValue {
                        field: "algorithms",
                        reason: format!("unknown algorithm {name}"),
                    })
                })
                .collect::<Result<Vec<_>, _>>()?;
            builder = builder.algorithms(algorithms);
        }
        for (claim, kind) in self.claim_mappers {
            builder = builder.claim_mapper(claim, kind.into_mapper());
        }
        if let Some(content) = self.jwks_content {
            builder = builder.jwks_content(content);
        }
        if let Some(path) = self.jwks_file {
            builder = builder.jwks_file(path);
        }

        let endpoint = match (self.jwks_url, self.discovery_url) {
            (Some(jwks), None) => Some(KeyEndpoint::Jwks(parse_url("jwks_url", &jwks)?)),
            (None, Some(discovery)) => Some(KeyEndpoint::Discovery(parse_url(
                "discovery_url",
                &discovery,
            )?)),
            (None, None) => None,
            (Some(_), Some(_)) => {
                return Err(ConfigError::InvalidValue {
                    field: "jwks_url",
                    reason: "jwks_url and discovery_url are mutually exclusive".into(),
                });
            }
        };
        if let Some(endpoint) = endpoint {
            let mut http = HttpLoaderConfig::with_endpoint(endpoint);
            if let Some(secs) = self.refresh_interval_secs {
                http.refresh_interval = Duration::from_secs(secs);
            }
            if let Some(secs) = self.grace_period_secs {
                http.grace_period = Duration::from_secs(secs);
            }
            if let Some(max) = self.max_retired_key_sets {
                http.max_retired_key_sets = max;
            }
            if let Some(secs) = self.request_timeout_secs {
                http.request_timeout = Duration::from_secs(secs);
            }
            if let Some(max) = self.max_response_size {
                http.max_response_size = max;
            }
            if let Some(attempts) = self.retry_max_attempts {
                http.retry.max_attempts = attempts;
            }
            builder = builder.http_loader(http);
        }

        builder.build()
    }
}

fn parse_url(field: &'static str, raw: &str) -> Result<Url, ConfigError> {
    Url::parse(raw).map_err(|e| ConfigError::InvalidValue {
        field,
        reason: format!("{raw}: {e}"),
    })
}

/// Validator settings as found in a configuration file.
///
/// # Example
///
/// ```toml
/// clock_skew_secs = 30
///
/// [cache]
/// max_size = 5000
///
/// [[issuers]]
/// issuer = "https://idp.example.com/realms/main"
/// audiences = ["orders-api"]
/// discovery_url = "https://idp.example.com/realms/main/.well-known/openid-configuration"
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidatorSettings {
    /// Token size limits
    pub parser: ParserConfig,
    /// Access token cache
    pub cache: CacheConfig,
    /// Performance monitor
    pub monitor: MonitorSettings,
    /// Tolerated clock skew for `nbf`, in seconds
    pub clock_skew_secs: u64,
    /// Issuers
    pub issuers: Vec<IssuerSettings>,
}

impl Default for ValidatorSettings {
    fn default() -> Self {
        Self {
            parser: ParserConfig::default(),
            cache: CacheConfig::default(),
            monitor: MonitorSettings::default(),
            clock_skew_secs: DEFAULT_CLOCK_SKEW.as_secs(),
            issuers: Vec::new(),
        }
    }
}

impl ValidatorSettings {
    /// Load settings from a file, with environment overrides.
    ///
    /// The format follows the extension (`.toml`, `.yaml`/`.yml`, `.json`).
    /// Variables prefixed `TOKENGUARD__` override file values, using `__` to
    /// separate nested keys (e.g. `TOKENGUARD__CACHE__MAX_SIZE=0`).
    ///
    /// # Errors
    ///
    /// - [`ConfigError::FileNotFound`] if `path` does not exist
    /// - [`ConfigError::UnsupportedFormat`] for other extensions
    /// - [`ConfigError::Parse`] if the content does not deserialize
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Self::from_file_with_prefix(path, "TOKENGUARD")
    }

    /// Like [`from_file`](Self::from_file) with a custom environment prefix.
    ///
    /// # Errors
    ///
    /// As [`from_file`](Self::from_file).
    pub fn from_file_with_prefix(
        path: impl AsRef<Path>,
        env_prefix: &str,
    ) -> Result<Self, ConfigError> {
        use config::{Config, File, FileFormat};

        let path = path.as_ref();
        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.to_path_buf()));
        }

        let format = match path.extension().and_then(|s| s.to_str()) {
            Some("toml") => FileFormat::Toml,
            Some("yaml") | Some("yml") => FileFormat::Yaml,
            Some("json") => FileFormat::Json,
            _ => return Err(ConfigError::UnsupportedFormat),
        };

        let config = Config::builder()
            .add_source(File::new(
                path.to_str().ok_or(ConfigError::UnsupportedFormat)?,
                format,
            ))
            .add_source(
                config::Environment::with_prefix(env_prefix)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(config.try_deserialize()?)
    }

    /// Tolerated clock skew
    pub fn clock_skew(&self) -> Duration {
        Duration::from_secs(self.clock_skew_secs)
    }

    /// Convert every issuer entry.
    ///
    /// # Errors
    ///
    /// The first [`IssuerSettings::into_issuer_config`] failure.
    pub fn issuer_configs(&self) -> Result<Vec<IssuerConfig>, ConfigError> {
        self.issuers
            .iter()
            .cloned()
            .map(IssuerSettings::into_issuer_config)
            .collect()
    }
}
