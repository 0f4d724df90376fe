//! Error types for token validation, key loading and configuration.
//!
//! Every validation failure maps onto exactly one [`FailureKind`]. The kind is
//! what callers branch on and what the [`SecurityEventCounter`] aggregates;
//! the variant payloads exist for diagnostics only.
//!
//! [`SecurityEventCounter`]: crate::security_events::SecurityEventCounter

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// Result alias used by all validation entry points.
pub type Result<T, E = ValidationError> = std::result::Result<T, E>;

/// Classification of a validation failure.
///
/// The set is closed: counters are indexed by it, so adding a kind means
/// extending [`FailureKind::ALL`] as well.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FailureKind {
    /// Token string was blank
    TokenEmpty,
    /// Token string exceeded the configured byte limit
    TokenSizeExceeded,
    /// Token was not made of three dot-separated segments
    InvalidFormat,
    /// A segment could not be decoded
    FailedToDecode,
    /// A decoded segment exceeded the payload limit
    DecodedPartSizeExceeded,
    /// A required claim or header parameter was absent
    MissingClaim,
    /// Signature did not verify against the resolved key
    SignatureValidationFailed,
    /// Algorithm unknown to the verifier (including `none`)
    UnsupportedAlgorithm,
    /// Algorithm known but not allowed for the issuer or key
    AlgorithmRejected,
    /// No expected audience found in `aud`
    AudienceMismatch,
    /// `azp` did not name an expected client
    AzpMismatch,
    /// `exp` lies in the past
    TokenExpired,
    /// `nbf` lies in the future beyond the clock skew
    TokenNotYetValid,
    /// No key with the token's `kid` is currently visible
    KeyNotFound,
    /// No enabled issuer configuration matches `iss`
    NoIssuerConfig,
    /// The issuer asserted by a discovery document differs from configuration
    IssuerMismatch,
}

impl FailureKind {
    /// All kinds, in counter order.
    pub const ALL: [FailureKind; 16] = [
        FailureKind::TokenEmpty,
        FailureKind::TokenSizeExceeded,
        FailureKind::InvalidFormat,
        FailureKind::FailedToDecode,
        FailureKind::DecodedPartSizeExceeded,
        FailureKind::MissingClaim,
        FailureKind::SignatureValidationFailed,
        FailureKind::UnsupportedAlgorithm,
        FailureKind::AlgorithmRejected,
        FailureKind::AudienceMismatch,
        FailureKind::AzpMismatch,
        FailureKind::TokenExpired,
        FailureKind::TokenNotYetValid,
        FailureKind::KeyNotFound,
        FailureKind::NoIssuerConfig,
        FailureKind::IssuerMismatch,
    ];

    /// Stable snake_case label, used for log fields and metric labels.
    pub fn as_str(self) -> &'static str {
        match self {
            FailureKind::TokenEmpty => "token_empty",
            FailureKind::TokenSizeExceeded => "token_size_exceeded",
            FailureKind::InvalidFormat => "invalid_format",
            FailureKind::FailedToDecode => "failed_to_decode",
            FailureKind::DecodedPartSizeExceeded => "decoded_part_size_exceeded",
            FailureKind::MissingClaim => "missing_claim",
            FailureKind::SignatureValidationFailed => "signature_validation_failed",
            FailureKind::UnsupportedAlgorithm => "unsupported_algorithm",
            FailureKind::AlgorithmRejected => "algorithm_rejected",
            FailureKind::AudienceMismatch => "audience_mismatch",
            FailureKind::AzpMismatch => "azp_mismatch",
            FailureKind::TokenExpired => "token_expired",
            FailureKind::TokenNotYetValid => "token_not_yet_valid",
            FailureKind::KeyNotFound => "key_not_found",
            FailureKind::NoIssuerConfig => "no_issuer_config",
            FailureKind::IssuerMismatch => "issuer_mismatch",
        }
    }

    pub(crate) fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A token was rejected.
///
/// `Clone` because a single failed computation inside the token cache is
/// handed to every caller that was waiting on it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// Token string was blank
    #[error("Token is empty")]
    TokenEmpty,

    /// Token string exceeded the configured byte limit
    #[error("Token size {actual} bytes exceeds maximum of {max} bytes")]
    TokenSizeExceeded {
        /// Observed size in bytes
        actual: usize,
        /// Configured limit
        max: usize,
    },

    /// Token was not made of three dot-separated segments
    #[error("Invalid token format: {0}")]
    InvalidFormat(String),

    /// A segment could not be decoded
    #[error("Failed to decode token {part}: {reason}")]
    FailedToDecode {
        /// `header`, `payload` or `signature`
        part: &'static str,
        /// Decoder message
        reason: String,
    },

    /// A decoded segment exceeded the payload limit
    #[error("Decoded token {part} of {actual} bytes exceeds maximum of {max} bytes")]
    DecodedPartSizeExceeded {
        /// `header`, `payload` or `signature`
        part: &'static str,
        /// Decoded size in bytes
        actual: usize,
        /// Configured limit
        max: usize,
    },

    /// A required claim or header parameter was absent
    #[error("Missing required claim: {claim}")]
    MissingClaim {
        /// Claim name
        claim: String,
    },

    /// Signature did not verify against the resolved key
    #[error("Signature validation failed: {0}")]
    SignatureValidationFailed(String),

    /// Algorithm unknown to the verifier
    #[error("Unsupported algorithm: {algorithm}")]
    UnsupportedAlgorithm {
        /// Value of the `alg` header
        algorithm: String,
    },

    /// Algorithm known but not allowed
    #[error("Algorithm {algorithm} rejected: {reason}")]
    AlgorithmRejected {
        /// Value of the `alg` header
        algorithm: String,
        /// Why it was rejected
        reason: String,
    },

    /// No expected audience found in `aud`
    #[error("Audience mismatch: token audience {actual:?} does not contain any of {expected:?}")]
    AudienceMismatch {
        /// Audiences carried by the token
        actual: Vec<String>,
        /// Audiences accepted by the issuer configuration
        expected: Vec<String>,
    },

    /// `azp` did not name an expected client
    #[error("Authorized party '{actual}' is not one of {expected:?}")]
    AzpMismatch {
        /// Value of `azp`
        actual: String,
        /// Client ids accepted by the issuer configuration
        expected: Vec<String>,
    },

    /// `exp` lies in the past
    #[error("Token expired at {expired_at} (now {now})")]
    TokenExpired {
        /// `exp` in seconds since the epoch
        expired_at: i64,
        /// Captured validation time in seconds since the epoch
        now: i64,
    },

    /// `nbf` lies in the future beyond the clock skew
    #[error("Token not valid before {not_before} (now {now}, skew {skew_secs}s)")]
    TokenNotYetValid {
        /// `nbf` in seconds since the epoch
        not_before: i64,
        /// Captured validation time in seconds since the epoch
        now: i64,
        /// Tolerated clock skew
        skew_secs: u64,
    },

    /// No key with the token's `kid` is currently visible
    #[error("No key with id '{kid}' for issuer '{issuer}'")]
    KeyNotFound {
        /// Key id from the token header
        kid: String,
        /// Issuer whose key material was searched
        issuer: String,
    },

    /// No enabled issuer configuration matches `iss`
    #[error("No configuration for issuer '{issuer}'")]
    NoIssuerConfig {
        /// Value of `iss`
        issuer: String,
    },

    /// Issuer asserted by discovery differs from configuration
    #[error("Issuer mismatch: expected '{expected}', got '{actual}'")]
    IssuerMismatch {
        /// Configured issuer
        expected: String,
        /// Issuer found in the discovery document
        actual: String,
    },
}

impl ValidationError {
    /// The failure classification of this error.
    pub fn kind(&self) -> FailureKind {
        match self {
            ValidationError::TokenEmpty => FailureKind::TokenEmpty,
            ValidationError::TokenSizeExceeded { .. } => FailureKind::TokenSizeExceeded,
            ValidationError::InvalidFormat(_) => FailureKind::InvalidFormat,
            ValidationError::FailedToDecode { .. } => FailureKind::FailedToDecode,
            ValidationError::DecodedPartSizeExceeded { .. } => {
                FailureKind::DecodedPartSizeExceeded
            }
            ValidationError::MissingClaim { .. } => FailureKind::MissingClaim,
            ValidationError::SignatureValidationFailed(_) => FailureKind::SignatureValidationFailed,
            ValidationError::UnsupportedAlgorithm { .. } => FailureKind::UnsupportedAlgorithm,
            ValidationError::AlgorithmRejected { .. } => FailureKind::AlgorithmRejected,
            ValidationError::AudienceMismatch { .. } => FailureKind::AudienceMismatch,
            ValidationError::AzpMismatch { .. } => FailureKind::AzpMismatch,
            ValidationError::TokenExpired { .. } => FailureKind::TokenExpired,
            ValidationError::TokenNotYetValid { .. } => FailureKind::TokenNotYetValid,
            ValidationError::KeyNotFound { .. } => FailureKind::KeyNotFound,
            ValidationError::NoIssuerConfig { .. } => FailureKind::NoIssuerConfig,
            ValidationError::IssuerMismatch { .. } => FailureKind::IssuerMismatch,
        }
    }

    pub(crate) fn missing_claim(claim: impl Into<String>) -> Self {
        ValidationError::MissingClaim {
            claim: claim.into(),
        }
    }
}

/// Failures while resolving or refreshing key material.
#[derive(Debug, Clone, Error)]
pub enum KeyLoadError {
    /// Transport-level HTTP failure (connect, timeout, body read)
    #[error("HTTP request to {url} failed: {reason}")]
    Http {
        /// Requested URL
        url: String,
        /// Client error message
        reason: String,
    },

    /// Endpoint answered with an unexpected status
    #[error("{url} returned HTTP {status}")]
    Status {
        /// Requested URL
        url: String,
        /// Response status code
        status: u16,
    },

    /// `304 Not Modified` arrived but nothing was cached to reuse
    #[error("{url} returned 304 Not Modified without cached content")]
    NotModifiedWithoutCache {
        /// Requested URL
        url: String,
    },

    /// Response body exceeded the configured limit
    #[error("Response from {url} exceeds {max} bytes")]
    ResponseTooLarge {
        /// Requested URL
        url: String,
        /// Configured limit
        max: usize,
    },

    /// Key set document could not be parsed at all
    #[error("Invalid key set: {0}")]
    InvalidKeySet(String),

    /// Discovery document could not be parsed
    #[error("Invalid discovery document: {0}")]
    InvalidDiscoveryDocument(String),

    /// Discovery document asserted a different issuer
    #[error("Discovery issuer mismatch: expected '{expected}', got '{actual}'")]
    IssuerMismatch {
        /// Configured issuer
        expected: String,
        /// Issuer from the discovery document
        actual: String,
    },

    /// Key file could not be read
    #[error("Failed to read key file {path}: {reason}")]
    Io {
        /// File path
        path: PathBuf,
        /// I/O error message
        reason: String,
    },

    /// Loader was shut down while the operation was pending
    #[error("Operation cancelled")]
    Cancelled,
}

impl KeyLoadError {
    /// Whether repeating the same request may succeed.
    ///
    /// Transport failures, 5xx and 429 are transient; everything else
    /// needs a configuration or upstream change.
    pub fn is_retryable(&self) -> bool {
        match self {
            KeyLoadError::Http { .. } => true,
            KeyLoadError::Status { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }
}

/// Invalid configuration or settings.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Issuer is enabled but has no identifier
    #[error("Issuer identifier is required for enabled issuers")]
    MissingIssuerIdentifier,

    /// Zero or several key sources were configured
    #[error("Issuer '{issuer}' must configure exactly one key source, found {found}")]
    KeySourceCount {
        /// Issuer identifier (may be empty)
        issuer: String,
        /// Number of key sources configured
        found: usize,
    },

    /// A value is out of range or malformed
    #[error("Invalid value for {field}: {reason}")]
    InvalidValue {
        /// Setting name
        field: &'static str,
        /// What is wrong with it
        reason: String,
    },

    /// Two enabled issuers share an identifier
    #[error("Duplicate issuer configuration for '{0}'")]
    DuplicateIssuer(String),

    /// HTTP client could not be constructed
    #[error("Failed to create HTTP client: {0}")]
    HttpClient(String),

    /// Settings file does not exist
    #[error("Configuration file not found: {0}")]
    FileNotFound(PathBuf),

    /// Settings file has an unknown extension
    #[error("Unsupported configuration file format. Use .toml, .yaml, .yml, or .json")]
    UnsupportedFormat,

    /// Settings could not be parsed
    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] config::ConfigError),
}
