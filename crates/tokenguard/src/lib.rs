//! # tokenguard - Bearer Token Validation
//!
//! Validates JWT access, ID and refresh tokens issued by one or more OAuth 2.0 /
//! OpenID Connect identity providers, at high request volume.
//!
//! ## Design Principles
//!
//! - **Never trust the input**: size and structure limits apply before any
//!   decoding or allocation proportional to the token
//! - **Cache before crypto**: a repeated access token is answered from a
//!   single-flight cache without key resolution or signature verification
//! - **Lock-free reads**: key lookups, loader status and monitor reads never
//!   wait on a writer
//! - **Graceful rotation**: retired keys stay valid for a grace period
//!
//! ## Architecture
//!
//! - [`token`] - Parser, claim mappers and typed token content
//! - [`validation`] - Header, signature and claim validators, the token cache
//!   and the [`TokenValidator`] facade
//! - [`keys`] - Key material loaders (inline, file, HTTP with ETag revalidation
//!   and background refresh)
//! - [`monitor`] - Striped rolling-window latency monitor
//! - [`retry`] - Exponential backoff for key fetches
//! - [`config`] - Issuer configuration and settings files
//! - [`security_events`] - Failure counters per kind
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use tokenguard::{HttpLoaderConfig, IssuerConfig, TokenValidator};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let issuer = IssuerConfig::builder()
//!     .issuer("https://idp.example.com/realms/main")
//!     .expected_audience("orders-api")
//!     .http_loader(
//!         HttpLoaderConfig::discovery(
//!             "https://idp.example.com/realms/main/.well-known/openid-configuration".parse()?,
//!         )
//!         .refresh_interval(Duration::from_secs(300)),
//!     )
//!     .build()?;
//!
//! let validator = TokenValidator::builder().issuer(issuer).build()?;
//! validator.initialize().await;
//!
//! let token = validator.validate_access_token("eyJ...").await?;
//! if token.has_scope("orders:write") {
//!     println!("{:?} may place orders", token.subject());
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Feature Flags
//!
//! - `metrics` - Export cache, rotation and failure counters through the
//!   `metrics` facade

pub mod config;
pub mod context;
pub mod error;
pub mod keys;
pub mod monitor;
pub mod retry;
pub mod security_events;
pub mod token;
pub mod validation;

#[doc(inline)]
pub use config::{
    CacheConfig, HttpLoaderConfig, IssuerConfig, IssuerConfigBuilder, KeyEndpoint, KeySource,
    ValidatorSettings,
};
#[doc(inline)]
pub use context::ValidationContext;
#[doc(inline)]
pub use error::{ConfigError, FailureKind, KeyLoadError, Result, ValidationError};
#[doc(inline)]
pub use keys::{HttpKeyLoader, KeyMaterialLoader, LoaderStatus, StaticKeyLoader};
#[doc(inline)]
pub use monitor::{MeasurementType, PerformanceMonitor};
#[doc(inline)]
pub use retry::{RetryConfig, RetryStrategy};
#[doc(inline)]
pub use security_events::SecurityEventCounter;
#[doc(inline)]
pub use token::{
    AccessTokenContent, ClaimMapper, IdTokenContent, ParserConfig, RefreshTokenContent,
    TokenType,
};
#[doc(inline)]
pub use validation::{TokenValidator, TokenValidatorBuilder};
