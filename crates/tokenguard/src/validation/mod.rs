//! Token validation pipelines
//!
//! - [`header`] - algorithm allow-list and key id
//! - [`signature`] - key resolution and signature verification
//! - [`claims`] - mandatory claims, lifetime, audience, authorized party
//! - [`cache`] - single-flight access token cache
//! - [`pipeline`] - stage orchestration per token type
//! - [`validator`] - the [`TokenValidator`] facade

pub mod cache;
pub mod claims;
pub mod header;
pub mod pipeline;
pub mod signature;
pub mod validator;

pub use cache::TokenCache;
pub use claims::ClaimsValidator;
pub use header::{HeaderValidator, ValidatedHeader};
pub use pipeline::{IssuerValidators, ValidationPipeline};
pub use signature::SignatureValidator;
pub use validator::{TokenValidator, TokenValidatorBuilder};
