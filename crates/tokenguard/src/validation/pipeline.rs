//! Validation pipelines for access, ID and refresh tokens
//!
//! The access token path is the hot one:
//!
//! 1. parse
//! 2. extract `iss`
//! 3. cache lookup keyed by the raw token; a hit is served only while its
//!    signing key is still in the issuer's key set
//! 4. on a miss: resolve the issuer, validate the header, verify the
//!    signature, build the typed token and validate its claims
//! 5. on a miss: cache the result until the token expires
//!
//! Every stage is timed in the [`PerformanceMonitor`]. Every failure is
//! counted in the [`SecurityEventCounter`]; parse failures are counted by the
//! parser itself.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use super::cache::TokenCache;
use super::claims::ClaimsValidator;
use super::header::HeaderValidator;
use super::signature::SignatureValidator;
use crate::config::IssuerConfig;
use crate::context::ValidationContext;
use crate::error::{Result, ValidationError};
use crate::keys::KeyMaterialLoader;
use crate::monitor::{MeasurementType, PerformanceMonitor};
use crate::security_events::SecurityEventCounter;
use crate::token::{
    AccessTokenContent, DecodedToken, IdTokenContent, RefreshTokenContent, TokenContent,
    TokenParser, TokenType,
};

/// Everything needed to validate tokens of one issuer.
#[derive(Debug)]
pub struct IssuerValidators {
    config: Arc<IssuerConfig>,
    loader: Arc<dyn KeyMaterialLoader>,
    header: HeaderValidator,
    signature: SignatureValidator,
    access_claims: ClaimsValidator,
    id_claims: ClaimsValidator,
}

impl IssuerValidators {
    /// Validators for `config`, verifying against keys from `loader`
    pub fn new(
        config: IssuerConfig,
        loader: Arc<dyn KeyMaterialLoader>,
        monitor: Arc<PerformanceMonitor>,
    ) -> Self {
        Self {
            header: HeaderValidator::new(config.algorithms()),
            signature: SignatureValidator::new(config.issuer(), Arc::clone(&loader), monitor),
            access_claims: ClaimsValidator::new(TokenType::Access, &config),
            id_claims: ClaimsValidator::new(TokenType::Id, &config),
            config: Arc::new(config),
            loader,
        }
    }

    /// Issuer configuration
    pub fn config(&self) -> &IssuerConfig {
        &self.config
    }

    /// Key material loader
    pub fn loader(&self) -> &Arc<dyn KeyMaterialLoader> {
        &self.loader
    }

    fn claims(&self, token_type: TokenType) -> &ClaimsValidator {
        match token_type {
            TokenType::Id => &self.id_claims,
            _ => &self.access_claims,
        }
    }
}

/// Shared state of the three pipelines.
#[derive(Debug)]
pub struct ValidationPipeline {
    parser: TokenParser,
    issuers: HashMap<String, IssuerValidators>,
    cache: TokenCache,
    clock_skew: Duration,
    monitor: Arc<PerformanceMonitor>,
    events: Arc<SecurityEventCounter>,
}

impl ValidationPipeline {
    /// Assemble a pipeline from its parts
    pub fn new(
        parser: TokenParser,
        issuers: HashMap<String, IssuerValidators>,
        cache: TokenCache,
        clock_skew: Duration,
        monitor: Arc<PerformanceMonitor>,
        events: Arc<SecurityEventCounter>,
    ) -> Self {
        Self {
            parser,
            issuers,
            cache,
            clock_skew,
            monitor,
            events,
        }
    }

    /// Validators of every enabled issuer
    pub fn issuers(&self) -> impl Iterator<Item = &IssuerValidators> {
        self.issuers.values()
    }

    /// Validators for `issuer`
    pub fn issuer(&self, issuer: &str) -> Option<&IssuerValidators> {
        self.issuers.get(issuer)
    }

    /// Access token cache
    pub fn cache(&self) -> &TokenCache {
        &self.cache
    }

    /// Validate an access token.
    ///
    /// # Errors
    ///
    /// The first failing stage's [`ValidationError`].
    pub async fn validate_access_token(&self, raw: &str) -> Result<AccessTokenContent> {
        let started = Instant::now();
        let token = self
            .monitor
            .measure(MeasurementType::TokenParsing, || self.parser.parse(raw))?;

        let result = match self.extract_issuer(&token) {
            Ok(issuer) => {
                self.cache
                    .get_or_validate(
                        raw,
                        || self.key_visible(&issuer, &token),
                        self.validate_access_uncached(&issuer, &token),
                    )
                    .await
            }
            Err(e) => Err(e),
        };

        self.monitor
            .record_since(MeasurementType::CompleteValidation, started);
        result.inspect_err(|e| self.reject(TokenType::Access, e))
    }

    /// Validate an ID token. ID tokens are never cached.
    ///
    /// # Errors
    ///
    /// The first failing stage's [`ValidationError`].
    pub async fn validate_id_token(&self, raw: &str) -> Result<IdTokenContent> {
        let started = Instant::now();
        let token = self
            .monitor
            .measure(MeasurementType::TokenParsing, || self.parser.parse(raw))?;

        let result = match self.extract_issuer(&token) {
            Ok(issuer) => self
                .validate_signed(TokenType::Id, &issuer, &token)
                .await
                .map(IdTokenContent::new),
            Err(e) => Err(e),
        };

        self.monitor
            .record_since(MeasurementType::CompleteValidation, started);
        result.inspect_err(|e| self.reject(TokenType::Id, e))
    }

    /// Accept a refresh token.
    ///
    /// Refresh tokens are frequently opaque. Only the blank and size checks
    /// can fail; a token that does not parse as a JWT yields empty claims.
    ///
    /// # Errors
    ///
    /// [`ValidationError::TokenEmpty`] or [`ValidationError::TokenSizeExceeded`].
    pub fn validate_refresh_token(&self, raw: &str) -> Result<RefreshTokenContent> {
        self.parser
            .pre_validate(raw)
            .inspect_err(|e| self.reject(TokenType::Refresh, e))?;

        let decoded = self
            .monitor
            .measure(MeasurementType::TokenParsing, || self.parser.parse_opaque(raw));
        if decoded.is_none() {
            debug!("Refresh token is opaque");
        }
        Ok(RefreshTokenContent::new(raw, decoded))
    }

    fn extract_issuer(&self, token: &DecodedToken) -> Result<String> {
        self.monitor
            .measure(MeasurementType::IssuerExtraction, || {
                token.issuer().map(str::to_owned)
            })
            .ok_or_else(|| ValidationError::missing_claim("iss"))
    }

    /// Whether the key that signed `token` is still served by its issuer.
    /// A snapshot read; no cryptography.
    fn key_visible(&self, issuer: &str, token: &DecodedToken) -> bool {
        match (self.issuers.get(issuer), token.key_id()) {
            (Some(validators), Some(kid)) => validators.loader.key_info(kid).is_some(),
            _ => false,
        }
    }

    async fn validate_access_uncached(
        &self,
        issuer: &str,
        token: &DecodedToken,
    ) -> Result<AccessTokenContent> {
        self.validate_signed(TokenType::Access, issuer, token)
            .await
            .map(AccessTokenContent::new)
    }

    async fn validate_signed(
        &self,
        token_type: TokenType,
        issuer: &str,
        token: &DecodedToken,
    ) -> Result<TokenContent> {
        let validators =
            self.issuers
                .get(issuer)
                .ok_or_else(|| ValidationError::NoIssuerConfig {
                    issuer: issuer.to_owned(),
                })?;

        let header = self
            .monitor
            .measure(MeasurementType::HeaderValidation, || {
                validators.header.validate(token)
            })?;

        validators.signature.validate(token, &header).await?;

        let content = self.monitor.measure(MeasurementType::TokenBuilding, || {
            TokenContent::build(token_type, token, validators.config.claim_mappers())
        });

        let ctx = ValidationContext::now(self.clock_skew);
        self.monitor.measure(MeasurementType::ClaimsValidation, || {
            validators.claims(token_type).validate(&content, &ctx)
        })?;

        debug!(
            token_type = %token_type,
            issuer,
            subject = content.subject().unwrap_or_default(),
            "Token validated"
        );
        Ok(content)
    }

    fn reject(&self, token_type: TokenType, error: &ValidationError) {
        warn!(
            token_type = %token_type,
            kind = %error.kind(),
            error = %error,
            "Token rejected"
        );
        self.events.increment(error.kind());
    }
}
