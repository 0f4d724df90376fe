//! Claim validation
//!
//! Checks run in a fixed order: mandatory claims, `exp`, `nbf`, audience,
//! authorized party. All time checks use the single [`ValidationContext`]
//! captured for the call.

use crate::config::IssuerConfig;
use crate::context::ValidationContext;
use crate::error::{Result, ValidationError};
use crate::token::{TokenContent, TokenType};

/// Claim rules for one issuer and token type.
#[derive(Debug, Clone)]
pub struct ClaimsValidator {
    token_type: TokenType,
    mandatory: Vec<&'static str>,
    expected_audiences: Vec<String>,
    expected_client_ids: Vec<String>,
}

impl ClaimsValidator {
    /// Rules for `token_type` under `config`.
    ///
    /// Every token needs `iss` and `exp`. `sub` is required unless the issuer
    /// makes it optional; ID tokens always need `sub`, `aud` and `iat`.
    pub fn new(token_type: TokenType, config: &IssuerConfig) -> Self {
        let mut mandatory = vec!["iss", "exp"];
        match token_type {
            TokenType::Id => mandatory.extend(["sub", "aud", "iat"]),
            _ if !config.claim_sub_optional() => mandatory.push("sub"),
            _ => {}
        }
        if token_type == TokenType::Access && !config.expected_audiences().is_empty() {
            mandatory.push("aud");
        }

        Self {
            token_type,
            mandatory,
            expected_audiences: config.expected_audiences().to_vec(),
            expected_client_ids: config.expected_client_ids().to_vec(),
        }
    }

    /// Token type these rules apply to
    pub fn token_type(&self) -> TokenType {
        self.token_type
    }

    /// Validate `content` at the instant captured in `ctx`.
    ///
    /// # Errors
    ///
    /// The first failing check, in the order listed in the module docs.
    pub fn validate(&self, content: &TokenContent, ctx: &ValidationContext) -> Result<()> {
        if let Some(claim) = self.mandatory.iter().find(|c| !content.has_claim(c)) {
            return Err(ValidationError::missing_claim(*claim));
        }

        let expired_at = content
            .expiration()
            .ok_or_else(|| ValidationError::missing_claim("exp"))?;
        if ctx.is_expired(expired_at) {
            return Err(ValidationError::TokenExpired {
                expired_at,
                now: ctx.now_epoch_secs(),
            });
        }

        if let Some(not_before) = content.not_before()
            && ctx.is_before_not_before(not_before)
        {
            return Err(ValidationError::TokenNotYetValid {
                not_before,
                now: ctx.now_epoch_secs(),
                skew_secs: ctx.clock_skew().as_secs(),
            });
        }

        self.validate_audience(content)?;
        self.validate_authorized_party(content)
    }

    fn validate_audience(&self, content: &TokenContent) -> Result<()> {
        if self.expected_audiences.is_empty() {
            return Ok(());
        }
        let actual = content.audience();
        if actual.iter().any(|aud| self.expected_audiences.contains(aud)) {
            return Ok(());
        }
        Err(ValidationError::AudienceMismatch {
            actual,
            expected: self.expected_audiences.clone(),
        })
    }

    fn validate_authorized_party(&self, content: &TokenContent) -> Result<()> {
        if self.expected_client_ids.is_empty() {
            return Ok(());
        }

        match content.authorized_party() {
            Some(azp) if self.expected_client_ids.iter().any(|id| id == azp) => Ok(()),
            Some(azp) => Err(ValidationError::AzpMismatch {
                actual: azp.to_owned(),
                expected: self.expected_client_ids.clone(),
            }),
            // OIDC Core 2: an ID token may omit azp when it has a single
            // audience, which is then the client the token was issued to.
            None if self.token_type == TokenType::Id => {
                let audience = content.audience();
                if audience.len() == 1 && self.expected_client_ids.contains(&audience[0]) {
                    Ok(())
                } else {
                    Err(ValidationError::missing_claim("azp"))
                }
            }
            None => Err(ValidationError::missing_claim("azp")),
        }
    }
}
