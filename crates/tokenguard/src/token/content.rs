//! Validated token content
//!
//! Built from a [`DecodedToken`] after signature verification. Access and ID
//! token content share an `Arc` so cache hits hand out cheap clones.

use std::collections::BTreeMap;
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

use serde_json::{Map, Value};

use super::claims::{ClaimMappers, ClaimValue};
use super::parser::DecodedToken;

/// Kind of bearer token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TokenType {
    /// OAuth 2.0 access token
    Access,
    /// OpenID Connect ID token
    Id,
    /// OAuth 2.0 refresh token
    Refresh,
}

impl TokenType {
    /// Lowercase label
    pub fn as_str(self) -> &'static str {
        match self {
            TokenType::Access => "access_token",
            TokenType::Id => "id_token",
            TokenType::Refresh => "refresh_token",
        }
    }
}

impl fmt::Display for TokenType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Mapped claims of a signed token.
#[derive(Clone, PartialEq)]
pub struct TokenContent {
    token_type: TokenType,
    raw: String,
    claims: Map<String, Value>,
    mapped: BTreeMap<String, ClaimValue>,
}

// Manual Debug impl to keep the raw token out of logs
impl fmt::Debug for TokenContent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenContent")
            .field("token_type", &self.token_type)
            .field("raw", &"[REDACTED]")
            .field("issuer", &self.issuer())
            .field("subject", &self.subject())
            .field("claims", &self.mapped.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl TokenContent {
    /// Run every claim of `decoded` through `mappers`
    pub fn build(token_type: TokenType, decoded: &DecodedToken, mappers: &ClaimMappers) -> Self {
        let claims = decoded.body().clone();
        let mapped = claims
            .keys()
            .map(|name| (name.clone(), mappers.map(&claims, name)))
            .collect();
        Self {
            token_type,
            raw: decoded.raw().to_owned(),
            claims,
            mapped,
        }
    }

    /// Token kind
    pub fn token_type(&self) -> TokenType {
        self.token_type
    }

    /// Original compact token
    pub fn raw_token(&self) -> &str {
        &self.raw
    }

    /// Unmapped claim set
    pub fn claims(&self) -> &Map<String, Value> {
        &self.claims
    }

    /// Mapped value of claim `name`
    pub fn claim(&self, name: &str) -> Option<&ClaimValue> {
        self.mapped.get(name)
    }

    /// Whether claim `name` mapped to something
    pub fn has_claim(&self, name: &str) -> bool {
        self.claim(name).is_some_and(ClaimValue::is_present)
    }

    fn string(&self, name: &str) -> Option<&str> {
        self.claim(name).and_then(ClaimValue::as_str)
    }

    fn list(&self, name: &str) -> Vec<String> {
        self.claim(name)
            .map(ClaimValue::as_string_list)
            .unwrap_or_default()
    }

    fn numeric(&self, name: &str) -> Option<i64> {
        self.claim(name).and_then(ClaimValue::as_i64)
    }

    /// `iss`
    pub fn issuer(&self) -> Option<&str> {
        self.string("iss")
    }

    /// `sub`
    pub fn subject(&self) -> Option<&str> {
        self.string("sub")
    }

    /// `aud`, normalised to a list
    pub fn audience(&self) -> Vec<String> {
        self.list("aud")
    }

    /// `azp`
    pub fn authorized_party(&self) -> Option<&str> {
        self.string("azp")
    }

    /// `exp` in seconds since the epoch
    pub fn expiration(&self) -> Option<i64> {
        self.numeric("exp")
    }

    /// `nbf` in seconds since the epoch
    pub fn not_before(&self) -> Option<i64> {
        self.numeric("nbf")
    }

    /// `iat` in seconds since the epoch
    pub fn issued_at(&self) -> Option<i64> {
        self.numeric("iat")
    }
}

/// A validated access token.
#[derive(Debug, Clone, PartialEq)]
pub struct AccessTokenContent(Arc<TokenContent>);

impl AccessTokenContent {
    pub(crate) fn new(content: TokenContent) -> Self {
        Self(Arc::new(content))
    }

    /// Granted scopes
    pub fn scopes(&self) -> Vec<String> {
        self.list("scope")
    }

    /// Whether `scope` was granted
    pub fn has_scope(&self, scope: &str) -> bool {
        self.scopes().iter().any(|s| s == scope)
    }

    /// `roles`
    pub fn roles(&self) -> Vec<String> {
        self.list("roles")
    }

    /// `groups`
    pub fn groups(&self) -> Vec<String> {
        self.list("groups")
    }
}

impl Deref for AccessTokenContent {
    type Target = TokenContent;

    fn deref(&self) -> &TokenContent {
        &self.0
    }
}

/// A validated OpenID Connect ID token.
#[derive(Debug, Clone, PartialEq)]
pub struct IdTokenContent(Arc<TokenContent>);

impl IdTokenContent {
    pub(crate) fn new(content: TokenContent) -> Self {
        Self(Arc::new(content))
    }

    /// `email`
    pub fn email(&self) -> Option<&str> {
        self.string("email")
    }

    /// `name`
    pub fn name(&self) -> Option<&str> {
        self.string("name")
    }

    /// `nonce`
    pub fn nonce(&self) -> Option<&str> {
        self.string("nonce")
    }
}

impl Deref for IdTokenContent {
    type Target = TokenContent;

    fn deref(&self) -> &TokenContent {
        &self.0
    }
}

/// A refresh token, opaque unless it happened to be a compact JWT.
///
/// Refresh tokens are only checked for presence and size: their claims, when
/// decodable, are informational and unverified.
#[derive(Clone, PartialEq)]
pub struct RefreshTokenContent {
    raw: String,
    claims: Map<String, Value>,
}

// Manual Debug impl to keep the raw token out of logs
impl fmt::Debug for RefreshTokenContent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RefreshTokenContent")
            .field("raw", &"[REDACTED]")
            .field("claims", &self.claims.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl RefreshTokenContent {
    pub(crate) fn new(raw: &str, decoded: Option<DecodedToken>) -> Self {
        Self {
            raw: raw.to_owned(),
            claims: decoded.map(|d| d.body().clone()).unwrap_or_default(),
        }
    }

    /// Original token string
    pub fn raw_token(&self) -> &str {
        &self.raw
    }

    /// Unverified claims; empty for opaque tokens
    pub fn claims(&self) -> &Map<String, Value> {
        &self.claims
    }

    /// Whether the token decoded as a compact JWT
    pub fn is_jwt(&self) -> bool {
        !self.claims.is_empty()
    }
}
