//! OpenID Connect discovery
//!
//! Resolves the `jwks_uri` of an issuer from its discovery document. The
//! document must assert the configured issuer exactly. A successful
//! resolution is kept for the lifetime of the resolver; failures are not.

use serde::Deserialize;
use tokio::sync::OnceCell;
use tracing::{debug, warn};
use url::Url;

use crate::error::KeyLoadError;

/// Fields of a discovery document this crate uses.
#[derive(Debug, Clone, Deserialize)]
pub struct DiscoveryDocument {
    /// Issuer identifier asserted by the provider
    pub issuer: String,
    /// Key set location
    pub jwks_uri: String,
}

/// Fetches and validates a discovery document once.
#[derive(Debug)]
pub struct DiscoveryResolver {
    client: reqwest::Client,
    discovery_url: Url,
    expected_issuer: String,
    max_response_size: usize,
    jwks_uri: OnceCell<Url>,
}

impl DiscoveryResolver {
    /// Resolve through `discovery_url` for `expected_issuer`
    pub fn new(
        client: reqwest::Client,
        discovery_url: Url,
        expected_issuer: impl Into<String>,
        max_response_size: usize,
    ) -> Self {
        Self {
            client,
            discovery_url,
            expected_issuer: expected_issuer.into(),
            max_response_size,
            jwks_uri: OnceCell::new(),
        }
    }

    /// Discovery document location
    pub fn discovery_url(&self) -> &Url {
        &self.discovery_url
    }

    /// The key set URL, fetching the discovery document on first use.
    ///
    /// # Errors
    ///
    /// - [`KeyLoadError::Http`] / [`KeyLoadError::Status`] on request failure
    /// - [`KeyLoadError::InvalidDiscoveryDocument`] if the document is malformed
    /// - [`KeyLoadError::IssuerMismatch`] if it asserts another issuer
    pub async fn jwks_uri(&self) -> Result<Url, KeyLoadError> {
        self.jwks_uri
            .get_or_try_init(|| self.resolve())
            .await
            .cloned()
    }

    async fn resolve(&self) -> Result<Url, KeyLoadError> {
        let url = self.discovery_url.to_string();
        debug!(url = %url, "Fetching discovery document");

        let response = self
            .client
            .get(self.discovery_url.clone())
            .send()
            .await
            .map_err(|e| KeyLoadError::Http {
                url: url.clone(),
                reason: e.to_string(),
            })?;

        if !response.status().is_success() {
            return Err(KeyLoadError::Status {
                url,
                status: response.status().as_u16(),
            });
        }
        if let Some(content_length) = response.content_length()
            && content_length > self.max_response_size as u64
        {
            return Err(KeyLoadError::ResponseTooLarge {
                url,
                max: self.max_response_size,
            });
        }
        let body = response.bytes().await.map_err(|e| KeyLoadError::Http {
            url: url.clone(),
            reason: e.to_string(),
        })?;
        if body.len() > self.max_response_size {
            return Err(KeyLoadError::ResponseTooLarge {
                url,
                max: self.max_response_size,
            });
        }

        let document: DiscoveryDocument = serde_json::from_slice(&body)
            .map_err(|e| KeyLoadError::InvalidDiscoveryDocument(e.to_string()))?;

        if document.issuer != self.expected_issuer {
            warn!(
                expected = %self.expected_issuer,
                actual = %document.issuer,
                "Discovery document asserts a different issuer"
            );
            return Err(KeyLoadError::IssuerMismatch {
                expected: self.expected_issuer.clone(),
                actual: document.issuer,
            });
        }

        let jwks_uri = Url::parse(&document.jwks_uri).map_err(|e| {
            KeyLoadError::InvalidDiscoveryDocument(format!("invalid jwks_uri: {e}"))
        })?;
        debug!(issuer = %self.expected_issuer, jwks_uri = %jwks_uri, "Resolved key set location");
        Ok(jwks_uri)
    }
}
