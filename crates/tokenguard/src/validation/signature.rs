//! Signature validation against the issuer's key material

use std::sync::Arc;

use tracing::debug;

use super::header::ValidatedHeader;
use crate::error::{KeyLoadError, Result, ValidationError};
use crate::keys::KeyMaterialLoader;
use crate::monitor::{MeasurementType, PerformanceMonitor};
use crate::token::DecodedToken;

/// Resolves the signing key for a token and verifies its signature.
#[derive(Debug, Clone)]
pub struct SignatureValidator {
    issuer: String,
    loader: Arc<dyn KeyMaterialLoader>,
    monitor: Arc<PerformanceMonitor>,
}

impl SignatureValidator {
    /// Verify with keys from `loader`
    pub fn new(
        issuer: impl Into<String>,
        loader: Arc<dyn KeyMaterialLoader>,
        monitor: Arc<PerformanceMonitor>,
    ) -> Self {
        Self {
            issuer: issuer.into(),
            loader,
            monitor,
        }
    }

    /// Verify the signature of `token`.
    ///
    /// # Errors
    ///
    /// - [`ValidationError::KeyNotFound`] if no visible key has the header's `kid`
    /// - [`ValidationError::IssuerMismatch`] if key resolution failed because
    ///   discovery asserted a different issuer
    /// - [`ValidationError::AlgorithmRejected`] if the key is not usable with
    ///   the header's algorithm
    /// - [`ValidationError::SignatureValidationFailed`] if verification fails
    pub async fn validate(&self, token: &DecodedToken, header: &ValidatedHeader) -> Result<()> {
        self.loader.ensure_loaded().await;

        let Some(key) = self.loader.key_info(&header.key_id) else {
            return Err(self.key_not_found(&header.key_id));
        };

        if !key.accepts(header.algorithm) {
            return Err(ValidationError::AlgorithmRejected {
                algorithm: format!("{:?}", header.algorithm),
                reason: format!("key '{}' is for {:?}", key.key_id(), key.algorithm()),
            });
        }

        let verified = self.monitor.measure(MeasurementType::SignatureValidation, || {
            jsonwebtoken::crypto::verify(
                token.signature_segment(),
                token.signing_input().as_bytes(),
                key.decoding_key(),
                header.algorithm,
            )
        });

        match verified {
            Ok(true) => {
                debug!(issuer = %self.issuer, kid = %header.key_id, "Signature verified");
                Ok(())
            }
            Ok(false) => Err(ValidationError::SignatureValidationFailed(
                "signature does not match".to_string(),
            )),
            Err(e) => Err(ValidationError::SignatureValidationFailed(e.to_string())),
        }
    }

    fn key_not_found(&self, kid: &str) -> ValidationError {
        match self.loader.last_error() {
            Some(KeyLoadError::IssuerMismatch { expected, actual }) => {
                ValidationError::IssuerMismatch { expected, actual }
            }
            _ => ValidationError::KeyNotFound {
                kid: kid.to_owned(),
                issuer: self.issuer.clone(),
            },
        }
    }
}
