//! Header validation: algorithm allow-list and key id

use std::str::FromStr;

use jsonwebtoken::Algorithm;

use crate::error::{Result, ValidationError};
use crate::token::DecodedToken;

/// Header parameters that passed validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedHeader {
    /// Signature algorithm
    pub algorithm: Algorithm,
    /// Key id
    pub key_id: String,
}

/// Checks `alg` against an issuer's allow-list and requires `kid`.
#[derive(Debug, Clone)]
pub struct HeaderValidator {
    algorithms: Vec<Algorithm>,
}

impl HeaderValidator {
    /// Accept only `algorithms`
    pub fn new(algorithms: &[Algorithm]) -> Self {
        Self {
            algorithms: algorithms.to_vec(),
        }
    }

    /// Validate the header of `token`.
    ///
    /// # Errors
    ///
    /// - [`ValidationError::MissingClaim`] if `alg` or `kid` is absent
    /// - [`ValidationError::UnsupportedAlgorithm`] for `none` or unknown algorithms
    /// - [`ValidationError::AlgorithmRejected`] if the algorithm is not allowed
    pub fn validate(&self, token: &DecodedToken) -> Result<ValidatedHeader> {
        let name = token
            .algorithm()
            .ok_or_else(|| ValidationError::missing_claim("alg"))?;
        if name.eq_ignore_ascii_case("none") {
            return Err(ValidationError::UnsupportedAlgorithm {
                algorithm: name.to_owned(),
            });
        }
        let algorithm =
            Algorithm::from_str(name).map_err(|_| ValidationError::UnsupportedAlgorithm {
                algorithm: name.to_owned(),
            })?;
        if !self.algorithms.contains(&algorithm) {
            return Err(ValidationError::AlgorithmRejected {
                algorithm: name.to_owned(),
                reason: "not in the issuer's allow-list".to_string(),
            });
        }

        let key_id = token
            .key_id()
            .filter(|kid| !kid.is_empty())
            .ok_or_else(|| ValidationError::missing_claim("kid"))?;

        Ok(ValidatedHeader {
            algorithm,
            key_id: key_id.to_owned(),
        })
    }
}
