//! Non-validating compact token parser
//!
//! Splits a compact token into its three segments, decodes them and checks
//! every size bound before and after decoding. Nothing here establishes trust:
//! the result is only fit for locating the issuer and key, and for feeding the
//! signature and claim validators.

use std::fmt;
use std::sync::Arc;

use base64::Engine as _;
use base64::alphabet;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::warn;

use crate::error::{Result, ValidationError};
use crate::security_events::SecurityEventCounter;

/// base64url that accepts both padded and unpadded input.
const URL_SAFE_LENIENT: GeneralPurpose = GeneralPurpose::new(
    &alphabet::URL_SAFE,
    GeneralPurposeConfig::new()
        .with_encode_padding(false)
        .with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// Default maximum raw token size (8 KiB).
pub const DEFAULT_MAX_TOKEN_SIZE: usize = 8 * 1024;
/// Default maximum decoded segment size (8 KiB).
pub const DEFAULT_MAX_PAYLOAD_SIZE: usize = 8 * 1024;
/// Default maximum length of any JSON string inside the token.
pub const DEFAULT_MAX_STRING_SIZE: usize = 4 * 1024;
/// Default maximum JSON array length inside the token.
pub const DEFAULT_MAX_ARRAY_SIZE: usize = 64;
/// Default maximum JSON nesting depth inside the token.
pub const DEFAULT_MAX_DEPTH: usize = 10;

/// Size limits enforced by [`TokenParser`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParserConfig {
    /// Maximum byte length of the raw token
    pub max_token_size: usize,
    /// Maximum byte length of each decoded segment
    pub max_payload_size: usize,
    /// Maximum byte length of JSON strings (keys included)
    pub max_string_size: usize,
    /// Maximum JSON array length
    pub max_array_size: usize,
    /// Maximum JSON nesting depth
    pub max_depth: usize,
}

impl Default for ParserConfig {
    fn default() -> Self {
        Self {
            max_token_size: DEFAULT_MAX_TOKEN_SIZE,
            max_payload_size: DEFAULT_MAX_PAYLOAD_SIZE,
            max_string_size: DEFAULT_MAX_STRING_SIZE,
            max_array_size: DEFAULT_MAX_ARRAY_SIZE,
            max_depth: DEFAULT_MAX_DEPTH,
        }
    }
}

/// A decoded but unverified compact token.
///
/// Keeps the raw string and the offsets of its two separators so the
/// signing input can be handed to the verifier without copying.
#[derive(Clone, PartialEq)]
pub struct DecodedToken {
    raw: String,
    first_dot: usize,
    second_dot: usize,
    header: Map<String, Value>,
    body: Map<String, Value>,
    signature: Vec<u8>,
}

// Manual Debug impl to keep the raw token out of logs
impl fmt::Debug for DecodedToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DecodedToken")
            .field("raw", &"[REDACTED]")
            .field("header", &self.header)
            .field("claims", &self.body.keys().collect::<Vec<_>>())
            .field("signature_len", &self.signature.len())
            .finish()
    }
}

impl DecodedToken {
    /// The original token string
    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// First segment, still encoded
    pub fn header_segment(&self) -> &str {
        &self.raw[..self.first_dot]
    }

    /// Second segment, still encoded
    pub fn payload_segment(&self) -> &str {
        &self.raw[self.first_dot + 1..self.second_dot]
    }

    /// Third segment, still encoded
    pub fn signature_segment(&self) -> &str {
        &self.raw[self.second_dot + 1..]
    }

    /// `header.payload`, the bytes covered by the signature
    pub fn signing_input(&self) -> &str {
        &self.raw[..self.second_dot]
    }

    /// Decoded header parameters
    pub fn header(&self) -> &Map<String, Value> {
        &self.header
    }

    /// Decoded claim set
    pub fn body(&self) -> &Map<String, Value> {
        &self.body
    }

    /// Decoded signature bytes
    pub fn signature(&self) -> &[u8] {
        &self.signature
    }

    /// `alg` header parameter
    pub fn algorithm(&self) -> Option<&str> {
        self.header.get("alg").and_then(Value::as_str)
    }

    /// `kid` header parameter
    pub fn key_id(&self) -> Option<&str> {
        self.header.get("kid").and_then(Value::as_str)
    }

    /// `iss` claim
    pub fn issuer(&self) -> Option<&str> {
        self.body.get("iss").and_then(Value::as_str)
    }
}

/// Decodes compact tokens under a fixed set of size limits.
#[derive(Debug, Clone)]
pub struct TokenParser {
    config: ParserConfig,
    events: Arc<SecurityEventCounter>,
}

impl TokenParser {
    /// Create a parser reporting failures to `events`
    pub fn new(config: ParserConfig, events: Arc<SecurityEventCounter>) -> Self {
        Self { config, events }
    }

    /// Limits in force
    pub fn config(&self) -> &ParserConfig {
        &self.config
    }

    /// Decode `raw`, logging and counting any failure.
    ///
    /// # Errors
    ///
    /// - [`ValidationError::TokenEmpty`] if `raw` is blank
    /// - [`ValidationError::TokenSizeExceeded`] if `raw` exceeds `max_token_size`
    /// - [`ValidationError::InvalidFormat`] unless there are exactly three segments
    /// - [`ValidationError::DecodedPartSizeExceeded`] if a segment decodes too large
    /// - [`ValidationError::FailedToDecode`] on base64url or JSON errors
    pub fn parse(&self, raw: &str) -> Result<DecodedToken> {
        self.decode(raw).inspect_err(|e| {
            warn!(kind = %e.kind(), error = %e, "Token rejected by parser");
            self.events.increment(e.kind());
        })
    }

    /// Decode `raw` without logging or counting.
    ///
    /// For tokens that may legitimately be opaque, such as refresh tokens.
    pub fn parse_opaque(&self, raw: &str) -> Option<DecodedToken> {
        self.decode(raw).ok()
    }

    /// Blank and size checks shared by every entry point.
    pub(crate) fn pre_validate(&self, raw: &str) -> Result<()> {
        if raw.trim().is_empty() {
            return Err(ValidationError::TokenEmpty);
        }
        if raw.len() > self.config.max_token_size {
            return Err(ValidationError::TokenSizeExceeded {
                actual: raw.len(),
                max: self.config.max_token_size,
            });
        }
        Ok(())
    }

    fn decode(&self, raw: &str) -> Result<DecodedToken> {
        self.pre_validate(raw)?;

        let separators = raw.match_indices('.').map(|(i, _)| i).collect::<Vec<_>>();
        let &[first_dot, second_dot] = separators.as_slice() else {
            return Err(ValidationError::InvalidFormat(format!(
                "expected 3 segments, found {}",
                separators.len() + 1
            )));
        };
        if first_dot == 0 || second_dot == first_dot + 1 {
            return Err(ValidationError::InvalidFormat(
                "header and payload segments must not be empty".to_string(),
            ));
        }

        let header = self.decode_json("header", &raw[..first_dot])?;
        let body = self.decode_json("payload", &raw[first_dot + 1..second_dot])?;
        let signature = self.decode_segment("signature", &raw[second_dot + 1..])?;

        Ok(DecodedToken {
            raw: raw.to_owned(),
            first_dot,
            second_dot,
            header,
            body,
            signature,
        })
    }

    fn decode_segment(&self, part: &'static str, segment: &str) -> Result<Vec<u8>> {
        let max = self.config.max_payload_size;

        // Reject before allocating when the encoded length already implies too much
        let estimated = segment.trim_end_matches('=').len() * 3 / 4;
        if estimated > max {
            return Err(ValidationError::DecodedPartSizeExceeded {
                part,
                actual: estimated,
                max,
            });
        }

        let bytes = URL_SAFE_LENIENT
            .decode(segment)
            .map_err(|e| ValidationError::FailedToDecode {
                part,
                reason: e.to_string(),
            })?;
        if bytes.len() > max {
            return Err(ValidationError::DecodedPartSizeExceeded {
                part,
                actual: bytes.len(),
                max,
            });
        }
        Ok(bytes)
    }

    fn decode_json(&self, part: &'static str, segment: &str) -> Result<Map<String, Value>> {
        let bytes = self.decode_segment(part, segment)?;
        let value: Value =
            serde_json::from_slice(&bytes).map_err(|e| ValidationError::FailedToDecode {
                part,
                reason: e.to_string(),
            })?;
        self.check_limits(part, &value, 0)?;
        match value {
            Value::Object(map) => Ok(map),
            other => Err(ValidationError::FailedToDecode {
                part,
                reason: format!("expected a JSON object, found {}", json_type(&other)),
            }),
        }
    }

    fn check_limits(&self, part: &'static str, value: &Value, depth: usize) -> Result<()> {
        let violation = |reason: String| ValidationError::FailedToDecode { part, reason };
        if depth > self.config.max_depth {
            return Err(violation(format!(
                "nesting depth exceeds {}",
                self.config.max_depth
            )));
        }
        match value {
            Value::String(s) if s.len() > self.config.max_string_size => Err(violation(format!(
                "string of {} bytes exceeds {}",
                s.len(),
                self.config.max_string_size
            ))),
            Value::Array(items) => {
                if items.len() > self.config.max_array_size {
                    return Err(violation(format!(
                        "array of {} elements exceeds {}",
                        items.len(),
                        self.config.max_array_size
                    )));
                }
                items
                    .iter()
                    .try_for_each(|item| self.check_limits(part, item, depth + 1))
            }
            Value::Object(map) => map.iter().try_for_each(|(key, item)| {
                if key.len() > self.config.max_string_size {
                    return Err(violation(format!(
                        "key of {} bytes exceeds {}",
                        key.len(),
                        self.config.max_string_size
                    )));
                }
                self.check_limits(part, item, depth + 1)
            }),
            _ => Ok(()),
        }
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
