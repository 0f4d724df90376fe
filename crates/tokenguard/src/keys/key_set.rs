//! Key set parsing
//!
//! Converts a `{"keys": [...]}` document into [`KeyInfo`] entries keyed by
//! `kid`. Individual entries that cannot be used are skipped with a warning;
//! only a document that is not JSON, or lacks the `keys` array, is an error.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use jsonwebtoken::jwk::{AlgorithmParameters, EllipticCurve, Jwk};
use jsonwebtoken::{Algorithm, DecodingKey};
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::KeyLoadError;

/// Public key family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyType {
    /// RSA (`RS*`, `PS*`)
    Rsa,
    /// Elliptic curve (`ES*`)
    Ec,
    /// Octet key pair (`EdDSA`)
    Okp,
}

impl KeyType {
    /// Key family an algorithm needs, `None` for symmetric algorithms
    pub fn for_algorithm(algorithm: Algorithm) -> Option<Self> {
        match algorithm {
            Algorithm::RS256
            | Algorithm::RS384
            | Algorithm::RS512
            | Algorithm::PS256
            | Algorithm::PS384
            | Algorithm::PS512 => Some(KeyType::Rsa),
            Algorithm::ES256 | Algorithm::ES384 => Some(KeyType::Ec),
            Algorithm::EdDSA => Some(KeyType::Okp),
            _ => None,
        }
    }
}

/// A usable verification key.
#[derive(Clone)]
pub struct KeyInfo {
    key_id: String,
    algorithm: Algorithm,
    algorithm_declared: bool,
    key_type: KeyType,
    decoding_key: DecodingKey,
}

impl fmt::Debug for KeyInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyInfo")
            .field("key_id", &self.key_id)
            .field("algorithm", &self.algorithm)
            .field("algorithm_declared", &self.algorithm_declared)
            .field("key_type", &self.key_type)
            .field("decoding_key", &"<public key>")
            .finish()
    }
}

impl KeyInfo {
    /// `kid`
    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    /// Declared `alg`, or the algorithm inferred from the key parameters
    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    /// Whether the entry declared `alg` explicitly
    pub fn algorithm_declared(&self) -> bool {
        self.algorithm_declared
    }

    /// Key family
    pub fn key_type(&self) -> KeyType {
        self.key_type
    }

    /// Key material for verification
    pub fn decoding_key(&self) -> &DecodingKey {
        &self.decoding_key
    }

    /// Whether this key may verify a token signed with `algorithm`.
    ///
    /// A declared `alg` must match exactly; otherwise any algorithm of the
    /// key's family is accepted.
    pub fn accepts(&self, algorithm: Algorithm) -> bool {
        if self.algorithm_declared {
            self.algorithm == algorithm
        } else {
            KeyType::for_algorithm(algorithm) == Some(self.key_type)
        }
    }

    fn from_entry(entry: &Value) -> Result<Self, String> {
        let key_id = entry
            .get("kid")
            .and_then(Value::as_str)
            .filter(|kid| !kid.is_empty())
            .ok_or("missing kid")?
            .to_owned();

        if entry.get("use").and_then(Value::as_str) == Some("enc") {
            return Err("encryption key".to_owned());
        }

        let declared = entry
            .get("alg")
            .and_then(Value::as_str)
            .map(|alg| Algorithm::from_str(alg).map_err(|_| format!("unsupported alg {alg}")))
            .transpose()?;

        let jwk: Jwk = serde_json::from_value(entry.clone()).map_err(|e| e.to_string())?;
        let (key_type, inferred) = match &jwk.algorithm {
            AlgorithmParameters::RSA(_) => (KeyType::Rsa, Algorithm::RS256),
            AlgorithmParameters::EllipticCurve(ec) => match ec.curve {
                EllipticCurve::P256 => (KeyType::Ec, Algorithm::ES256),
                EllipticCurve::P384 => (KeyType::Ec, Algorithm::ES384),
                ref other => return Err(format!("unsupported curve {other:?}")),
            },
            AlgorithmParameters::OctetKeyPair(_) => (KeyType::Okp, Algorithm::EdDSA),
            _ => return Err("symmetric or unsupported key type".to_owned()),
        };

        if let Some(alg) = declared
            && KeyType::for_algorithm(alg) != Some(key_type)
        {
            return Err(format!("alg {alg:?} does not fit a {key_type:?} key"));
        }

        let decoding_key = DecodingKey::from_jwk(&jwk).map_err(|e| e.to_string())?;

        Ok(Self {
            key_id,
            algorithm: declared.unwrap_or(inferred),
            algorithm_declared: declared.is_some(),
            key_type,
            decoding_key,
        })
    }
}

/// Keys of one key set document, by `kid`.
#[derive(Debug, Clone, Default)]
pub struct KeySet {
    keys: HashMap<String, Arc<KeyInfo>>,
}

impl KeySet {
    /// Parse a key set document.
    ///
    /// # Errors
    ///
    /// [`KeyLoadError::InvalidKeySet`] if the document is not a JSON object
    /// with a `keys` array.
    pub fn parse(document: &[u8]) -> Result<Self, KeyLoadError> {
        let root: Value = serde_json::from_slice(document)
            .map_err(|e| KeyLoadError::InvalidKeySet(e.to_string()))?;
        let entries = root
            .get("keys")
            .and_then(Value::as_array)
            .ok_or_else(|| KeyLoadError::InvalidKeySet("missing 'keys' array".to_string()))?;

        let mut keys = HashMap::with_capacity(entries.len());
        for (index, entry) in entries.iter().enumerate() {
            match KeyInfo::from_entry(entry) {
                Ok(info) => {
                    if keys.contains_key(info.key_id()) {
                        warn!(kid = %info.key_id(), "Duplicate key id in key set, keeping first");
                        continue;
                    }
                    debug!(kid = %info.key_id(), algorithm = ?info.algorithm(), "Loaded key");
                    keys.insert(info.key_id.clone(), Arc::new(info));
                }
                Err(reason) => {
                    warn!(index, reason = %reason, "Skipping unusable key set entry");
                }
            }
        }

        Ok(Self { keys })
    }

    /// Key with `kid`
    pub fn get(&self, kid: &str) -> Option<Arc<KeyInfo>> {
        self.keys.get(kid).cloned()
    }

    /// Number of usable keys
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Whether no usable key was found
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Key ids, unordered
    pub fn key_ids(&self) -> impl Iterator<Item = &str> {
        self.keys.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const JWK_A: &str = include_str!("../../tests/fixtures/jwk_a.json");
    const JWK_B: &str = include_str!("../../tests/fixtures/jwk_b.json");

    fn entry(raw: &str) -> Value {
        serde_json::from_str(raw).unwrap()
    }

    fn document(keys: Vec<Value>) -> Vec<u8> {
        serde_json::to_vec(&json!({ "keys": keys })).unwrap()
    }

    #[test]
    fn test_parse_valid_set() {
        let set = KeySet::parse(&document(vec![entry(JWK_A), entry(JWK_B)])).unwrap();
        assert_eq!(set.len(), 2);

        let key = set.get("key-a").unwrap();
        assert_eq!(key.key_id(), "key-a");
        assert_eq!(key.algorithm(), Algorithm::RS256);
        assert!(key.algorithm_declared());
        assert_eq!(key.key_type(), KeyType::Rsa);
        assert!(key.accepts(Algorithm::RS256));
        assert!(!key.accepts(Algorithm::RS512));
    }

    #[test]
    fn test_inferred_algorithm_accepts_family() {
        let mut raw = entry(JWK_A);
        raw.as_object_mut().unwrap().remove("alg");
        let set = KeySet::parse(&document(vec![raw])).unwrap();

        let key = set.get("key-a").unwrap();
        assert!(!key.algorithm_declared());
        assert_eq!(key.algorithm(), Algorithm::RS256);
        assert!(key.accepts(Algorithm::PS384));
        assert!(!key.accepts(Algorithm::ES256));
        assert!(!key.accepts(Algorithm::HS256));
    }

    #[test]
    fn test_malformed_entries_are_skipped() {
        let mut no_kid = entry(JWK_B);
        no_kid.as_object_mut().unwrap().remove("kid");
        let keys = vec![
            entry(JWK_A),
            json!({"kty": "RSA", "kid": "broken", "n": "!!", "e": "AQAB"}),
            json!({"kid": "no-kty"}),
            json!({"kty": "oct", "kid": "hmac", "k": "c2VjcmV0"}),
            json!("not an object"),
            no_kid,
        ];
        let set = KeySet::parse(&document(keys)).unwrap();
        assert_eq!(set.len(), 1);
        assert!(set.get("key-a").is_some());
        assert!(set.get("hmac").is_none());
    }

    #[test]
    fn test_mismatched_alg_is_skipped() {
        let mut raw = entry(JWK_A);
        raw["alg"] = json!("ES256");
        let set = KeySet::parse(&document(vec![raw])).unwrap();
        assert!(set.is_empty());
    }

    #[test]
    fn test_encryption_keys_are_skipped() {
        let mut raw = entry(JWK_A);
        raw["use"] = json!("enc");
        let set = KeySet::parse(&document(vec![raw])).unwrap();
        assert!(set.is_empty());
    }

    #[test]
    fn test_duplicate_kid_keeps_first() {
        let mut second = entry(JWK_B);
        second["kid"] = json!("key-a");
        let set = KeySet::parse(&document(vec![entry(JWK_A), second])).unwrap();
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_unparsable_documents_fail() {
        assert!(matches!(
            KeySet::parse(b"not json"),
            Err(KeyLoadError::InvalidKeySet(_))
        ));
        assert!(matches!(
            KeySet::parse(br#"{"other": []}"#),
            Err(KeyLoadError::InvalidKeySet(_))
        ));
        assert!(matches!(
            KeySet::parse(br#"{"keys": {}}"#),
            Err(KeyLoadError::InvalidKeySet(_))
        ));
        assert!(KeySet::parse(br#"{"keys": []}"#).unwrap().is_empty());
    }

    #[test]
    fn test_debug_hides_key_material() {
        let set = KeySet::parse(&document(vec![entry(JWK_A)])).unwrap();
        let debug = format!("{:?}", set.get("key-a").unwrap());
        assert!(debug.contains("key-a"));
        assert!(debug.contains("<public key>"));
    }
}
