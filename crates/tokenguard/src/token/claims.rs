//! Claim values and claim mappers
//!
//! A [`ClaimMapper`] turns one raw JSON claim into a typed [`ClaimValue`].
//! Mappers are looked up per claim name: an issuer-specific override wins,
//! then the built-in table, then [`IdentityMapper`].

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};

/// The typed part of a [`ClaimValue`].
#[derive(Debug, Clone, PartialEq)]
pub enum MappedValue {
    /// Claim missing, `null`, or not convertible by its mapper
    Absent,
    /// Single string
    String(String),
    /// List of strings
    StringList(Vec<String>),
    /// JSON number
    Numeric(Number),
    /// JSON boolean
    Boolean(bool),
}

/// A mapped claim plus the JSON text it was mapped from.
#[derive(Debug, Clone, PartialEq)]
pub struct ClaimValue {
    value: MappedValue,
    original: Option<String>,
}

impl ClaimValue {
    /// A claim that is not present
    pub fn absent() -> Self {
        Self {
            value: MappedValue::Absent,
            original: None,
        }
    }

    /// Pair a mapped value with its source JSON
    pub fn new(value: MappedValue, original: &Value) -> Self {
        Self {
            value,
            original: Some(original.to_string()),
        }
    }

    /// The mapped value
    pub fn value(&self) -> &MappedValue {
        &self.value
    }

    /// Original JSON text, if the claim was present at all
    pub fn original(&self) -> Option<&str> {
        self.original.as_deref()
    }

    /// Whether the mapper produced anything
    pub fn is_present(&self) -> bool {
        !matches!(self.value, MappedValue::Absent)
    }

    /// Scalar string value
    pub fn as_str(&self) -> Option<&str> {
        match &self.value {
            MappedValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// Values as a list; a scalar string becomes a one-element list
    pub fn as_string_list(&self) -> Vec<String> {
        match &self.value {
            MappedValue::StringList(list) => list.clone(),
            MappedValue::String(s) => vec![s.clone()],
            _ => Vec::new(),
        }
    }

    /// Integer value, truncating fractional seconds
    pub fn as_i64(&self) -> Option<i64> {
        match &self.value {
            MappedValue::Numeric(n) => n.as_i64().or_else(|| {
                n.as_f64()
                    .filter(|f| f.is_finite())
                    .map(|f| f.trunc() as i64)
            }),
            _ => None,
        }
    }

    /// Boolean value
    pub fn as_bool(&self) -> Option<bool> {
        match &self.value {
            MappedValue::Boolean(b) => Some(*b),
            _ => None,
        }
    }
}

/// Converts a named claim of a claim set into a [`ClaimValue`].
pub trait ClaimMapper: Send + Sync + fmt::Debug {
    /// Map claim `name` out of `claims`
    fn map(&self, claims: &Map<String, Value>, name: &str) -> ClaimValue;
}

fn lookup<'a>(claims: &'a Map<String, Value>, name: &str) -> Option<&'a Value> {
    claims.get(name).filter(|v| !v.is_null())
}

fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Passes the JSON type through unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityMapper;

impl ClaimMapper for IdentityMapper {
    fn map(&self, claims: &Map<String, Value>, name: &str) -> ClaimValue {
        let Some(raw) = lookup(claims, name) else {
            return ClaimValue::absent();
        };
        let value = match raw {
            Value::String(s) => MappedValue::String(s.clone()),
            Value::Number(n) => MappedValue::Numeric(n.clone()),
            Value::Bool(b) => MappedValue::Boolean(*b),
            Value::Array(items) => MappedValue::StringList(items.iter().map(stringify).collect()),
            Value::Object(_) => MappedValue::String(raw.to_string()),
            Value::Null => MappedValue::Absent,
        };
        ClaimValue::new(value, raw)
    }
}

/// Space-delimited scope string (RFC 6749 §3.3), or an array of scopes.
#[derive(Debug, Clone, Copy, Default)]
pub struct ScopeMapper;

impl ClaimMapper for ScopeMapper {
    fn map(&self, claims: &Map<String, Value>, name: &str) -> ClaimValue {
        let Some(raw) = lookup(claims, name) else {
            return ClaimValue::absent();
        };
        let scopes = match raw {
            Value::String(s) => s.split_whitespace().map(str::to_owned).collect(),
            Value::Array(items) => items.iter().map(stringify).collect(),
            _ => return ClaimValue::new(MappedValue::Absent, raw),
        };
        ClaimValue::new(MappedValue::StringList(scopes), raw)
    }
}

/// Splits a string claim on a separator character.
#[derive(Debug, Clone, Copy)]
pub struct StringSplitterMapper {
    separator: char,
}

impl StringSplitterMapper {
    /// Split on `separator`
    pub fn new(separator: char) -> Self {
        Self { separator }
    }
}

impl ClaimMapper for StringSplitterMapper {
    fn map(&self, claims: &Map<String, Value>, name: &str) -> ClaimValue {
        let Some(raw) = lookup(claims, name) else {
            return ClaimValue::absent();
        };
        let parts = match raw {
            Value::String(s) => s
                .split(self.separator)
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(str::to_owned)
                .collect(),
            Value::Array(items) => items.iter().map(stringify).collect(),
            _ => return ClaimValue::new(MappedValue::Absent, raw),
        };
        ClaimValue::new(MappedValue::StringList(parts), raw)
    }
}

/// A JSON array of strings, tolerating a single bare string.
///
/// Used for `aud`, which RFC 7519 allows to be either.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCollectionMapper;

impl ClaimMapper for JsonCollectionMapper {
    fn map(&self, claims: &Map<String, Value>, name: &str) -> ClaimValue {
        let Some(raw) = lookup(claims, name) else {
            return ClaimValue::absent();
        };
        let items = match raw {
            Value::Array(items) => items.iter().map(stringify).collect(),
            Value::String(s) => vec![s.clone()],
            _ => return ClaimValue::new(MappedValue::Absent, raw),
        };
        ClaimValue::new(MappedValue::StringList(items), raw)
    }
}

/// Numeric dates and counters, accepting numeric strings.
#[derive(Debug, Clone, Copy, Default)]
pub struct NumericMapper;

impl ClaimMapper for NumericMapper {
    fn map(&self, claims: &Map<String, Value>, name: &str) -> ClaimValue {
        let Some(raw) = lookup(claims, name) else {
            return ClaimValue::absent();
        };
        let value = match raw {
            Value::Number(n) => MappedValue::Numeric(n.clone()),
            Value::String(s) => s
                .trim()
                .parse::<i64>()
                .map_or(MappedValue::Absent, |n| MappedValue::Numeric(n.into())),
            _ => MappedValue::Absent,
        };
        ClaimValue::new(value, raw)
    }
}

static IDENTITY: IdentityMapper = IdentityMapper;
static SCOPE: ScopeMapper = ScopeMapper;
static COLLECTION: JsonCollectionMapper = JsonCollectionMapper;
static NUMERIC: NumericMapper = NumericMapper;

/// Built-in mapper for a registered claim name.
pub fn builtin_mapper(name: &str) -> &'static dyn ClaimMapper {
    match name {
        "exp" | "iat" | "nbf" | "auth_time" => &NUMERIC,
        "aud" | "roles" | "groups" => &COLLECTION,
        "scope" | "scp" => &SCOPE,
        _ => &IDENTITY,
    }
}

/// Built-in mappers selectable by name in settings files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MapperKind {
    /// [`IdentityMapper`]
    Identity,
    /// [`ScopeMapper`]
    Scope,
    /// [`JsonCollectionMapper`]
    JsonCollection,
    /// [`NumericMapper`]
    Numeric,
    /// [`StringSplitterMapper`]
    StringSplitter {
        /// Separator character
        separator: char,
    },
}

impl MapperKind {
    /// Instantiate the mapper
    pub fn into_mapper(self) -> Arc<dyn ClaimMapper> {
        match self {
            MapperKind::Identity => Arc::new(IdentityMapper),
            MapperKind::Scope => Arc::new(ScopeMapper),
            MapperKind::JsonCollection => Arc::new(JsonCollectionMapper),
            MapperKind::Numeric => Arc::new(NumericMapper),
            MapperKind::StringSplitter { separator } => {
                Arc::new(StringSplitterMapper::new(separator))
            }
        }
    }
}

/// Per-issuer mapper resolution: overrides, then built-ins.
#[derive(Debug, Clone, Default)]
pub struct ClaimMappers {
    overrides: HashMap<String, Arc<dyn ClaimMapper>>,
}

impl ClaimMappers {
    /// Resolve with the given overrides
    pub fn new(overrides: HashMap<String, Arc<dyn ClaimMapper>>) -> Self {
        Self { overrides }
    }

    /// Map `name` using the override or built-in mapper
    pub fn map(&self, claims: &Map<String, Value>, name: &str) -> ClaimValue {
        match self.overrides.get(name) {
            Some(mapper) => mapper.map(claims, name),
            None => builtin_mapper(name).map(claims, name),
        }
    }

    /// Whether any override is registered
    pub fn has_overrides(&self) -> bool {
        !self.overrides.is_empty()
    }
}
