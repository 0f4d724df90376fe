//! Token decoding, claim mapping and typed token content

pub mod claims;
pub mod content;
pub mod parser;

pub use claims::{
    ClaimMapper, ClaimMappers, ClaimValue, IdentityMapper, JsonCollectionMapper, MappedValue,
    MapperKind, NumericMapper, ScopeMapper, StringSplitterMapper, builtin_mapper,
};
pub use content::{AccessTokenContent, IdTokenContent, RefreshTokenContent, TokenContent, TokenType};
pub use parser::{DecodedToken, ParserConfig, TokenParser};
