//! Common test utilities for integration tests
//!
//! Signing keys and a mock identity provider serving key sets and discovery
//! documents.

#![allow(dead_code)]

use std::time::{SystemTime, UNIX_EPOCH};

use jsonwebtoken::{Algorithm, EncodingKey, Header};
use serde_json::{Value, json};
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

pub const ISSUER: &str = "https://idp.example.com";

pub const JWK_A: &str = include_str!("../fixtures/jwk_a.json");
pub const JWK_B: &str = include_str!("../fixtures/jwk_b.json");
const PEM_A: &[u8] = include_bytes!("../fixtures/rsa_a.pem");
const PEM_B: &[u8] = include_bytes!("../fixtures/rsa_b.pem");

/// Key pairs available to tests
#[derive(Debug, Clone, Copy)]
pub enum TestKey {
    A,
    B,
}

impl TestKey {
    pub fn kid(self) -> &'static str {
        match self {
            TestKey::A => "key-a",
            TestKey::B => "key-b",
        }
    }

    fn pem(self) -> &'static [u8] {
        match self {
            TestKey::A => PEM_A,
            TestKey::B => PEM_B,
        }
    }
}

/// Current time in seconds since the epoch
pub fn now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs() as i64
}

/// Key set document with the given JWK entries
pub fn jwks(entries: &[&str]) -> String {
    format!(r#"{{"keys":[{}]}}"#, entries.join(","))
}

/// Claims of a valid access token from `issuer`
pub fn claims(issuer: &str) -> Value {
    json!({
        "iss": issuer,
        "sub": "alice",
        "aud": "orders-api",
        "scope": "orders:read orders:write",
        "iat": now(),
        "exp": now() + 300,
    })
}

/// RS256 token signed with `key`, carrying its kid
pub fn sign(key: TestKey, claims: &Value) -> String {
    sign_with_kid(key, key.kid(), claims)
}

/// RS256 token signed with `key` but announcing `kid`
pub fn sign_with_kid(key: TestKey, kid: &str, claims: &Value) -> String {
    let mut header = Header::new(Algorithm::RS256);
    header.kid = Some(kid.to_string());
    let encoding_key = EncodingKey::from_rsa_pem(key.pem()).unwrap();
    jsonwebtoken::encode(&header, claims, &encoding_key).unwrap()
}

/// Mock identity provider
pub struct MockIdp {
    pub server: MockServer,
}

impl MockIdp {
    pub async fn start() -> Self {
        Self {
            server: MockServer::start().await,
        }
    }

    pub fn jwks_url(&self) -> url::Url {
        format!("{}/jwks", self.server.uri()).parse().unwrap()
    }

    pub fn discovery_url(&self) -> url::Url {
        format!("{}/.well-known/openid-configuration", self.server.uri())
            .parse()
            .unwrap()
    }

    /// Serve `body` at the key set endpoint, replacing earlier responses
    pub async fn serve_jwks(&self, body: String) {
        self.server.reset().await;
        Mock::given(method("GET"))
            .and(path("/jwks"))
            .respond_with(ResponseTemplate::new(200).set_body_string(body))
            .mount(&self.server)
            .await;
    }

    /// Serve `body` with `etag`, answering revalidation with 304
    pub async fn serve_jwks_with_etag(&self, body: String, etag: &str) {
        self.server.reset().await;
        Mock::given(method("GET"))
            .and(path("/jwks"))
            .and(header("if-none-match", etag))
            .respond_with(ResponseTemplate::new(304).insert_header("etag", etag))
            .with_priority(1)
            .mount(&self.server)
            .await;
        Mock::given(method("GET"))
            .and(path("/jwks"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("etag", etag)
                    .set_body_string(body),
            )
            .mount(&self.server)
            .await;
    }

    /// Fail the key set endpoint with `status`
    pub async fn fail_jwks(&self, status: u16) {
        self.server.reset().await;
        Mock::given(method("GET"))
            .and(path("/jwks"))
            .respond_with(ResponseTemplate::new(status))
            .mount(&self.server)
            .await;
    }

    /// Serve a discovery document asserting `issuer`
    pub async fn serve_discovery(&self, issuer: &str) {
        Mock::given(method("GET"))
            .and(path("/.well-known/openid-configuration"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "issuer": issuer,
                "jwks_uri": self.jwks_url().as_str(),
            })))
            .mount(&self.server)
            .await;
    }

    /// Requests received at the key set endpoint
    pub async fn jwks_requests(&self) -> usize {
        self.server
            .received_requests()
            .await
            .unwrap_or_default()
            .iter()
            .filter(|r| r.url.path() == "/jwks")
            .count()
    }
}
