//! Conditional HTTP fetching
//!
//! [`ConditionalFetcher`] remembers the last accepted body and its `ETag`,
//! sends `If-None-Match`, and reports whether the content actually changed.
//! It never adopts a body by itself: the caller parses the body first and
//! only then calls [`ConditionalFetcher::store`].

use bytes::Bytes;
use parking_lot::Mutex;
use reqwest::StatusCode;
use reqwest::header::{ACCEPT, ETAG, IF_NONE_MATCH};
use tracing::debug;
use url::Url;

use crate::error::KeyLoadError;

/// Result of one conditional request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    /// `304 Not Modified`; the cached body is still current
    NotModified,
    /// `200` with the same bytes as the cached body
    Unchanged,
    /// `200` with new content
    Changed {
        /// Response body
        body: Bytes,
        /// `ETag` response header
        etag: Option<String>,
    },
}

#[derive(Debug)]
struct CachedResponse {
    body: Bytes,
    etag: Option<String>,
}

/// GET with `ETag` revalidation and a response size limit.
#[derive(Debug)]
pub struct ConditionalFetcher {
    client: reqwest::Client,
    url: Url,
    max_response_size: usize,
    cached: Mutex<Option<CachedResponse>>,
}

impl ConditionalFetcher {
    /// Fetch `url` with `client`
    pub fn new(client: reqwest::Client, url: Url, max_response_size: usize) -> Self {
        Self {
            client,
            url,
            max_response_size,
            cached: Mutex::new(None),
        }
    }

    /// Target URL
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// `ETag` of the stored body
    pub fn etag(&self) -> Option<String> {
        self.cached.lock().as_ref().and_then(|c| c.etag.clone())
    }

    /// Stored body
    pub fn cached_body(&self) -> Option<Bytes> {
        self.cached.lock().as_ref().map(|c| c.body.clone())
    }

    /// Adopt `body` as the current content
    pub fn store(&self, body: Bytes, etag: Option<String>) {
        *self.cached.lock() = Some(CachedResponse { body, etag });
    }

    /// Issue one conditional GET.
    ///
    /// # Errors
    ///
    /// - [`KeyLoadError::Http`] on transport failure
    /// - [`KeyLoadError::Status`] on a non-success status other than 304
    /// - [`KeyLoadError::NotModifiedWithoutCache`] on 304 with nothing stored
    /// - [`KeyLoadError::ResponseTooLarge`] if the body exceeds the limit
    pub async fn fetch(&self) -> Result<FetchOutcome, KeyLoadError> {
        let (etag, has_cached) = {
            let cached = self.cached.lock();
            (
                cached.as_ref().and_then(|c| c.etag.clone()),
                cached.is_some(),
            )
        };

        let mut request = self
            .client
            .get(self.url.clone())
            .header(ACCEPT, "application/json");
        if let Some(etag) = &etag {
            request = request.header(IF_NONE_MATCH, etag);
        }

        let response = request.send().await.map_err(|e| self.http_error(&e))?;
        let status = response.status();

        if status == StatusCode::NOT_MODIFIED {
            if !has_cached {
                return Err(KeyLoadError::NotModifiedWithoutCache {
                    url: self.url.to_string(),
                });
            }
            debug!(url = %self.url, "Content not modified");
            return Ok(FetchOutcome::NotModified);
        }
        if !status.is_success() {
            return Err(KeyLoadError::Status {
                url: self.url.to_string(),
                status: status.as_u16(),
            });
        }

        let new_etag = response
            .headers()
            .get(ETAG)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);

        if let Some(content_length) = response.content_length()
            && content_length > self.max_response_size as u64
        {
            return Err(self.too_large());
        }
        let body = response.bytes().await.map_err(|e| self.http_error(&e))?;
        if body.len() > self.max_response_size {
            return Err(self.too_large());
        }

        let mut cached = self.cached.lock();
        if let Some(current) = cached.as_mut()
            && current.body == body
        {
            // Same bytes under a new validator: keep the validator fresh
            if new_etag.is_some() {
                current.etag = new_etag;
            }
            debug!(url = %self.url, "Content unchanged");
            return Ok(FetchOutcome::Unchanged);
        }

        Ok(FetchOutcome::Changed {
            body,
            etag: new_etag,
        })
    }

    fn http_error(&self, error: &reqwest::Error) -> KeyLoadError {
        KeyLoadError::Http {
            url: self.url.to_string(),
            reason: error.to_string(),
        }
    }

    fn too_large(&self) -> KeyLoadError {
        KeyLoadError::ResponseTooLarge {
            url: self.url.to_string(),
            max: self.max_response_size,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const BODY: &str = r#"{"keys":[]}"#;

    async fn fetcher(server: &MockServer, max: usize) -> ConditionalFetcher {
        let url = Url::parse(&format!("{}/jwks", server.uri())).unwrap();
        ConditionalFetcher::new(reqwest::Client::new(), url, max)
    }

    #[tokio::test]
    async fn test_changed_then_not_modified() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/jwks"))
            .and(header("if-none-match", "\"v1\""))
            .respond_with(ResponseTemplate::new(304))
            .with_priority(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/jwks"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("etag", "\"v1\"")
                    .set_body_string(BODY),
            )
            .mount(&server)
            .await;

        let fetcher = fetcher(&server, 1024).await;
        let FetchOutcome::Changed { body, etag } = fetcher.fetch().await.unwrap() else {
            panic!("expected changed content");
        };
        assert_eq!(etag.as_deref(), Some("\"v1\""));

        // Nothing stored yet, so no validator is sent
        assert!(matches!(
            fetcher.fetch().await.unwrap(),
            FetchOutcome::Changed { .. }
        ));

        fetcher.store(body, etag);
        assert_eq!(fetcher.fetch().await.unwrap(), FetchOutcome::NotModified);
        assert_eq!(fetcher.cached_body().unwrap(), BODY.as_bytes());
    }

    #[tokio::test]
    async fn test_identical_body_is_unchanged() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/jwks"))
            .respond_with(ResponseTemplate::new(200).set_body_string(BODY))
            .mount(&server)
            .await;

        let fetcher = fetcher(&server, 1024).await;
        fetcher.store(Bytes::from_static(BODY.as_bytes()), None);
        assert_eq!(fetcher.fetch().await.unwrap(), FetchOutcome::Unchanged);
    }

    #[tokio::test]
    async fn test_not_modified_without_cache() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(304))
            .mount(&server)
            .await;

        let err = fetcher(&server, 1024).await.fetch().await.unwrap_err();
        assert!(matches!(err, KeyLoadError::NotModifiedWithoutCache { .. }));
    }

    #[tokio::test]
    async fn test_error_status_and_size_limit() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/jwks"))
            .respond_with(ResponseTemplate::new(200).set_body_string("x".repeat(100)))
            .mount(&server)
            .await;
        let err = fetcher(&server, 10).await.fetch().await.unwrap_err();
        assert!(matches!(err, KeyLoadError::ResponseTooLarge { max: 10, .. }));

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;
        let err = fetcher(&server, 1024).await.fetch().await.unwrap_err();
        assert!(matches!(err, KeyLoadError::Status { status: 503, .. }));
        assert!(err.is_retryable());
    }
}
