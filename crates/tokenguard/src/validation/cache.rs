//! Access token cache
//!
//! Keyed by the raw token string. Each entry lives until the token's `exp`,
//! bounded by an LRU size limit, and is only served while its signing key is
//! still visible. Concurrent misses for the same token share one validation;
//! a failed validation leaves nothing behind, so the next call for that token
//! starts over.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use moka::future::Cache;
use moka::policy::EvictionPolicy;
use tracing::{debug, trace};

use crate::config::CacheConfig;
use crate::context::ValidationContext;
use crate::error::{Result, ValidationError};
use crate::monitor::{MeasurementType, PerformanceMonitor};
use crate::security_events::record_cache_lookup;
use crate::token::AccessTokenContent;

/// A validated token and the instant it stops being served.
#[derive(Debug, Clone)]
struct CacheEntry {
    content: AccessTokenContent,
    expires_at: Instant,
}

impl CacheEntry {
    fn new(content: AccessTokenContent) -> Self {
        let lifetime = content.expiration().map_or(Duration::ZERO, |exp| {
            ValidationContext::now(Duration::ZERO).remaining_lifetime(exp)
        });
        Self {
            content,
            expires_at: Instant::now() + lifetime,
        }
    }
}

struct TokenExpiry;

impl moka::Expiry<Arc<str>, CacheEntry> for TokenExpiry {
    fn expire_after_create(
        &self,
        _key: &Arc<str>,
        value: &CacheEntry,
        created_at: Instant,
    ) -> Option<Duration> {
        Some(value.expires_at.saturating_duration_since(created_at))
    }
}

/// Single-flight cache of validated access tokens.
pub struct TokenCache {
    cache: Option<Cache<Arc<str>, CacheEntry>>,
    hits: AtomicU64,
    misses: AtomicU64,
    monitor: Arc<PerformanceMonitor>,
}

impl std::fmt::Debug for TokenCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenCache")
            .field("enabled", &self.is_enabled())
            .field("hits", &self.hits())
            .field("misses", &self.misses())
            .finish()
    }
}

impl TokenCache {
    /// Cache sized by `config`; `max_size == 0` disables caching
    pub fn new(config: &CacheConfig, monitor: Arc<PerformanceMonitor>) -> Self {
        let cache = (config.max_size > 0).then(|| {
            Cache::builder()
                .max_capacity(config.max_size)
                .eviction_policy(EvictionPolicy::lru())
                .expire_after(TokenExpiry)
                .build()
        });
        Self {
            cache,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            monitor,
        }
    }

    /// Whether tokens are cached at all
    pub fn is_enabled(&self) -> bool {
        self.cache.is_some()
    }

    /// Calls answered without running a validation
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    /// Calls that ran a validation
    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    /// Number of live entries
    pub async fn len(&self) -> u64 {
        match &self.cache {
            Some(cache) => {
                cache.run_pending_tasks().await;
                cache.entry_count()
            }
            None => 0,
        }
    }

    /// Drop every entry
    pub fn clear(&self) {
        if let Some(cache) = &self.cache {
            cache.invalidate_all();
        }
    }

    /// Return the cached content for `raw`, or run `validate` and cache its
    /// success.
    ///
    /// A cached entry is served only while `key_visible` holds. Once the
    /// signing key has left the key set (including the rotation grace
    /// period) the entry is dropped and `validate` runs again.
    ///
    /// At most one `validate` runs per `raw` at a time; concurrent callers
    /// for the same token wait for it and share its result.
    ///
    /// # Errors
    ///
    /// The error of the validation this call ran or waited on.
    pub async fn get_or_validate<F>(
        &self,
        raw: &str,
        key_visible: impl Fn() -> bool,
        validate: F,
    ) -> Result<AccessTokenContent>
    where
        F: Future<Output = Result<AccessTokenContent>>,
    {
        let Some(cache) = &self.cache else {
            return validate.await;
        };

        let started = Instant::now();
        let cached = cache.get(raw).await;
        self.monitor
            .record_since(MeasurementType::CacheLookup, started);
        if let Some(entry) = cached {
            if key_visible() {
                self.record(true);
                return Ok(entry.content);
            }
            debug!("Signing key of cached token is gone, revalidating");
            cache.invalidate(raw).await;
        }

        let ran = AtomicBool::new(false);
        let validated_at = OnceLock::new();
        let result = cache
            .try_get_with(Arc::from(raw), async {
                ran.store(true, Ordering::Relaxed);
                let content = validate.await?;
                let _ = validated_at.set(Instant::now());
                Ok::<_, ValidationError>(CacheEntry::new(content))
            })
            .await;

        let ran = ran.load(Ordering::Relaxed);
        self.record(!ran);
        if let Some(validated_at) = validated_at.get() {
            self.monitor
                .record_since(MeasurementType::CacheStore, *validated_at);
        }

        match result {
            Ok(entry) => Ok(entry.content),
            Err(e) => Err(ValidationError::clone(&e)),
        }
    }

    fn record(&self, hit: bool) {
        if hit {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
        trace!(hit, "Token cache lookup");
        record_cache_lookup(hit);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security_events::SecurityEventCounter;
    use crate::token::{ClaimMappers, ParserConfig, TokenContent, TokenParser, TokenType};
    use base64::Engine as _;
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn token(exp_in: i64) -> (String, AccessTokenContent) {
        let exp = ValidationContext::now(Duration::ZERO).now_epoch_secs() + exp_in;
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"RS256","kid":"k"}"#);
        let body = URL_SAFE_NO_PAD
            .encode(serde_json::to_vec(&json!({"iss": "i", "sub": "s", "exp": exp})).unwrap());
        let raw = format!("{header}.{body}.c2ln");
        let parser = TokenParser::new(
            ParserConfig::default(),
            Arc::new(SecurityEventCounter::new()),
        );
        let decoded = parser.parse(&raw).unwrap();
        let content = TokenContent::build(TokenType::Access, &decoded, &ClaimMappers::default());
        (raw, AccessTokenContent::new(content))
    }

    fn cache(max_size: u64) -> TokenCache {
        TokenCache::new(
            &CacheConfig { max_size },
            Arc::new(PerformanceMonitor::default()),
        )
    }

    #[tokio::test]
    async fn test_second_call_is_hit() {
        let cache = cache(10);
        let (raw, content) = token(300);
        let calls = AtomicUsize::new(0);

        for _ in 0..3 {
            let result = cache
                .get_or_validate(&raw, || true, async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(content.clone())
                })
                .await
                .unwrap();
            assert_eq!(result, content);
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.misses(), 1);
        assert_eq!(cache.hits(), 2);
        assert_eq!(cache.len().await, 1);
    }

    #[tokio::test]
    async fn test_failure_is_not_cached() {
        let cache = cache(10);
        let (raw, content) = token(300);

        let err = cache
            .get_or_validate(&raw, || true, async {
                Err(ValidationError::SignatureValidationFailed("bad".into()))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ValidationError::SignatureValidationFailed(_)));
        assert_eq!(cache.len().await, 0);

        let result = cache
            .get_or_validate(&raw, || true, async { Ok(content.clone()) })
            .await
            .unwrap();
        assert_eq!(result, content);
        assert_eq!(cache.misses(), 2);
    }

    #[tokio::test]
    async fn test_disabled_cache_always_validates() {
        let cache = cache(0);
        let (raw, content) = token(300);
        let calls = AtomicUsize::new(0);

        for _ in 0..2 {
            cache
                .get_or_validate(&raw, || true, async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(content.clone())
                })
                .await
                .unwrap();
        }

        assert!(!cache.is_enabled());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(cache.len().await, 0);
    }

    #[tokio::test]
    async fn test_entry_expires_with_token() {
        let cache = cache(10);
        let (raw, content) = token(1);
        let calls = AtomicUsize::new(0);
        let validate = || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(content.clone())
        };

        cache.get_or_validate(&raw, || true, validate()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(1100)).await;
        cache.get_or_validate(&raw, || true, validate()).await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_entry_dropped_when_key_gone() {
        let cache = cache(10);
        let (raw, content) = token(300);
        let calls = AtomicUsize::new(0);
        let key_present = AtomicBool::new(true);
        let validate = || async {
            calls.fetch_add(1, Ordering::SeqCst);
            if key_present.load(Ordering::SeqCst) {
                Ok(content.clone())
            } else {
                Err(ValidationError::KeyNotFound {
                    kid: "k".into(),
                    issuer: "i".into(),
                })
            }
        };
        let visible = || key_present.load(Ordering::SeqCst);

        cache.get_or_validate(&raw, visible, validate()).await.unwrap();
        cache.get_or_validate(&raw, visible, validate()).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        key_present.store(false, Ordering::SeqCst);
        let err = cache
            .get_or_validate(&raw, visible, validate())
            .await
            .unwrap_err();
        assert!(matches!(err, ValidationError::KeyNotFound { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(cache.len().await, 0);
        assert_eq!(cache.hits(), 1);
        assert_eq!(cache.misses(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_misses_share_one_validation() {
        let cache = Arc::new(cache(10));
        let (raw, content) = token(300);
        let calls = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = (0..50)
            .map(|_| {
                let cache = Arc::clone(&cache);
                let raw = raw.clone();
                let content = content.clone();
                let calls = Arc::clone(&calls);
                tokio::spawn(async move {
                    cache
                        .get_or_validate(&raw, || true, async move {
                            calls.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(50)).await;
                            Ok(content)
                        })
                        .await
                })
            })
            .collect();

        for task in tasks {
            task.await.unwrap().unwrap();
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.misses(), 1);
        assert_eq!(cache.hits(), 49);
    }
}
