//! Remote key material: rotation, conditional revalidation and failure handling
//!
//! Tests cover:
//! - Retired keys accepted during the grace period and rejected after it
//! - Immediate retirement with a zero grace period
//! - Unchanged responses leaving the key generations untouched
//! - ETag revalidation and stale serving when the endpoint fails
//! - Cached tokens dropped once their signing key leaves the key set
//! - Lock-free reads while a refresh is in flight
//! - Status moving only forward while the first load is in flight
//! - Discovery documents asserting a foreign issuer

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{ISSUER, JWK_A, JWK_B, MockIdp, TestKey, claims, jwks, sign};
use pretty_assertions::assert_eq;
use tokenguard::keys::RefreshOutcome;
use tokenguard::{
    CacheConfig, FailureKind, HttpKeyLoader, HttpLoaderConfig, IssuerConfig, KeyLoadError,
    KeyMaterialLoader, LoaderStatus, PerformanceMonitor, RetryConfig, TokenValidator,
    ValidationError,
};
use wiremock::matchers::{method, path};
use wiremock::{Mock, ResponseTemplate};

fn loader_config(idp: &MockIdp, grace: Duration) -> HttpLoaderConfig {
    HttpLoaderConfig::jwks(idp.jwks_url())
        .refresh_interval(Duration::ZERO)
        .grace_period(grace)
        .retry(RetryConfig::none())
}

fn validator_with(
    loader: Arc<HttpKeyLoader>,
    config: HttpLoaderConfig,
    cache: CacheConfig,
) -> TokenValidator {
    let issuer = IssuerConfig::builder()
        .issuer(ISSUER)
        .http_loader(config)
        .build()
        .unwrap();
    TokenValidator::builder()
        .issuer_with_loader(issuer, loader)
        .cache_config(cache)
        .build()
        .unwrap()
}

async fn setup_with_cache(
    idp: &MockIdp,
    grace: Duration,
    cache: CacheConfig,
) -> (Arc<HttpKeyLoader>, TokenValidator) {
    let config = loader_config(idp, grace);
    let loader = HttpKeyLoader::new(
        ISSUER,
        config.clone(),
        Arc::new(PerformanceMonitor::default()),
    )
    .unwrap();
    let validator = validator_with(Arc::clone(&loader), config, cache);
    (loader, validator)
}

/// Token cache disabled, so every call resolves keys and verifies
async fn setup(idp: &MockIdp, grace: Duration) -> (Arc<HttpKeyLoader>, TokenValidator) {
    setup_with_cache(idp, grace, CacheConfig { max_size: 0 }).await
}

#[tokio::test]
async fn test_retired_key_valid_during_grace_period() {
    let idp = MockIdp::start().await;
    idp.serve_jwks(jwks(&[JWK_A])).await;
    let (loader, validator) = setup(&idp, Duration::from_millis(500)).await;

    let token_a = sign(TestKey::A, &claims(ISSUER));
    validator.validate_access_token(&token_a).await.unwrap();

    idp.serve_jwks(jwks(&[JWK_B])).await;
    let outcome = loader.refresh().await.unwrap();
    assert_eq!(
        outcome,
        RefreshOutcome::Changed {
            keys: 1,
            rotated: true
        }
    );

    // A is retired but within grace, B is current
    validator.validate_access_token(&token_a).await.unwrap();
    let token_b = sign(TestKey::B, &claims(ISSUER));
    validator.validate_access_token(&token_b).await.unwrap();

    tokio::time::sleep(Duration::from_millis(700)).await;

    let err = validator.validate_access_token(&token_a).await.unwrap_err();
    assert_eq!(
        err,
        ValidationError::KeyNotFound {
            kid: "key-a".to_string(),
            issuer: ISSUER.to_string()
        }
    );
    validator.validate_access_token(&token_b).await.unwrap();
}

#[tokio::test]
async fn test_cached_token_rejected_once_grace_period_ends() {
    let idp = MockIdp::start().await;
    idp.serve_jwks(jwks(&[JWK_A])).await;
    let (loader, validator) =
        setup_with_cache(&idp, Duration::from_millis(300), CacheConfig::default()).await;

    let token_a = sign(TestKey::A, &claims(ISSUER));
    validator.validate_access_token(&token_a).await.unwrap();
    validator.validate_access_token(&token_a).await.unwrap();
    assert_eq!(validator.cache().hits(), 1);

    idp.serve_jwks(jwks(&[JWK_B])).await;
    loader.refresh().await.unwrap();

    // retired but within grace: still answered from the cache
    validator.validate_access_token(&token_a).await.unwrap();
    assert_eq!(validator.cache().hits(), 2);

    tokio::time::sleep(Duration::from_millis(600)).await;
    assert!(loader.key_info("key-a").is_none());

    let err = validator.validate_access_token(&token_a).await.unwrap_err();
    assert_eq!(
        err,
        ValidationError::KeyNotFound {
            kid: "key-a".to_string(),
            issuer: ISSUER.to_string()
        }
    );
    assert_eq!(validator.cache().hits(), 2);
    assert_eq!(validator.cache().len().await, 0);
    assert_eq!(
        validator.security_events().count(FailureKind::KeyNotFound),
        1
    );
}

#[tokio::test]
async fn test_cached_token_rejected_with_zero_grace_period() {
    let idp = MockIdp::start().await;
    idp.serve_jwks(jwks(&[JWK_A])).await;
    let (loader, validator) =
        setup_with_cache(&idp, Duration::ZERO, CacheConfig::default()).await;

    let token_a = sign(TestKey::A, &claims(ISSUER));
    validator.validate_access_token(&token_a).await.unwrap();

    idp.serve_jwks(jwks(&[JWK_B])).await;
    loader.refresh().await.unwrap();

    assert_eq!(
        validator
            .validate_access_token(&token_a)
            .await
            .unwrap_err()
            .kind(),
        FailureKind::KeyNotFound
    );
    validator
        .validate_access_token(&sign(TestKey::B, &claims(ISSUER)))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_zero_grace_period_retires_immediately() {
    let idp = MockIdp::start().await;
    idp.serve_jwks(jwks(&[JWK_A])).await;
    let (loader, validator) = setup(&idp, Duration::ZERO).await;

    let token_a = sign(TestKey::A, &claims(ISSUER));
    validator.validate_access_token(&token_a).await.unwrap();

    idp.serve_jwks(jwks(&[JWK_B])).await;
    loader.refresh().await.unwrap();

    assert_eq!(
        validator
            .validate_access_token(&token_a)
            .await
            .unwrap_err()
            .kind(),
        FailureKind::KeyNotFound
    );
    assert!(loader.generations().retired().is_empty());
}

#[tokio::test]
async fn test_unchanged_refresh_keeps_generations() {
    let idp = MockIdp::start().await;
    idp.serve_jwks(jwks(&[JWK_A])).await;
    let (loader, _validator) = setup(&idp, Duration::from_secs(60)).await;

    loader.ensure_loaded().await;
    idp.serve_jwks(jwks(&[JWK_B])).await;
    loader.refresh().await.unwrap();

    let before = loader.generations();
    assert_eq!(before.retired().len(), 1);
    let retired_at = before.retired()[0].retired_at();

    // same bytes, served fresh without a validator
    for _ in 0..3 {
        assert_eq!(loader.refresh().await.unwrap(), RefreshOutcome::Unchanged);
    }

    let after = loader.generations();
    assert!(Arc::ptr_eq(&before, &after));
    assert_eq!(after.retired().len(), 1);
    assert_eq!(after.retired()[0].retired_at(), retired_at);
    assert!(loader.key_info("key-a").is_some());
}

#[tokio::test]
async fn test_etag_revalidation() {
    let idp = MockIdp::start().await;
    idp.serve_jwks_with_etag(jwks(&[JWK_A]), "\"v1\"").await;
    let (loader, _validator) = setup(&idp, Duration::from_secs(60)).await;

    assert_eq!(loader.ensure_loaded().await, LoaderStatus::Ok);
    assert_eq!(loader.refresh().await.unwrap(), RefreshOutcome::Unchanged);

    let requests = idp.server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 2);
    assert!(!requests[0].headers.contains_key("if-none-match"));
    assert_eq!(
        requests[1].headers.get("if-none-match").unwrap(),
        "\"v1\""
    );
    assert!(loader.key_info("key-a").is_some());
}

#[tokio::test]
async fn test_stale_keys_served_when_endpoint_fails() {
    let idp = MockIdp::start().await;
    idp.serve_jwks(jwks(&[JWK_A])).await;
    let (loader, validator) = setup(&idp, Duration::from_secs(60)).await;

    let token = sign(TestKey::A, &claims(ISSUER));
    validator.validate_access_token(&token).await.unwrap();

    idp.fail_jwks(503).await;
    let err = loader.refresh().await.unwrap_err();
    assert!(matches!(err, KeyLoadError::Status { status: 503, .. }));

    assert_eq!(loader.status(), LoaderStatus::Ok);
    assert!(loader.last_error().is_some());
    validator.validate_access_token(&token).await.unwrap();

    // next success clears the error
    idp.serve_jwks(jwks(&[JWK_A])).await;
    loader.refresh().await.unwrap();
    assert!(loader.last_error().is_none());
}

#[tokio::test]
async fn test_recovers_after_failed_first_load() {
    let idp = MockIdp::start().await;
    idp.fail_jwks(500).await;
    let (loader, validator) = setup(&idp, Duration::from_secs(60)).await;

    let token = sign(TestKey::A, &claims(ISSUER));
    assert_eq!(
        validator
            .validate_access_token(&token)
            .await
            .unwrap_err()
            .kind(),
        FailureKind::KeyNotFound
    );
    assert_eq!(loader.status(), LoaderStatus::Error);

    idp.serve_jwks(jwks(&[JWK_A])).await;
    loader.refresh().await.unwrap();
    assert_eq!(loader.status(), LoaderStatus::Ok);
    validator.validate_access_token(&token).await.unwrap();
}

#[tokio::test]
async fn test_unusable_entries_are_skipped() {
    let idp = MockIdp::start().await;
    idp.serve_jwks(jwks(&[
        r#"{"kty":"RSA","kid":"broken"}"#,
        r#"{"kty":"oct","kid":"shared","k":"c2VjcmV0"}"#,
        r#"{"kty":"RSA","use":"enc","kid":"enc","n":"AQAB","e":"AQAB"}"#,
        JWK_A,
    ]))
    .await;
    let (loader, validator) = setup(&idp, Duration::from_secs(60)).await;

    let token = sign(TestKey::A, &claims(ISSUER));
    validator.validate_access_token(&token).await.unwrap();

    let generations = loader.generations();
    let mut kids: Vec<_> = generations.current().key_ids().collect();
    kids.sort_unstable();
    assert_eq!(kids, vec!["key-a"]);
}

#[tokio::test]
async fn test_background_refresh_picks_up_new_keys() {
    let idp = MockIdp::start().await;
    idp.serve_jwks(jwks(&[JWK_A])).await;
    let config = loader_config(&idp, Duration::from_secs(60))
        .refresh_interval(Duration::from_millis(200));
    let loader = HttpKeyLoader::new(ISSUER, config, Arc::new(PerformanceMonitor::default()))
        .unwrap();

    loader.ensure_loaded().await;
    assert!(loader.is_refreshing());
    assert!(loader.key_info("key-b").is_none());

    idp.serve_jwks(jwks(&[JWK_A, JWK_B])).await;
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert!(loader.key_info("key-b").is_some());

    loader.shutdown();
    assert!(!loader.is_refreshing());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_reads_never_block_during_refresh() {
    let idp = MockIdp::start().await;
    idp.serve_jwks(jwks(&[JWK_A])).await;
    let (loader, _validator) = setup(&idp, Duration::from_secs(60)).await;
    loader.ensure_loaded().await;

    idp.server.reset().await;
    Mock::given(method("GET"))
        .and(path("/jwks"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string(jwks(&[JWK_A, JWK_B]))
                .set_delay(Duration::from_millis(300)),
        )
        .mount(&idp.server)
        .await;

    let refresh = tokio::spawn({
        let loader = Arc::clone(&loader);
        async move { loader.refresh().await }
    });

    let readers: Vec<_> = (0..100)
        .map(|_| {
            let loader = Arc::clone(&loader);
            tokio::spawn(async move {
                let mut observed = Vec::new();
                for _ in 0..50 {
                    observed.push((loader.status(), loader.key_info("key-a").is_some()));
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
                observed
            })
        })
        .collect();

    for reader in readers {
        for (status, has_key) in reader.await.unwrap() {
            assert_eq!(status, LoaderStatus::Ok);
            assert!(has_key);
        }
    }
    refresh.await.unwrap().unwrap();
    assert!(loader.key_info("key-b").is_some());
}

fn status_rank(status: LoaderStatus) -> u8 {
    match status {
        LoaderStatus::Undefined => 0,
        LoaderStatus::Loading | LoaderStatus::Error => 1,
        LoaderStatus::Ok => 2,
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_status_only_moves_forward_during_first_load() {
    let idp = MockIdp::start().await;
    idp.server.reset().await;
    Mock::given(method("GET"))
        .and(path("/jwks"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string(jwks(&[JWK_A]))
                .set_delay(Duration::from_millis(300)),
        )
        .expect(1)
        .mount(&idp.server)
        .await;
    let (loader, _validator) = setup(&idp, Duration::from_secs(60)).await;
    assert_eq!(loader.status(), LoaderStatus::Undefined);

    let load = tokio::spawn({
        let loader = Arc::clone(&loader);
        async move { loader.ensure_loaded().await }
    });
    while loader.status() == LoaderStatus::Undefined {
        tokio::task::yield_now().await;
    }

    let readers: Vec<_> = (0..100)
        .map(|_| {
            let loader = Arc::clone(&loader);
            tokio::spawn(async move {
                let mut observed = Vec::new();
                let mut after_ok = 0;
                for _ in 0..1000 {
                    let status = loader.status();
                    observed.push((status, loader.key_info("key-a").is_some()));
                    if status == LoaderStatus::Ok {
                        after_ok += 1;
                        if after_ok == 5 {
                            break;
                        }
                    }
                    tokio::time::sleep(Duration::from_millis(2)).await;
                }
                observed
            })
        })
        .collect();

    let mut saw_loading = false;
    for reader in readers {
        let observed = reader.await.unwrap();
        for window in observed.windows(2) {
            assert!(status_rank(window[0].0) <= status_rank(window[1].0));
        }
        for (status, has_key) in &observed {
            assert_ne!(*status, LoaderStatus::Undefined);
            assert_ne!(*status, LoaderStatus::Error);
            if *status == LoaderStatus::Ok {
                assert!(has_key);
            }
        }
        saw_loading |= observed.iter().any(|(s, _)| *s == LoaderStatus::Loading);
        assert_eq!(observed.last().unwrap().0, LoaderStatus::Ok);
    }

    assert!(saw_loading);
    assert_eq!(load.await.unwrap(), LoaderStatus::Ok);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_first_use_loads_once() {
    let idp = MockIdp::start().await;
    idp.server.reset().await;
    Mock::given(method("GET"))
        .and(path("/jwks"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string(jwks(&[JWK_A]))
                .set_delay(Duration::from_millis(200)),
        )
        .expect(1)
        .mount(&idp.server)
        .await;
    let (_loader, validator) = setup(&idp, Duration::from_secs(60)).await;
    let validator = Arc::new(validator);

    let tasks: Vec<_> = (0..100)
        .map(|i| {
            let validator = Arc::clone(&validator);
            let mut body = claims(ISSUER);
            body["jti"] = serde_json::json!(i);
            let token = sign(TestKey::A, &body);
            tokio::spawn(async move { validator.validate_access_token(&token).await })
        })
        .collect();

    for task in tasks {
        task.await.unwrap().unwrap();
    }
    assert_eq!(idp.jwks_requests().await, 1);
}

#[tokio::test]
async fn test_discovery_resolves_key_set_location() {
    let idp = MockIdp::start().await;
    idp.serve_jwks(jwks(&[JWK_A])).await;
    idp.serve_discovery(ISSUER).await;

    let issuer = IssuerConfig::builder()
        .issuer(ISSUER)
        .http_loader(
            HttpLoaderConfig::discovery(idp.discovery_url())
                .refresh_interval(Duration::ZERO)
                .retry(RetryConfig::none()),
        )
        .build()
        .unwrap();
    let validator = TokenValidator::builder().issuer(issuer).build().unwrap();

    let statuses = validator.initialize().await;
    assert_eq!(statuses[ISSUER], LoaderStatus::Ok);
    validator
        .validate_access_token(&sign(TestKey::A, &claims(ISSUER)))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_discovery_issuer_mismatch() {
    let idp = MockIdp::start().await;
    idp.serve_jwks(jwks(&[JWK_A])).await;
    idp.serve_discovery("https://evil.example.com").await;

    let issuer = IssuerConfig::builder()
        .issuer(ISSUER)
        .http_loader(
            HttpLoaderConfig::discovery(idp.discovery_url())
                .refresh_interval(Duration::ZERO)
                .retry(RetryConfig::none()),
        )
        .build()
        .unwrap();
    let validator = TokenValidator::builder().issuer(issuer).build().unwrap();

    let err = validator
        .validate_access_token(&sign(TestKey::A, &claims(ISSUER)))
        .await
        .unwrap_err();
    assert_eq!(
        err,
        ValidationError::IssuerMismatch {
            expected: ISSUER.to_string(),
            actual: "https://evil.example.com".to_string()
        }
    );
    assert_eq!(
        validator.loader_status()[ISSUER],
        LoaderStatus::Error
    );
    assert_eq!(
        validator
            .security_events()
            .count(FailureKind::IssuerMismatch),
        1
    );
}

#[tokio::test]
async fn test_shared_loader_status_via_validator() {
    let idp = MockIdp::start().await;
    idp.serve_jwks(jwks(&[JWK_A])).await;
    let (loader, validator) = setup(&idp, Duration::from_secs(60)).await;

    let shared = validator.key_loader(ISSUER).unwrap();
    assert_eq!(shared.status(), LoaderStatus::Undefined);
    loader.ensure_loaded().await;
    assert_eq!(shared.status(), LoaderStatus::Ok);

    validator.shutdown();
    assert!(!loader.is_refreshing());
}
