use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::routing::get;
use axum::{Extension, Router};
use http_body_util::BodyExt;
use tower::ServiceExt;

use s3tlsproxy::cache::CacheEngine;
use s3tlsproxy::config::Config;
use s3tlsproxy::handlers;
use s3tlsproxy::metadata::MetadataStore;
use s3tlsproxy::origin::OriginClient;
use s3tlsproxy::security::SecurityLayer;
use s3tlsproxy::sig_middleware::SigLayer;
use s3tlsproxy::signer::Signer;

/// Builds the full request pipeline against a throwaway metadata store.
/// Leaks its backing temp directory for the test process's lifetime: these
/// tests never touch the filesystem through the cache engine (purge/shrink
/// against an always-empty store), so there is nothing to clean up, and
/// leaking avoids a `TempDir` drop racing a live `sled::Db` handle.
async fn build_app(config: Arc<Config>, strict: bool) -> Router {
    let db_dir = tempfile::tempdir().unwrap().into_path();
    let metadata = Arc::new(MetadataStore::open(&db_dir).await.unwrap());
    let origin = Arc::new(OriginClient::new().unwrap());
    let cache = Arc::new(CacheEngine::new(config.clone(), metadata, origin));
    let signer = Arc::new(Signer::new(config.secret_key.clone()));

    let maintenance = Router::new()
        .route("/__s3p/purge", get(handlers::purge))
        .route("/__s3p/shrink", get(handlers::shrink))
        .route_layer(SigLayer::new(signer, strict));

    Router::new()
        .merge(maintenance)
        .fallback(handlers::serve_cache)
        .layer(Extension(cache))
        .layer(Extension(config.clone()))
        .layer(SecurityLayer::new(config))
}

fn test_config() -> Arc<Config> {
    let toml = r#"
        cacheDir = "/tmp/s3tlsproxy-test-cache"
        DBFilename = "/tmp/s3tlsproxy-test-db"
        secretKey = "topsecret"

        [hosts."example.org"]
        bucket = "example-bucket"
        accessKey = "ak"
        secretKey = "sk"
    "#;
    Arc::new(Config::parse(toml).unwrap())
}

#[tokio::test]
async fn unsigned_maintenance_request_is_silently_rejected_by_default() {
    let config = test_config();
    let app = build_app(config, false).await;

    let request = Request::builder()
        .uri("/__s3p/shrink")
        .header("host", "example.org")
        .body(Body::empty())
        .unwrap();

    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = response.into_body().collect().await.unwrap().to_bytes();
    assert!(body.is_empty());
}

#[tokio::test]
async fn validly_signed_purge_request_reaches_the_handler() {
    let config = test_config();
    let signer = Signer::new(config.secret_key.clone());
    let signed = signer
        .sign_url(
            "https://example.org/__s3p/purge?prefix=assets",
            "GET",
            Duration::from_secs(60),
            &[],
        )
        .unwrap();
    let uri: axum::http::Uri = signed.parse().unwrap();
    let path_and_query = uri.path_and_query().unwrap().as_str().to_string();

    let app = build_app(config, true).await;
    let request = Request::builder()
        .uri(path_and_query)
        .header("host", "example.org")
        .body(Body::empty())
        .unwrap();

    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&body[..], b"purged 0 entries\n");
}

#[tokio::test]
async fn request_for_unconfigured_host_is_rejected_by_security_layer() {
    let config = test_config();
    let app = build_app(config, false).await;

    let request = Request::builder()
        .uri("/anything.html")
        .header("host", "not-configured.example")
        .body(Body::empty())
        .unwrap();

    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn security_headers_are_set_on_responses() {
    let config = test_config();
    let signer = Signer::new(config.secret_key.clone());
    let signed = signer
        .sign_url("https://example.org/__s3p/shrink", "GET", Duration::from_secs(60), &[])
        .unwrap();
    let uri: axum::http::Uri = signed.parse().unwrap();
    let path_and_query = uri.path_and_query().unwrap().as_str().to_string();

    let app = build_app(config, true).await;
    let request = Request::builder()
        .uri(path_and_query)
        .header("host", "example.org")
        .body(Body::empty())
        .unwrap();

    let response = app.oneshot(request).await.unwrap();
    let headers = response.headers();
    assert!(headers.get("strict-transport-security").is_some());
    assert_eq!(headers.get("x-frame-options").unwrap(), "DENY");
    assert_eq!(headers.get("x-content-type-options").unwrap(), "nosniff");
}
