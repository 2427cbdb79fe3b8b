//! Signed URL authorization tests.
//!
//! Tests verify:
//! - Missing and expired signatures get a 401 challenge
//! - Wrong signatures are denied with 403
//! - Valid signatures, with and without extra parameters, are served
//! - The health check stays public
//! - Admin routes require a signature when one is configured

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use tower::ServiceExt;

use iiif_streamer::delegate::{SignedUrlDelegate, UrlSigner};
use iiif_streamer::pipeline::ImageService;
use iiif_streamer::{create_router, RouterConfig};

use super::test_utils::{counting_codecs, create_test_png, MockResolver};

const SECRET: &str = "integration-secret";
const IMAGE_PATH: &str = "/iiif/3/a.png/full/max/0/default.png";

fn protected_router() -> Router {
    let resolver = MockResolver::new().with_image("a.png", create_test_png(16, 16));
    let (codecs, _) = counting_codecs(Duration::ZERO);
    let signer = UrlSigner::new(SECRET).unwrap();
    let service = ImageService::new(resolver, Arc::new(codecs))
        .with_delegate(Arc::new(SignedUrlDelegate::new(signer)));
    create_router(Arc::new(service), RouterConfig::default())
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs()
}

#[tokio::test]
async fn test_missing_signature_is_challenged() {
    let response = protected_router().oneshot(get(IMAGE_PATH)).await.unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(
        response.headers().get("www-authenticate").unwrap(),
        "Signature realm=\"iiif\""
    );
}

#[tokio::test]
async fn test_valid_signature_is_served() {
    let signer = UrlSigner::new(SECRET).unwrap();
    let url = signer.generate_signed_url("", IMAGE_PATH, Duration::from_secs(300), &[]);

    let response = protected_router().oneshot(get(&url)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers().get("content-type").unwrap(), "image/png");
}

#[tokio::test]
async fn test_signature_covers_extra_params() {
    let signer = UrlSigner::new(SECRET).unwrap();
    let url = signer.generate_signed_url(
        "",
        IMAGE_PATH,
        Duration::from_secs(300),
        &[("user", "alice")],
    );

    let response = protected_router().oneshot(get(&url)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let tampered = url.replace("user=alice", "user=mallory");
    let response = protected_router().oneshot(get(&tampered)).await.unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_signature_for_other_path_is_denied() {
    let signer = UrlSigner::new(SECRET).unwrap();
    let url = signer.generate_signed_url(
        "",
        "/iiif/3/a.png/full/max/90/default.png",
        Duration::from_secs(300),
        &[],
    );
    let query = url.split_once('?').unwrap().1;

    let response = protected_router()
        .oneshot(get(&format!("{}?{}", IMAGE_PATH, query)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_expired_signature_is_challenged() {
    let signer = UrlSigner::new(SECRET).unwrap();
    let expiry = now_secs() - 10;
    let signature = signer.sign_with_expiry(IMAGE_PATH, expiry, &[]);
    let uri = format!("{}?exp={}&sig={}", IMAGE_PATH, expiry, signature);

    let response = protected_router().oneshot(get(&uri)).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_wrong_secret_is_denied() {
    let other = UrlSigner::new("some-other-secret").unwrap();
    let url = other.generate_signed_url("", IMAGE_PATH, Duration::from_secs(300), &[]);

    let response = protected_router().oneshot(get(&url)).await.unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_info_json_requires_signature() {
    let response = protected_router()
        .oneshot(get("/iiif/3/a.png/info.json"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let signer = UrlSigner::new(SECRET).unwrap();
    let url = signer.generate_signed_url(
        "",
        "/iiif/3/a.png/info.json",
        Duration::from_secs(300),
        &[],
    );
    let response = protected_router().oneshot(get(&url)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_health_is_public() {
    let response = protected_router().oneshot(get("/health")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

// =============================================================================
// Admin Routes
// =============================================================================

fn protected_admin_router() -> Router {
    let resolver = MockResolver::new().with_image("a.png", create_test_png(16, 16));
    let (codecs, _) = counting_codecs(Duration::ZERO);
    let signer = UrlSigner::new(SECRET).unwrap();
    let service = ImageService::new(resolver, Arc::new(codecs))
        .with_delegate(Arc::new(SignedUrlDelegate::new(signer.clone())));
    let config = RouterConfig::default()
        .with_admin(true)
        .with_admin_signer(Some(signer));
    create_router(Arc::new(service), config)
}

fn delete(uri: &str) -> Request<Body> {
    Request::builder()
        .method("DELETE")
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

#[tokio::test]
async fn test_admin_requires_signature() {
    let response = protected_admin_router()
        .oneshot(delete("/admin/cache"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert!(response.headers().contains_key("www-authenticate"));

    let response = protected_admin_router()
        .oneshot(delete("/admin/cache/a.png"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_admin_accepts_signed_request() {
    let signer = UrlSigner::new(SECRET).unwrap();
    let url = signer.generate_signed_url("", "/admin/cache", Duration::from_secs(300), &[]);

    let response = protected_admin_router()
        .oneshot(delete(&url))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_admin_rejects_foreign_signature() {
    let other = UrlSigner::new("some-other-secret").unwrap();
    let url = other.generate_signed_url("", "/admin/cache", Duration::from_secs(300), &[]);

    let response = protected_admin_router()
        .oneshot(delete(&url))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    // An image signature does not open the admin routes.
    let image_url = UrlSigner::new(SECRET).unwrap().generate_signed_url(
        "",
        IMAGE_PATH,
        Duration::from_secs(300),
        &[],
    );
    let query = image_url.split_once('?').unwrap().1;
    let response = protected_admin_router()
        .oneshot(delete(&format!("/admin/cache?{}", query)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}
