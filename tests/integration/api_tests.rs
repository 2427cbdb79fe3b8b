//! HTTP API integration tests.
//!
//! Tests verify:
//! - Image and info.json retrieval through the router
//! - Response headers and conditional requests
//! - Error status codes and bodies
//! - Admin cache routes

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use tower::ServiceExt;

use iiif_streamer::cache::MemoryVariantCache;
use iiif_streamer::pipeline::ServicePolicy;
use iiif_streamer::server::{ErrorResponse, HealthResponse, PurgeResponse};
use iiif_streamer::{create_router, RouterConfig};

use super::test_utils::{
    cached_service, create_test_jpeg, create_test_png, dimensions, is_valid_jpeg, is_valid_png,
    wait_for_entries, MockResolver,
};

fn setup(config: RouterConfig) -> (Router, MemoryVariantCache) {
    let resolver = MockResolver::new()
        .with_image("a.png", create_test_png(40, 30))
        .with_image("photos/b.jpg", create_test_jpeg(64, 32));
    let (service, cache, _) = cached_service(resolver, ServicePolicy::default());
    (create_router(service, config), cache)
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

async fn body_bytes(response: axum::response::Response) -> bytes::Bytes {
    response.into_body().collect().await.unwrap().to_bytes()
}

// =============================================================================
// Image Requests
// =============================================================================

#[tokio::test]
async fn test_image_retrieval_success() {
    let (router, _) = setup(RouterConfig::default());

    let response = router
        .oneshot(get("/iiif/3/a.png/full/20,/0/default.png"))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let headers = response.headers();
    assert_eq!(headers.get("content-type").unwrap(), "image/png");
    assert_eq!(headers.get("cache-control").unwrap(), "public, max-age=3600");
    assert_eq!(headers.get("x-cache-hit").unwrap(), "false");
    assert!(headers.contains_key("etag"));
    assert!(headers.contains_key("last-modified"));

    let body = body_bytes(response).await;
    assert!(is_valid_png(&body));
    assert_eq!(dimensions(&body), (20, 15));
}

#[tokio::test]
async fn test_image_jpeg_rotated_gray() {
    let (router, _) = setup(RouterConfig::default());

    let response = router
        .oneshot(get("/iiif/3/a.png/0,0,20,30/max/90/gray.jpg"))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers().get("content-type").unwrap(), "image/jpeg");
    let body = body_bytes(response).await;
    assert!(is_valid_jpeg(&body));
    assert_eq!(dimensions(&body), (30, 20));
}

#[tokio::test]
async fn test_encoded_identifier_with_slash() {
    let (router, _) = setup(RouterConfig::default());

    let response = router
        .oneshot(get("/iiif/3/photos%2Fb.jpg/full/pct:50/0/default.jpg"))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(dimensions(&body_bytes(response).await), (32, 16));
}

#[tokio::test]
async fn test_second_request_is_cache_hit_and_conditional() {
    let (router, cache) = setup(RouterConfig::default());
    let uri = "/iiif/3/a.png/full/max/0/default.png";

    let first = router.clone().oneshot(get(uri)).await.unwrap();
    let etag = first.headers().get("etag").unwrap().clone();
    let first_body = body_bytes(first).await;
    wait_for_entries(&cache, 1).await;

    let second = router.clone().oneshot(get(uri)).await.unwrap();
    assert_eq!(second.headers().get("x-cache-hit").unwrap(), "true");
    assert_eq!(second.headers().get("etag").unwrap(), &etag);
    assert_eq!(body_bytes(second).await, first_body);

    let conditional = Request::builder()
        .uri(uri)
        .header("if-none-match", etag.clone())
        .body(Body::empty())
        .unwrap();
    let response = router.clone().oneshot(conditional).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_MODIFIED);
    assert!(body_bytes(response).await.is_empty());

    let other = Request::builder()
        .uri(uri)
        .header("if-none-match", "\"something-else\"")
        .body(Body::empty())
        .unwrap();
    let response = router.oneshot(other).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_if_modified_since_on_hit() {
    let (router, cache) = setup(RouterConfig::default());
    let uri = "/iiif/3/a.png/full/max/0/default.png";

    let first = router.clone().oneshot(get(uri)).await.unwrap();
    let last_modified = first.headers().get("last-modified").unwrap().clone();
    body_bytes(first).await;
    wait_for_entries(&cache, 1).await;

    let conditional = Request::builder()
        .uri(uri)
        .header("if-modified-since", last_modified)
        .body(Body::empty())
        .unwrap();
    let response = router.oneshot(conditional).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_MODIFIED);
}

// =============================================================================
// Error Handling
// =============================================================================

#[tokio::test]
async fn test_missing_image_returns_404() {
    let (router, _) = setup(RouterConfig::default());

    let response = router
        .oneshot(get("/iiif/3/nope.png/full/max/0/default.png"))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let error: ErrorResponse = serde_json::from_slice(&body_bytes(response).await).unwrap();
    assert_eq!(error.error, "not_found");
    assert_eq!(error.status, Some(404));
}

#[tokio::test]
async fn test_malformed_parameters_return_400() {
    let (router, _) = setup(RouterConfig::default());

    for uri in [
        "/iiif/3/a.png/full/abc/0/default.png",
        "/iiif/3/a.png/full/max/45/default.png",
        "/iiif/3/a.png/full/max/0/sepia.png",
        "/iiif/3/a.png/full/max/0/default.bmp",
        "/iiif/3/a.png/0,0,0,10/max/0/default.png",
    ] {
        let response = router.clone().oneshot(get(uri)).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{}", uri);
    }
}

#[tokio::test]
async fn test_region_outside_image_returns_400() {
    let (router, _) = setup(RouterConfig::default());

    let response = router
        .oneshot(get("/iiif/3/a.png/100,100,10,10/max/0/default.png"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_pixel_limit_returns_403() {
    let resolver = MockResolver::new().with_image("a.png", create_test_png(40, 30));
    let policy = ServicePolicy {
        max_pixels: Some(100),
        ..ServicePolicy::default()
    };
    let (service, _, _) = cached_service(resolver, policy);
    let router = create_router(service, RouterConfig::default());

    let response = router
        .oneshot(get("/iiif/3/a.png/full/max/0/default.png"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_unsupported_source_returns_415() {
    let resolver = MockResolver::new().with_image("notes.txt", b"plain text".to_vec());
    let (service, _, _) = cached_service(resolver, ServicePolicy::default());
    let router = create_router(service, RouterConfig::default());

    let response = router
        .oneshot(get("/iiif/3/notes.txt/full/max/0/default.png"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);
}

// =============================================================================
// Info and Health
// =============================================================================

#[tokio::test]
async fn test_info_json() {
    let (router, _) = setup(RouterConfig::default());

    let request = Request::builder()
        .uri("/iiif/3/photos%2Fb.jpg/info.json")
        .header("host", "images.example.org")
        .body(Body::empty())
        .unwrap();
    let response = router.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert!(response
        .headers()
        .get("content-type")
        .unwrap()
        .to_str()
        .unwrap()
        .starts_with("application/ld+json"));
    assert!(response.headers().contains_key("last-modified"));

    let json: serde_json::Value = serde_json::from_slice(&body_bytes(response).await).unwrap();
    assert_eq!(json["@context"], "http://iiif.io/api/image/3/context.json");
    assert_eq!(json["type"], "ImageService3");
    assert_eq!(json["id"], "http://images.example.org/iiif/3/photos%2Fb.jpg");
    assert_eq!(json["width"], 64);
    assert_eq!(json["height"], 32);
}

#[tokio::test]
async fn test_info_json_uses_public_url() {
    let (router, _) =
        setup(RouterConfig::default().with_public_url(Some("https://cdn.example.org".into())));

    let response = router
        .oneshot(get("/iiif/3/a.png/info.json"))
        .await
        .unwrap();
    let json: serde_json::Value = serde_json::from_slice(&body_bytes(response).await).unwrap();
    assert_eq!(json["id"], "https://cdn.example.org/iiif/3/a.png");
}

#[tokio::test]
async fn test_base_uri_redirects_to_info() {
    let (router, _) = setup(RouterConfig::default());

    let response = router.oneshot(get("/iiif/3/a.png")).await.unwrap();
    assert_eq!(response.status(), StatusCode::SEE_OTHER);
    assert_eq!(
        response.headers().get("location").unwrap(),
        "/iiif/3/a.png/info.json"
    );
}

#[tokio::test]
async fn test_health_reports_used_sources() {
    let (router, _) = setup(RouterConfig::default());

    let response = router.clone().oneshot(get("/health")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let health: HealthResponse = serde_json::from_slice(&body_bytes(response).await).unwrap();
    assert_eq!(health.status, "healthy");
    assert!(health.sources.is_empty());

    let response = router
        .clone()
        .oneshot(get("/iiif/3/a.png/info.json"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = router.oneshot(get("/health")).await.unwrap();
    let health: HealthResponse = serde_json::from_slice(&body_bytes(response).await).unwrap();
    assert_eq!(health.sources, vec!["mock".to_string()]);
}

// =============================================================================
// Admin Routes
// =============================================================================

#[tokio::test]
async fn test_admin_routes_hidden_by_default() {
    let (router, _) = setup(RouterConfig::default());

    let request = Request::builder()
        .method("DELETE")
        .uri("/admin/cache")
        .body(Body::empty())
        .unwrap();
    let response = router.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_admin_purge_identifier() {
    let (router, cache) = setup(RouterConfig::default().with_admin(true));

    for size in ["max", "10,"] {
        let uri = format!("/iiif/3/a.png/full/{}/0/default.png", size);
        let response = router.clone().oneshot(get(&uri)).await.unwrap();
        body_bytes(response).await;
    }
    wait_for_entries(&cache, 2).await;

    let request = Request::builder()
        .method("DELETE")
        .uri("/admin/cache/a.png")
        .body(Body::empty())
        .unwrap();
    let response = router.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let purge: PurgeResponse = serde_json::from_slice(&body_bytes(response).await).unwrap();
    assert_eq!(purge.purged, Some(2));
    assert!(cache.is_empty().await);

    let request = Request::builder()
        .method("POST")
        .uri("/admin/cache/purge-invalid")
        .body(Body::empty())
        .unwrap();
    let response = router.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_admin_purge_all() {
    let resolver = MockResolver::new().with_image("a.png", create_test_png(8, 8));
    let (service, cache, _) = cached_service(resolver, ServicePolicy::default());
    let router = create_router(service, RouterConfig::default().with_admin(true));

    let response = router
        .clone()
        .oneshot(get("/iiif/3/a.png/full/max/0/default.png"))
        .await
        .unwrap();
    body_bytes(response).await;
    wait_for_entries(&cache, 1).await;

    let request = Request::builder()
        .method("DELETE")
        .uri("/admin/cache")
        .body(Body::empty())
        .unwrap();
    let response = router.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(cache.is_empty().await);
}
