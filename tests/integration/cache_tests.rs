//! Cache behavior tests driven through the image service.
//!
//! Tests verify:
//! - Concurrent misses for one variant decode the source once
//! - Hits skip decoding and report the cached pipeline path
//! - Cached variants older than their source are regenerated
//! - Info cache failures never fail a request
//! - Processing limits reject requests before decoding
//! - Purging invalid entries keeps valid ones

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use iiif_streamer::cache::{FilesystemVariantCache, MemoryVariantCache, VariantCache};
use iiif_streamer::delegate::ClientContext;
use iiif_streamer::error::ImageError;
use iiif_streamer::info::{InfoCache, MemoryInfoCache};
use iiif_streamer::operation::Identifier;
use iiif_streamer::pipeline::{
    ImageRequest, ImageService, NoopObserver, PipelineState, ServicePolicy,
};

use super::test_utils::{
    cached_service, counting_codecs, create_test_jpeg, create_test_png, dimensions,
    is_valid_png, wait_for_entries, FailingInfoCache, MockResolver,
};

fn client(path: &str) -> ClientContext {
    ClientContext::new(path, Vec::new())
}

fn full_png(identifier: &str) -> ImageRequest {
    ImageRequest::parse(identifier, "full", "max", "0", "default.png").unwrap()
}

// =============================================================================
// Single Generation
// =============================================================================

#[tokio::test]
async fn test_concurrent_misses_decode_once() {
    let resolver = MockResolver::new().with_image("a.png", create_test_png(64, 48));
    let (codecs, decodes) = counting_codecs(Duration::from_millis(100));
    let cache = MemoryVariantCache::new();
    let service = Arc::new(
        ImageService::new(resolver, Arc::new(codecs)).with_variant_cache(Arc::new(cache.clone())),
    );

    let request = ImageRequest::parse("a.png", "full", "32,", "0", "default.png").unwrap();
    let mut tasks = Vec::new();
    for _ in 0..8 {
        let service = Arc::clone(&service);
        let request = request.clone();
        tasks.push(tokio::spawn(async move {
            let response = service
                .handle(&request, client("/a"), &mut NoopObserver)
                .await
                .unwrap();
            let cache_hit = response.cache_hit;
            let body = response.body.collect().await.unwrap();
            (cache_hit, body)
        }));
    }

    let mut generated = 0;
    let mut first_body = None;
    for task in tasks {
        let (cache_hit, body) = task.await.unwrap();
        if !cache_hit {
            generated += 1;
        }
        assert!(is_valid_png(&body));
        assert_eq!(dimensions(&body), (32, 24));
        match &first_body {
            None => first_body = Some(body),
            Some(first) => assert_eq!(first, &body),
        }
    }

    assert_eq!(generated, 1);
    assert_eq!(decodes.load(Ordering::SeqCst), 1);
    wait_for_entries(&cache, 1).await;
    for _ in 0..200 {
        if service.pending_generations() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(service.pending_generations(), 0);
    assert_eq!(cache.len().await, 1);
}

#[tokio::test]
async fn test_hit_skips_decoding_and_streams_cached() {
    let resolver = MockResolver::new().with_image("a.png", create_test_png(40, 30));
    let (service, cache, decodes) = cached_service(resolver, ServicePolicy::default());
    let request = full_png("a.png");

    let first = service
        .handle(&request, client("/a"), &mut NoopObserver)
        .await
        .unwrap();
    assert!(!first.cache_hit);
    assert!(first.states.contains(&PipelineState::Decoding));
    let generated = first.body.collect().await.unwrap();
    wait_for_entries(&cache, 1).await;

    let second = service
        .handle(&request, client("/a"), &mut NoopObserver)
        .await
        .unwrap();
    assert!(second.cache_hit);
    assert_eq!(
        second.states,
        vec![
            PipelineState::ResolvingSource,
            PipelineState::CheckingVariantCache,
            PipelineState::StreamingCached,
            PipelineState::Done,
        ]
    );
    assert_eq!(second.etag, first.etag);
    assert_eq!(second.body.collect().await.unwrap(), generated);
    assert_eq!(decodes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_noop_variations_share_one_entry() {
    let resolver = MockResolver::new().with_image("a.png", create_test_png(40, 30));
    let (service, cache, decodes) = cached_service(resolver, ServicePolicy::default());

    let explicit =
        ImageRequest::parse("a.png", "pct:0,0,100,100", "pct:100", "0", "default.png").unwrap();
    let response = service
        .handle(&full_png("a.png"), client("/a"), &mut NoopObserver)
        .await
        .unwrap();
    response.body.collect().await.unwrap();
    wait_for_entries(&cache, 1).await;

    let response = service
        .handle(&explicit, client("/a"), &mut NoopObserver)
        .await
        .unwrap();
    assert!(response.cache_hit);
    assert_eq!(decodes.load(Ordering::SeqCst), 1);
}

// =============================================================================
// Staleness
// =============================================================================

#[tokio::test]
async fn test_modified_source_invalidates_variant() {
    let resolver = MockResolver::new().with_image("a.png", create_test_png(40, 30));
    let (service, cache, decodes) = cached_service(resolver.clone(), ServicePolicy::default());
    let request = full_png("a.png");

    let response = service
        .handle(&request, client("/a"), &mut NoopObserver)
        .await
        .unwrap();
    response.body.collect().await.unwrap();
    wait_for_entries(&cache, 1).await;

    resolver
        .replace(
            "a.png",
            create_test_png(20, 10),
            SystemTime::now() + Duration::from_secs(60),
        )
        .await;

    let response = service
        .handle(&request, client("/a"), &mut NoopObserver)
        .await
        .unwrap();
    assert!(!response.cache_hit);
    let body = response.body.collect().await.unwrap();
    assert_eq!(dimensions(&body), (20, 10));
    assert_eq!(decodes.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_modified_source_refreshes_cached_info() {
    let resolver = MockResolver::new().with_image("a.png", create_test_png(40, 30));
    let (codecs, decodes) = counting_codecs(Duration::ZERO);
    let variants = MemoryVariantCache::new();
    let infos = Arc::new(MemoryInfoCache::new());
    let service = ImageService::new(resolver.clone(), Arc::new(codecs))
        .with_variant_cache(Arc::new(variants.clone()))
        .with_info_cache(infos.clone());
    let request = full_png("a.png");

    let response = service
        .handle(&request, client("/a"), &mut NoopObserver)
        .await
        .unwrap();
    response.body.collect().await.unwrap();
    wait_for_entries(&variants, 1).await;
    for _ in 0..200 {
        if !infos.is_empty().await {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(infos.len().await, 1);

    resolver
        .replace(
            "a.png",
            create_test_png(20, 10),
            SystemTime::now() + Duration::from_secs(60),
        )
        .await;

    let response = service
        .handle(&request, client("/a"), &mut NoopObserver)
        .await
        .unwrap();
    assert!(!response.cache_hit);
    let body = response.body.collect().await.unwrap();
    assert_eq!(dimensions(&body), (20, 10));
    assert_eq!(decodes.load(Ordering::SeqCst), 2);

    let info = service
        .info(&Identifier::new("a.png"), client("/a"))
        .await
        .unwrap();
    assert_eq!(info.info.full_size().width, 20);
    for _ in 0..200 {
        let cached = infos.get(&Identifier::new("a.png")).await.unwrap();
        if cached.map(|info| info.full_size().width) == Some(20) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("info cache kept the old dimensions");
}

#[tokio::test]
async fn test_purge_invalid_keeps_valid_entries() {
    let resolver = MockResolver::new()
        .with_image("a.png", create_test_png(16, 16))
        .with_image("b.jpg", create_test_jpeg(16, 16));
    let (service, cache, _) = cached_service(resolver.clone(), ServicePolicy::default());

    for identifier in ["a.png", "b.jpg"] {
        let response = service
            .handle(&full_png(identifier), client("/"), &mut NoopObserver)
            .await
            .unwrap();
        response.body.collect().await.unwrap();
    }
    wait_for_entries(&cache, 2).await;

    resolver.remove("b.jpg").await;
    let report = service.purge_invalid().await.unwrap();

    assert_eq!(report.removed, 1);
    assert!(report.invalid_identifiers.contains(&Identifier::new("b.jpg")));
    let remaining = cache.entries().await.unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].identifier, Identifier::new("a.png"));
}

#[tokio::test]
async fn test_purge_identifier_removes_its_variants() {
    let resolver = MockResolver::new().with_image("a.png", create_test_png(16, 16));
    let (service, cache, _) = cached_service(resolver, ServicePolicy::default());

    for size in ["max", "8,"] {
        let request = ImageRequest::parse("a.png", "full", size, "0", "default.png").unwrap();
        let response = service
            .handle(&request, client("/"), &mut NoopObserver)
            .await
            .unwrap();
        response.body.collect().await.unwrap();
    }
    wait_for_entries(&cache, 2).await;

    let removed = service
        .purge_identifier(&Identifier::new("a.png"))
        .await
        .unwrap();
    assert_eq!(removed, 2);
    assert!(cache.is_empty().await);
}

// =============================================================================
// Fallbacks and Limits
// =============================================================================

#[tokio::test]
async fn test_failing_info_cache_still_serves() {
    let resolver = MockResolver::new().with_image("a.png", create_test_png(40, 30));
    let (codecs, _) = counting_codecs(Duration::ZERO);
    let info_cache = Arc::new(FailingInfoCache::default());
    let service = ImageService::new(resolver, Arc::new(codecs))
        .with_info_cache(info_cache.clone());

    let response = service
        .handle(&full_png("a.png"), client("/a"), &mut NoopObserver)
        .await
        .unwrap();
    let body = response.body.collect().await.unwrap();
    assert_eq!(dimensions(&body), (40, 30));

    let info = service
        .info(&Identifier::new("a.png"), client("/a"))
        .await
        .unwrap();
    assert_eq!(info.info.full_size().width, 40);
    assert!(info_cache.calls.load(Ordering::SeqCst) >= 2);
}

#[tokio::test]
async fn test_max_pixels_forbidden_before_decode() {
    let resolver = MockResolver::new().with_image("a.png", create_test_png(40, 30));
    let policy = ServicePolicy {
        max_pixels: Some(100),
        ..ServicePolicy::default()
    };
    let (service, cache, decodes) = cached_service(resolver, policy);

    let result = service
        .handle(&full_png("a.png"), client("/a"), &mut NoopObserver)
        .await;
    assert!(matches!(result, Err(ImageError::Forbidden { .. })));
    assert_eq!(decodes.load(Ordering::SeqCst), 0);
    assert!(cache.is_empty().await);

    // A small enough derivative passes.
    let small = ImageRequest::parse("a.png", "full", "10,", "0", "default.png").unwrap();
    let response = service
        .handle(&small, client("/a"), &mut NoopObserver)
        .await
        .unwrap();
    assert_eq!(dimensions(&response.body.collect().await.unwrap()), (10, 8));
}

#[tokio::test]
async fn test_max_scale_forbids_upscaling() {
    let resolver = MockResolver::new().with_image("a.png", create_test_png(40, 30));
    let policy = ServicePolicy {
        max_scale: Some(1.0),
        ..ServicePolicy::default()
    };
    let (service, _, decodes) = cached_service(resolver, policy);

    let request = ImageRequest::parse("a.png", "full", "^80,", "0", "default.png").unwrap();
    let result = service
        .handle(&request, client("/a"), &mut NoopObserver)
        .await;
    assert!(matches!(result, Err(ImageError::Forbidden { .. })));
    assert_eq!(decodes.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_default_policy_bounds_upscaling() {
    let resolver = MockResolver::new().with_image("a.png", create_test_png(40, 30));
    let (service, cache, decodes) = cached_service(resolver, ServicePolicy::default());

    // The last one keeps the width and stretches only the height.
    for size in ["^100000,100000", "^!100000,100000", "^40,100000"] {
        let request = ImageRequest::parse("a.png", "full", size, "0", "default.png").unwrap();
        let result = service
            .handle(&request, client("/a"), &mut NoopObserver)
            .await;
        assert!(
            matches!(result, Err(ImageError::Forbidden { .. })),
            "{} was not refused",
            size
        );
    }
    assert_eq!(decodes.load(Ordering::SeqCst), 0);
    assert!(cache.is_empty().await);
}

#[tokio::test]
async fn test_missing_source_is_not_found() {
    let (service, _, _) = cached_service(MockResolver::new(), ServicePolicy::default());
    let result = service
        .handle(&full_png("missing.png"), client("/"), &mut NoopObserver)
        .await;
    assert!(matches!(result, Err(ImageError::NotFound { .. })));
}

// =============================================================================
// Filesystem Backend
// =============================================================================

#[tokio::test]
async fn test_filesystem_variant_cache_serves_hits() {
    let dir = tempfile::tempdir().unwrap();
    let resolver = MockResolver::new().with_image("a.png", create_test_png(24, 24));
    let (codecs, decodes) = counting_codecs(Duration::ZERO);
    let cache: Arc<dyn VariantCache> = Arc::new(FilesystemVariantCache::new(dir.path()));
    let service = ImageService::new(resolver, Arc::new(codecs)).with_variant_cache(cache.clone());
    let request = ImageRequest::parse("a.png", "full", "12,", "90", "default.png").unwrap();

    let response = service
        .handle(&request, client("/a"), &mut NoopObserver)
        .await
        .unwrap();
    let generated = response.body.collect().await.unwrap();
    for _ in 0..200 {
        if !cache.entries().await.unwrap().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let response = service
        .handle(&request, client("/a"), &mut NoopObserver)
        .await
        .unwrap();
    assert!(response.cache_hit);
    assert_eq!(response.body.collect().await.unwrap(), generated);
    assert_eq!(decodes.load(Ordering::SeqCst), 1);
}
