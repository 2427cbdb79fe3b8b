//! Test utilities for integration tests.
//!
//! Provides an in-memory source resolver, a decoder that counts decodes,
//! an info cache that always fails, and image fixtures.

use async_trait::async_trait;
use bytes::Bytes;
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use std::collections::HashMap;
use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::RwLock;

use iiif_streamer::cache::MemoryVariantCache;
use iiif_streamer::codec::{
    CodecRegistry, DecodeRequest, DecodedImage, Decoder, Metadata, RasterDecoder, SourceFormat,
};
use iiif_streamer::error::{CacheError, CodecError, IoError};
use iiif_streamer::info::{Info, InfoCache};
use iiif_streamer::operation::{Dimension, Identifier};
use iiif_streamer::pipeline::{ImageService, ServicePolicy};
use iiif_streamer::source::{Source, SourceResolver, StatResult};

// =============================================================================
// Mock Source
// =============================================================================

#[derive(Clone)]
struct StoredImage {
    data: Bytes,
    last_modified: SystemTime,
}

/// In-memory resolver whose images can be replaced or removed mid-test.
#[derive(Clone, Default)]
pub struct MockResolver {
    images: Arc<RwLock<HashMap<String, StoredImage>>>,
    read_count: Arc<AtomicUsize>,
}

impl MockResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an image modified an hour ago.
    pub fn with_image(self, identifier: &str, data: Vec<u8>) -> Self {
        let stored = StoredImage {
            data: Bytes::from(data),
            last_modified: SystemTime::now() - Duration::from_secs(3600),
        };
        self.images
            .try_write()
            .unwrap()
            .insert(identifier.to_string(), stored);
        self
    }

    /// Replace an image with new content and modification time.
    pub async fn replace(&self, identifier: &str, data: Vec<u8>, last_modified: SystemTime) {
        self.images.write().await.insert(
            identifier.to_string(),
            StoredImage {
                data: Bytes::from(data),
                last_modified,
            },
        );
    }

    pub async fn remove(&self, identifier: &str) {
        self.images.write().await.remove(identifier);
    }

    /// Number of full source reads so far.
    pub fn read_count(&self) -> usize {
        self.read_count.load(Ordering::SeqCst)
    }
}

/// A snapshot of one mock image taken at resolve time.
pub struct MockSource {
    location: String,
    image: Option<StoredImage>,
    read_count: Arc<AtomicUsize>,
}

#[async_trait]
impl Source for MockSource {
    async fn stat(&self) -> Result<StatResult, IoError> {
        match &self.image {
            Some(image) => Ok(StatResult {
                last_modified: Some(image.last_modified),
                length: Some(image.data.len() as u64),
            }),
            None => Err(IoError::NotFound(self.location.clone())),
        }
    }

    async fn read(&self) -> Result<Bytes, IoError> {
        self.read_count.fetch_add(1, Ordering::SeqCst);
        match &self.image {
            Some(image) => Ok(image.data.clone()),
            None => Err(IoError::NotFound(self.location.clone())),
        }
    }

    fn location(&self) -> &str {
        &self.location
    }
}

#[async_trait]
impl SourceResolver for MockResolver {
    type Source = MockSource;

    fn kind(&self) -> &'static str {
        "mock"
    }

    async fn resolve(&self, identifier: &Identifier) -> Result<MockSource, IoError> {
        let image = self.images.read().await.get(identifier.as_str()).cloned();
        Ok(MockSource {
            location: format!("mock://{}", identifier),
            image,
            read_count: Arc::clone(&self.read_count),
        })
    }
}

// =============================================================================
// Counting Decoder
// =============================================================================

/// Wraps the raster decoder and counts calls to `decode`.
pub struct CountingDecoder {
    inner: RasterDecoder,
    decodes: Arc<AtomicUsize>,
    delay: Duration,
}

impl Decoder for CountingDecoder {
    fn format(&self) -> SourceFormat {
        self.inner.format()
    }

    fn size(&mut self, image_index: usize) -> Result<Dimension, CodecError> {
        self.inner.size(image_index)
    }

    fn read_metadata(&mut self, image_index: usize) -> Result<Metadata, CodecError> {
        self.inner.read_metadata(image_index)
    }

    fn decode(
        &mut self,
        image_index: usize,
        request: &DecodeRequest,
    ) -> Result<DecodedImage, CodecError> {
        self.decodes.fetch_add(1, Ordering::SeqCst);
        // Runs on a blocking thread.
        std::thread::sleep(self.delay);
        self.inner.decode(image_index, request)
    }
}

/// Default codecs with PNG and JPEG decoding routed through
/// [`CountingDecoder`]. Returns the registry and the decode counter.
pub fn counting_codecs(delay: Duration) -> (CodecRegistry, Arc<AtomicUsize>) {
    let decodes = Arc::new(AtomicUsize::new(0));
    let mut registry = CodecRegistry::with_defaults();
    for format in [SourceFormat::Png, SourceFormat::Jpeg] {
        let counter = Arc::clone(&decodes);
        registry.register_decoder(
            format,
            move |format: SourceFormat, data: Bytes| -> Result<Box<dyn Decoder>, CodecError> {
                Ok(Box::new(CountingDecoder {
                    inner: RasterDecoder::new(format, data),
                    decodes: Arc::clone(&counter),
                    delay,
                }))
            },
        );
    }
    (registry, decodes)
}

// =============================================================================
// Failing Info Cache
// =============================================================================

/// An info cache whose backend is always down.
#[derive(Default)]
pub struct FailingInfoCache {
    pub calls: AtomicUsize,
}

#[async_trait]
impl InfoCache for FailingInfoCache {
    async fn get(&self, _identifier: &Identifier) -> Result<Option<Info>, CacheError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(CacheError::Io("backend unavailable".to_string()))
    }

    async fn put(&self, _identifier: &Identifier, _info: &Info) -> Result<(), CacheError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(CacheError::Io("backend unavailable".to_string()))
    }

    async fn purge(&self, _identifier: &Identifier) -> Result<(), CacheError> {
        Err(CacheError::Io("backend unavailable".to_string()))
    }

    async fn purge_all(&self) -> Result<(), CacheError> {
        Err(CacheError::Io("backend unavailable".to_string()))
    }
}

// =============================================================================
// Service Builders
// =============================================================================

/// A service over `resolver` with a memory variant cache and counting
/// codecs. Returns the service, its cache and the decode counter.
pub fn cached_service(
    resolver: MockResolver,
    policy: ServicePolicy,
) -> (
    Arc<ImageService<MockResolver>>,
    MemoryVariantCache,
    Arc<AtomicUsize>,
) {
    let (codecs, decodes) = counting_codecs(Duration::ZERO);
    let cache = MemoryVariantCache::new();
    let service = ImageService::new(resolver, Arc::new(codecs))
        .with_variant_cache(Arc::new(cache.clone()))
        .with_policy(policy);
    (Arc::new(service), cache, decodes)
}

/// Wait until the cache holds `count` entries. Variants are committed
/// after the body is fully written, slightly after the client sees it.
pub async fn wait_for_entries(cache: &MemoryVariantCache, count: usize) {
    for _ in 0..200 {
        if cache.len().await >= count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!(
        "cache never reached {} entries (has {})",
        count,
        cache.len().await
    );
}

// =============================================================================
// Image Fixtures
// =============================================================================

/// Create a PNG with a horizontal gradient.
pub fn create_test_png(width: u32, height: u32) -> Vec<u8> {
    encode(gradient(width, height), ImageFormat::Png)
}

/// Create a JPEG with a horizontal gradient.
pub fn create_test_jpeg(width: u32, height: u32) -> Vec<u8> {
    encode(gradient(width, height), ImageFormat::Jpeg)
}

fn gradient(width: u32, height: u32) -> DynamicImage {
    DynamicImage::ImageRgb8(RgbImage::from_fn(width, height, |x, _| {
        Rgb([(x * 255 / width.max(1)) as u8, 64, 128])
    }))
}

fn encode(image: DynamicImage, format: ImageFormat) -> Vec<u8> {
    let mut buf = Cursor::new(Vec::new());
    image.write_to(&mut buf, format).unwrap();
    buf.into_inner()
}

/// Dimensions of an encoded image.
pub fn dimensions(data: &[u8]) -> (u32, u32) {
    let image = image::load_from_memory(data).unwrap();
    (image.width(), image.height())
}

/// Check if data starts with the PNG signature.
pub fn is_valid_png(data: &[u8]) -> bool {
    data.starts_with(b"\x89PNG\r\n\x1a\n")
}

/// Check if data is a complete JPEG stream.
pub fn is_valid_jpeg(data: &[u8]) -> bool {
    data.len() > 4 && data.starts_with(&[0xFF, 0xD8]) && data.ends_with(&[0xFF, 0xD9])
}
