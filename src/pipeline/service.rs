//! The image request orchestrator.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                           ImageService                               │
//! │                                                                      │
//! │  authorize_before_access ─► resolve + stat ─► authorize              │
//! │                                   │                                  │
//! │                                   ▼                                  │
//! │                    OperationList (canonical key)                     │
//! │                                   │                                  │
//! │                 variant cache ────┤ hit ──► stream cached bytes      │
//! │                                   │ miss                             │
//! │                          per-key lock, re-check                      │
//! │                                   │                                  │
//! │   info cache / read ─► plan ─► limits ─► decode ─► process          │
//! │                                                        │             │
//! │                                   encode ─► TeeWriter ─┴► client     │
//! │                                                        └► cache      │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Concurrent misses for one key collapse into a single generation: the
//! first request holds the key's lock until its entry is committed, the
//! others wait and then stream the published entry.
//!
//! A generated response is returned once the encoder has produced its first
//! chunk. Outputs smaller than one chunk are therefore complete and any
//! encoding failure becomes an error response. A larger output that fails
//! after its first chunk ends the body early instead, since its headers are
//! already on their way.

use std::sync::Arc;
use std::time::SystemTime;

use bytes::Bytes;
use tracing::{debug, error, info, warn};

use crate::cache::{
    CachedVariant, KeyGuard, KeyLockTable, PurgeReport, SourceState, VariantCache,
};
use crate::codec::{CodecRegistry, DecodeRequest, Decoder};
use crate::delegate::{ClientContext, DefaultDelegate, Delegate, DelegateContext};
use crate::error::{CacheError, CodecError, ImageError};
use crate::info::{Info, InfoCache};
use crate::operation::{
    Identifier, OperationList, Overlay, ProcessingPlan, Redact, ScaleConstraint,
};
use crate::source::{Source, SourceResolver, SourceUsage, StatResult};

use super::processor;
use super::request::ImageRequest;
use super::state::{PipelineState, StateTracker};
use super::stream::{ImageBody, TeeWriter};

/// Default JPEG quality of derivative images.
pub const DEFAULT_JPEG_QUALITY: u8 = 80;

/// Default largest output area: 10000x10000.
pub const DEFAULT_MAX_PIXELS: u64 = 100_000_000;

/// Default largest output-to-source scale. Upscaling is refused.
pub const DEFAULT_MAX_SCALE: f64 = 1.0;

// =============================================================================
// Policy
// =============================================================================

/// Where overlays come from.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum OverlaySource {
    #[default]
    Disabled,
    /// The same overlay on every image.
    Static(Overlay),
    /// Asked of the delegate per request.
    Delegate,
}

/// Request processing policy, fixed at startup.
#[derive(Debug, Clone)]
pub struct ServicePolicy {
    /// Stat the source before consulting the variant cache.
    pub resolve_first: bool,
    /// Largest output area, in pixels.
    pub max_pixels: Option<u64>,
    /// Largest output-to-source scale.
    pub max_scale: Option<f64>,
    pub jpeg_quality: u8,
    pub overlay: OverlaySource,
    /// Outputs smaller than this in either dimension get no overlay.
    pub overlay_min_width: u32,
    pub overlay_min_height: u32,
}

impl Default for ServicePolicy {
    fn default() -> Self {
        Self {
            resolve_first: true,
            max_pixels: Some(DEFAULT_MAX_PIXELS),
            max_scale: Some(DEFAULT_MAX_SCALE),
            jpeg_quality: DEFAULT_JPEG_QUALITY,
            overlay: OverlaySource::Disabled,
            overlay_min_width: 0,
            overlay_min_height: 0,
        }
    }
}

// =============================================================================
// Observer
// =============================================================================

/// Synchronous notifications issued while a request is handled.
///
/// They let the caller capture facts (e.g. for response headers) before
/// the body starts; they have no influence on the pipeline.
pub trait RequestObserver: Send {
    fn source_accessed(&mut self, _stat: &StatResult) {}

    fn info_available(&mut self, _info: &Info) {}

    fn will_stream_image_from_variant_cache(&mut self, _stat: Option<&StatResult>) {}

    fn will_process_image(&mut self, _info: &Info) {}
}

/// Observer that ignores every notification.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopObserver;

impl RequestObserver for NoopObserver {}

// =============================================================================
// Responses
// =============================================================================

/// A derivative image ready to be sent.
#[derive(Debug)]
pub struct ImageResponse {
    pub body: ImageBody,
    pub media_type: &'static str,
    /// Source modification time if known, else the cache entry's creation.
    pub last_modified: Option<SystemTime>,
    /// Cache key of the variant; stable for identical requests.
    pub etag: String,
    pub cache_hit: bool,
    pub canonical: String,
    /// States visited, in order.
    pub states: Vec<PipelineState>,
}

/// Structural information about a source.
#[derive(Debug, Clone)]
pub struct InfoResponse {
    pub info: Info,
    pub last_modified: Option<SystemTime>,
}

// =============================================================================
// ImageService
// =============================================================================

/// Orchestrates image requests against one source resolver.
///
/// # Type Parameters
///
/// * `R` - The source resolver (filesystem, S3)
pub struct ImageService<R: SourceResolver> {
    resolver: Arc<R>,
    codecs: Arc<CodecRegistry>,
    info_cache: Option<Arc<dyn InfoCache>>,
    variant_cache: Option<Arc<dyn VariantCache>>,
    delegate: Arc<dyn Delegate>,
    locks: KeyLockTable,
    usage: SourceUsage,
    policy: ServicePolicy,
}

impl<R: SourceResolver> ImageService<R> {
    /// A service without caches, with the default delegate and policy.
    pub fn new(resolver: R, codecs: Arc<CodecRegistry>) -> Self {
        Self {
            resolver: Arc::new(resolver),
            codecs,
            info_cache: None,
            variant_cache: None,
            delegate: Arc::new(DefaultDelegate),
            locks: KeyLockTable::new(),
            usage: SourceUsage::new(),
            policy: ServicePolicy::default(),
        }
    }

    pub fn with_info_cache(mut self, cache: Arc<dyn InfoCache>) -> Self {
        self.info_cache = Some(cache);
        self
    }

    pub fn with_variant_cache(mut self, cache: Arc<dyn VariantCache>) -> Self {
        self.variant_cache = Some(cache);
        self
    }

    pub fn with_delegate(mut self, delegate: Arc<dyn Delegate>) -> Self {
        self.delegate = delegate;
        self
    }

    pub fn with_policy(mut self, policy: ServicePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_usage(mut self, usage: SourceUsage) -> Self {
        self.usage = usage;
        self
    }

    pub fn resolver(&self) -> &R {
        &self.resolver
    }

    pub fn codecs(&self) -> &CodecRegistry {
        &self.codecs
    }

    pub fn policy(&self) -> &ServicePolicy {
        &self.policy
    }

    pub fn usage(&self) -> &SourceUsage {
        &self.usage
    }

    pub fn variant_cache(&self) -> Option<&Arc<dyn VariantCache>> {
        self.variant_cache.as_ref()
    }

    pub fn info_cache(&self) -> Option<&Arc<dyn InfoCache>> {
        self.info_cache.as_ref()
    }

    /// Keys currently being generated or awaited.
    pub fn pending_generations(&self) -> usize {
        self.locks.len()
    }

    // -------------------------------------------------------------------------
    // Image requests
    // -------------------------------------------------------------------------

    /// Serve one image request.
    ///
    /// # Errors
    ///
    /// Source, authorization, limit and codec failures. Cache backend
    /// failures are logged and never returned.
    pub async fn handle(
        &self,
        request: &ImageRequest,
        client: ClientContext,
        observer: &mut dyn RequestObserver,
    ) -> Result<ImageResponse, ImageError> {
        let mut tracker = StateTracker::new();
        match self.run(request, client, observer, &mut tracker).await {
            Ok(response) => Ok(response),
            Err(e) => {
                tracker.fail();
                debug!(
                    identifier = %request.identifier,
                    error = %e,
                    path = ?tracker.path(),
                    "Image request failed"
                );
                Err(e)
            }
        }
    }

    async fn run(
        &self,
        request: &ImageRequest,
        client: ClientContext,
        observer: &mut dyn RequestObserver,
        tracker: &mut StateTracker,
    ) -> Result<ImageResponse, ImageError> {
        let identifier = request.identifier.clone();
        let trusted = client.trusted;
        let mut ctx = DelegateContext::new(identifier.clone(), client);

        let mut constraint = None;
        if !trusted {
            constraint = self
                .delegate
                .authorize_before_access(&ctx)
                .await
                .into_result()?;
        }

        let mut resolved = None;
        if self.policy.resolve_first {
            tracker.advance(PipelineState::ResolvingSource)?;
            let (source, stat) = self.resolve(&identifier).await?;
            observer.source_accessed(&stat);
            ctx.stat = Some(stat);
            resolved = Some((source, stat));
        }

        if !trusted {
            if let Some(c) = self.delegate.authorize(&ctx).await.into_result()? {
                constraint = Some(c);
            }
        }

        let ops = self.operations(request, constraint, &ctx).await?;
        let stat = resolved.as_ref().map(|(_, stat)| *stat);

        let mut guard = None;
        if let Some(cache) = &self.variant_cache {
            tracker.advance(PipelineState::CheckingVariantCache)?;
            if let Some(hit) = self.cached_variant(cache.as_ref(), &ops, stat.as_ref()).await {
                return self.stream_cached(hit, &ops, stat, observer, tracker);
            }

            let lock = self.locks.lock(ops.key()).await;
            if let Some(hit) = self.cached_variant(cache.as_ref(), &ops, stat.as_ref()).await {
                debug!(key = %ops.key(), "Variant generated while waiting");
                return self.stream_cached(hit, &ops, stat, observer, tracker);
            }
            guard = Some(lock);
        }

        let (source, stat) = match resolved {
            Some(resolved) => resolved,
            None => {
                tracker.advance(PipelineState::ResolvingSource)?;
                let (source, stat) = self.resolve(&identifier).await?;
                observer.source_accessed(&stat);
                (source, stat)
            }
        };

        self.generate(source, stat, ops, guard, observer, tracker).await
    }

    /// The operation list for `request`, with policy-driven operations.
    async fn operations(
        &self,
        request: &ImageRequest,
        constraint: Option<ScaleConstraint>,
        ctx: &DelegateContext,
    ) -> Result<OperationList, ImageError> {
        let redactions = self.delegate.redactions(ctx).await;
        let overlay = match &self.policy.overlay {
            OverlaySource::Disabled => None,
            OverlaySource::Static(overlay) => Some(overlay.clone()),
            OverlaySource::Delegate => self.delegate.overlay(ctx).await,
        };

        let mut builder = request
            .operations(self.policy.jpeg_quality)
            .add_opt(overlay);
        if !redactions.is_empty() {
            builder = builder.add(Redact::new(redactions));
        }
        if let Some(constraint) = constraint {
            builder = builder.scale_constraint(constraint);
        }
        builder.build()
    }

    async fn resolve(&self, identifier: &Identifier) -> Result<(R::Source, StatResult), ImageError> {
        let source = self.resolver.resolve(identifier).await?;
        let stat = source.stat().await?;
        self.usage.record(self.resolver.kind()).await;
        debug!(identifier = %identifier, location = source.location(), "Source accessed");
        Ok((source, stat))
    }

    /// Read a variant, treating backend failures and entries older than the
    /// source as misses.
    async fn cached_variant(
        &self,
        cache: &dyn VariantCache,
        ops: &OperationList,
        stat: Option<&StatResult>,
    ) -> Option<CachedVariant> {
        let hit = match cache.read(ops).await {
            Ok(hit) => hit?,
            Err(e) => {
                warn!(key = %ops.key(), error = %e, "Variant cache read failed, using source");
                return None;
            }
        };
        if let Some(modified) = stat.and_then(|s| s.last_modified) {
            if SourceState::Modified(modified).invalidates(hit.meta.created) {
                debug!(key = %ops.key(), "Cached variant older than source");
                return None;
            }
        }
        Some(hit)
    }

    fn stream_cached(
        &self,
        hit: CachedVariant,
        ops: &OperationList,
        stat: Option<StatResult>,
        observer: &mut dyn RequestObserver,
        tracker: &mut StateTracker,
    ) -> Result<ImageResponse, ImageError> {
        tracker.advance(PipelineState::StreamingCached)?;
        observer.will_stream_image_from_variant_cache(stat.as_ref());
        tracker.advance(PipelineState::Done)?;
        debug!(key = %ops.key(), size = hit.meta.size, "Variant cache hit");

        Ok(ImageResponse {
            body: ImageBody::Buffered(hit.data),
            media_type: ops.output_format().media_type(),
            last_modified: stat
                .and_then(|s| s.last_modified)
                .or(Some(hit.meta.created)),
            etag: ops.key().to_string(),
            cache_hit: true,
            canonical: ops.canonical().to_string(),
            states: tracker.path().to_vec(),
        })
    }

    /// Decode, process and encode a variant that is not cached.
    async fn generate(
        &self,
        source: R::Source,
        stat: StatResult,
        ops: OperationList,
        guard: Option<KeyGuard>,
        observer: &mut dyn RequestObserver,
        tracker: &mut StateTracker,
    ) -> Result<ImageResponse, ImageError> {
        tracker.advance(PipelineState::ReadingInfo)?;
        let identifier = ops.identifier().clone();
        let data = source.read().await?;
        let (info, decoder) = self.info_for(&identifier, &stat, &data).await?;
        observer.info_available(&info);

        let mut plan = ops.apply_orientation(info.full_size(), info.orientation)?;
        self.check_limits(&plan)?;
        if plan.overlay.is_some()
            && (plan.output_size.width < self.policy.overlay_min_width
                || plan.output_size.height < self.policy.overlay_min_height)
        {
            plan.overlay = None;
        }
        observer.will_process_image(&info);

        tracker.advance(PipelineState::Decoding)?;
        let decode_request = DecodeRequest {
            region: plan.region,
            scale: plan.scale_factor(),
            reduction_factor: plan.reduction_factor(info.num_resolutions),
        };
        let codecs = Arc::clone(&self.codecs);
        let decode_id = identifier.clone();
        let decoded = tokio::task::spawn_blocking(move || {
            let mut decoder = match decoder {
                Some(decoder) => decoder,
                None => codecs.decoder_for(decode_id.as_str(), data)?,
            };
            decoder.decode(0, &decode_request)
        })
        .await
        .map_err(|e| ImageError::IllegalState(format!("decode task failed: {}", e)))??;

        tracker.advance(PipelineState::Processing)?;
        let process_plan = plan.clone();
        let image = tokio::task::spawn_blocking(move || processor::process(decoded, &process_plan))
            .await
            .map_err(|e| ImageError::IllegalState(format!("processing task failed: {}", e)))??;

        tracker.advance(PipelineState::EncodingAndCaching)?;
        let mut encoder = self.codecs.encoder_for(plan.encode.format)?;
        let writer = match &self.variant_cache {
            Some(cache) => match cache.new_writer(&ops).await {
                Ok(writer) => Some(writer),
                Err(e) => {
                    warn!(key = %ops.key(), error = %e, "Variant cache unavailable, not caching");
                    None
                }
            },
            None => None,
        };

        let (tx, body) = ImageBody::channel();
        let key = ops.key().to_string();
        let encode = plan.encode;

        // Detached so a client disconnect does not abort the cache write.
        tokio::spawn(async move {
            let task_key = key.clone();
            let result = tokio::task::spawn_blocking(move || {
                let mut tee = TeeWriter::new(task_key, writer, Some(tx));
                match encoder.encode(&image, &encode, &mut tee) {
                    Ok(()) => Ok((tee.written(), tee.finish())),
                    Err(e) => {
                        tee.fail(&e);
                        Err(e)
                    }
                }
            })
            .await;

            match result {
                Ok(Ok((_, Some(writer)))) => match writer.commit().await {
                    Ok(meta) => info!(key = %key, size = meta.size, "Variant cached"),
                    Err(e) => warn!(key = %key, error = %e, "Variant cache commit failed"),
                },
                Ok(Ok((written, None))) => debug!(key = %key, size = written, "Variant streamed"),
                Ok(Err(e)) => error!(key = %key, error = %e, "Encoding failed"),
                Err(e) => error!(key = %key, error = %e, "Encoding task failed"),
            }
            drop(guard);
        });

        // Small outputs are complete here, so their failures still map to
        // an error response.
        let body = body.ready().await.map_err(|e| match e.kind() {
            std::io::ErrorKind::UnexpectedEof => {
                ImageError::IllegalState(format!("encoding stopped without output: {}", e))
            }
            _ => ImageError::Codec(CodecError::Encode(e.to_string())),
        })?;
        tracker.advance(PipelineState::Done)?;

        Ok(ImageResponse {
            body,
            media_type: plan.encode.format.media_type(),
            last_modified: stat.last_modified,
            etag: ops.key().to_string(),
            cache_hit: false,
            canonical: ops.canonical().to_string(),
            states: tracker.path().to_vec(),
        })
    }

    /// Reject outputs beyond the configured limits before any decode.
    fn check_limits(&self, plan: &ProcessingPlan) -> Result<(), ImageError> {
        if let Some(max) = self.policy.max_pixels {
            let area = plan.output_size.area();
            if area > max {
                return Err(ImageError::forbidden(format!(
                    "Requested size {} ({} pixels) exceeds the maximum of {} pixels",
                    plan.output_size, area, max
                )));
            }
        }
        if let Some(max) = self.policy.max_scale {
            let scale = plan.max_axis_scale();
            if scale > max {
                return Err(ImageError::forbidden(format!(
                    "Requested scale {:.3} exceeds the maximum of {}",
                    scale, max
                )));
            }
        }
        Ok(())
    }

    /// Info from the cache, or read from `data`. A decoder reading it is
    /// returned for reuse.
    async fn info_for(
        &self,
        identifier: &Identifier,
        stat: &StatResult,
        data: &Bytes,
    ) -> Result<(Info, Option<Box<dyn Decoder>>), ImageError> {
        if let Some(info) = self.cached_info(identifier, stat).await {
            return Ok((info, None));
        }

        let codecs = Arc::clone(&self.codecs);
        let info_id = identifier.clone();
        let info_data = data.clone();
        let (info, decoder) = tokio::task::spawn_blocking(move || {
            let mut decoder = codecs.decoder_for(info_id.as_str(), info_data)?;
            let info = Info::read_from(&info_id, decoder.as_mut())?;
            Ok::<_, ImageError>((info, decoder))
        })
        .await
        .map_err(|e| ImageError::IllegalState(format!("info task failed: {}", e)))??;

        let info = info.with_source_modified(stat.last_modified);
        self.store_info(&info);
        Ok((info, Some(decoder)))
    }

    /// Cached info, unless it was read from another version of the source.
    async fn cached_info(&self, identifier: &Identifier, stat: &StatResult) -> Option<Info> {
        let cache = self.info_cache.as_ref()?;
        match cache.get(identifier).await {
            Ok(Some(info)) if info.is_stale(stat.last_modified) => {
                debug!(identifier = %identifier, "Cached info is stale, reading source");
                None
            }
            Ok(info) => info,
            Err(e) => {
                warn!(identifier = %identifier, error = %e, "Info cache read failed, reading source");
                None
            }
        }
    }

    /// Write `info` back to the cache without delaying the response.
    fn store_info(&self, info: &Info) {
        if let Some(cache) = &self.info_cache {
            let cache = Arc::clone(cache);
            let info = info.clone();
            tokio::spawn(async move {
                if let Err(e) = cache.put(&info.identifier, &info).await {
                    warn!(identifier = %info.identifier, error = %e, "Info cache write failed");
                }
            });
        }
    }

    // -------------------------------------------------------------------------
    // Information requests
    // -------------------------------------------------------------------------

    /// Structural information about a source, for `info.json`.
    pub async fn info(
        &self,
        identifier: &Identifier,
        client: ClientContext,
    ) -> Result<InfoResponse, ImageError> {
        let trusted = client.trusted;
        let mut ctx = DelegateContext::new(identifier.clone(), client);
        if !trusted {
            self.delegate
                .authorize_before_access(&ctx)
                .await
                .into_result()?;
        }

        let (source, stat) = self.resolve(identifier).await?;
        ctx.stat = Some(stat);
        if !trusted {
            self.delegate.authorize(&ctx).await.into_result()?;
        }

        let info = match self.cached_info(identifier, &stat).await {
            Some(info) => info,
            None => {
                let data = source.read().await?;
                self.info_for(identifier, &stat, &data).await?.0
            }
        };
        Ok(InfoResponse {
            info,
            last_modified: stat.last_modified,
        })
    }

    // -------------------------------------------------------------------------
    // Maintenance
    // -------------------------------------------------------------------------

    /// Drop everything cached for one identifier. Returns the number of
    /// variants removed.
    pub async fn purge_identifier(&self, identifier: &Identifier) -> Result<usize, CacheError> {
        if let Some(cache) = &self.info_cache {
            cache.purge(identifier).await?;
        }
        match &self.variant_cache {
            Some(cache) => cache.purge_identifier(identifier).await,
            None => Ok(0),
        }
    }

    /// Empty both caches.
    pub async fn purge_all(&self) -> Result<(), CacheError> {
        if let Some(cache) = &self.info_cache {
            cache.purge_all().await?;
        }
        if let Some(cache) = &self.variant_cache {
            cache.purge_all().await?;
        }
        Ok(())
    }

    /// Remove variants whose source changed or disappeared, along with the
    /// info of those identifiers.
    pub async fn purge_invalid(&self) -> Result<PurgeReport, CacheError> {
        let report = match &self.variant_cache {
            Some(cache) => cache.purge_invalid(self.resolver.as_ref()).await?,
            None => PurgeReport::default(),
        };
        if let Some(cache) = &self.info_cache {
            for identifier in &report.invalid_identifiers {
                cache.purge(identifier).await?;
            }
        }
        Ok(report)
    }

    /// Generate and cache a variant on behalf of the server itself.
    pub async fn warm(&self, request: &ImageRequest) -> Result<bool, ImageError> {
        let response = self
            .handle(request, ClientContext::internal(), &mut NoopObserver)
            .await?;
        if !response.cache_hit {
            response
                .body
                .collect()
                .await
                .map_err(|e| ImageError::IllegalState(format!("warming failed: {}", e)))?;
        }
        Ok(!response.cache_hit)
    }
}
