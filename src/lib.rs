//! # IIIF Streamer
//!
//! An IIIF image server that produces derivative images (region, size,
//! rotation, quality, format) from source images on the local filesystem
//! or in S3-compatible object storage.
//!
//! ## Features
//!
//! - **Canonical operation lists**: equivalent requests normalize to one
//!   cache key, so no-op variations share a single cached derivative
//! - **Two caches**: structural info per identifier and encoded variants
//!   per operation list, each with memory and filesystem backends
//! - **Single generation**: concurrent misses for one key produce the
//!   derivative once while the first client streams it as it is encoded
//! - **Delegates**: pluggable authorization, redaction and overlay hooks,
//!   with an HMAC-SHA256 signed URL implementation
//! - **Cache worker**: periodic purging of stale, expired and oversize
//!   entries plus pre-warming
//!
//! ## Architecture
//!
//! - [`operation`] - Geometry, operations and the canonical operation list
//! - [`source`] - Source resolvers (filesystem, S3)
//! - [`codec`] - Decoder/encoder registry built on the `image` crate
//! - [`info`] - Image information and its caches
//! - [`cache`] - Variant caches and per-key generation locks
//! - [`delegate`] - Authorization and policy hooks
//! - [`pipeline`] - Request parsing, processing and the orchestrator
//! - [`worker`] - Background cache maintenance
//! - [`server`] - Axum-based HTTP server and routes
//! - [`config`] - CLI and configuration types
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use iiif_streamer::{
//!     create_router, CodecRegistry, FilesystemResolver, ImageService, MemoryVariantCache,
//!     RouterConfig,
//! };
//!
//! #[tokio::main]
//! async fn main() -> std::io::Result<()> {
//!     let service = ImageService::new(
//!         FilesystemResolver::new("/srv/images"),
//!         Arc::new(CodecRegistry::with_defaults()),
//!     )
//!     .with_variant_cache(Arc::new(MemoryVariantCache::new()));
//!
//!     let router = create_router(Arc::new(service), RouterConfig::default());
//!     let listener = tokio::net::TcpListener::bind("0.0.0.0:3000").await?;
//!     axum::serve(listener, router).await
//! }
//! ```

pub mod cache;
pub mod codec;
pub mod config;
pub mod delegate;
pub mod error;
pub mod info;
pub mod operation;
pub mod pipeline;
pub mod server;
pub mod source;
pub mod worker;

// Re-export commonly used types
pub use cache::{FilesystemVariantCache, MemoryVariantCache, VariantCache};
pub use codec::{CodecRegistry, OutputFormat, SourceFormat};
pub use config::{CheckConfig, Cli, Command, ServeConfig, SignConfig, SignOutputFormat};
pub use delegate::{ClientContext, DefaultDelegate, Delegate, SignedUrlDelegate, UrlSigner};
pub use error::{CacheError, CodecError, ConfigError, ImageError, IoError};
pub use info::{FilesystemInfoCache, Info, InfoCache, MemoryInfoCache};
pub use operation::{Identifier, OperationList, OperationListBuilder};
pub use pipeline::{ImageBody, ImageRequest, ImageResponse, ImageService, ServicePolicy};
pub use server::{create_router, AppState, RouterConfig};
pub use source::{create_s3_client, FilesystemResolver, S3Resolver, SourceResolver};
pub use worker::{CacheWorker, WorkerConfig};
