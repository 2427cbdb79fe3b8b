//! Configuration management for IIIF Streamer.
//!
//! This module provides a flexible configuration system that supports:
//! - Command-line arguments via clap, with `serve`, `sign` and `check`
//!   subcommands
//! - Environment variables with `IIIF_` prefix
//! - Sensible defaults for all optional settings
//!
//! # Environment Variables
//!
//! - `IIIF_HOST` / `IIIF_PORT` - Bind address (default: 0.0.0.0:3000)
//! - `IIIF_SOURCE` - `filesystem` or `s3` (default: filesystem)
//! - `IIIF_SOURCE_ROOT` - Root directory of the filesystem source
//! - `IIIF_S3_BUCKET` / `IIIF_S3_PREFIX` / `IIIF_S3_ENDPOINT` / `IIIF_S3_REGION`
//! - `IIIF_VARIANT_CACHE` - `none`, `memory` or `filesystem` (default: memory)
//! - `IIIF_INFO_CACHE` - `none`, `memory` or `filesystem` (default: memory)
//! - `IIIF_CACHE_DIR` - Directory of the filesystem caches
//! - `IIIF_AUTH_SECRET` / `IIIF_AUTH_ENABLED` - Signed URL authorization
//! - `IIIF_MAX_PIXELS` / `IIIF_MAX_SCALE` - Output limits
//! - `IIIF_WORKER_ENABLED` / `IIIF_WORKER_INTERVAL` - Background cache worker

use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand, ValueEnum};

use crate::error::ConfigError;
use crate::operation::Position;
use crate::pipeline::{DEFAULT_JPEG_QUALITY, DEFAULT_MAX_PIXELS, DEFAULT_MAX_SCALE};

// =============================================================================
// Default Values
// =============================================================================

/// Default server host.
pub const DEFAULT_HOST: &str = "0.0.0.0";

/// Default server port.
pub const DEFAULT_PORT: u16 = 3000;

/// Default AWS region.
pub const DEFAULT_REGION: &str = "us-east-1";

/// Default variant cache size (256MB).
pub const DEFAULT_VARIANT_CACHE_BYTES: u64 = 256 * 1024 * 1024;

/// Default number of info entries kept in memory.
pub const DEFAULT_INFO_CACHE_ENTRIES: usize = 10_000;

/// Default HTTP cache max-age in seconds (1 hour).
pub const DEFAULT_CACHE_MAX_AGE: u32 = 3600;

/// Default cache worker interval in seconds.
pub const DEFAULT_WORKER_INTERVAL: u64 = 300;

/// Default signature lifetime for the `sign` command.
pub const DEFAULT_SIGN_TTL: u64 = 3600;

// =============================================================================
// CLI
// =============================================================================

/// IIIF Streamer - An IIIF Image API server with derivative caching.
#[derive(Parser, Debug, Clone)]
#[command(name = "iiif-streamer")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,

    /// Options used when no subcommand is given.
    #[command(flatten)]
    pub serve: ServeConfig,
}

impl Cli {
    /// The selected command; `serve` when none was given.
    pub fn into_command(self) -> Command {
        self.command.unwrap_or(Command::Serve(self.serve))
    }
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Run the image server.
    Serve(ServeConfig),
    /// Sign a request path.
    Sign(SignConfig),
    /// Check configuration and source connectivity.
    Check(CheckConfig),
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    Filesystem,
    S3,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheKind {
    None,
    Memory,
    Filesystem,
}

// =============================================================================
// Serve
// =============================================================================

#[derive(Args, Debug, Clone)]
pub struct ServeConfig {
    // =========================================================================
    // Server Configuration
    // =========================================================================
    /// Host address to bind the server to.
    #[arg(long, default_value = DEFAULT_HOST, env = "IIIF_HOST")]
    pub host: String,

    /// Port to listen on.
    #[arg(short, long, default_value_t = DEFAULT_PORT, env = "IIIF_PORT")]
    pub port: u16,

    // =========================================================================
    // Source Configuration
    // =========================================================================
    /// Where source images are read from.
    #[arg(long, value_enum, default_value = "filesystem", env = "IIIF_SOURCE")]
    pub source: SourceKind,

    /// Root directory of the filesystem source.
    #[arg(long, env = "IIIF_SOURCE_ROOT")]
    pub source_root: Option<PathBuf>,

    /// S3 bucket holding source images.
    #[arg(long, env = "IIIF_S3_BUCKET")]
    pub s3_bucket: Option<String>,

    /// Key prefix prepended to identifiers.
    #[arg(long, default_value = "", env = "IIIF_S3_PREFIX")]
    pub s3_prefix: String,

    /// Custom S3 endpoint URL for S3-compatible services (MinIO, etc.).
    #[arg(long, env = "IIIF_S3_ENDPOINT")]
    pub s3_endpoint: Option<String>,

    /// AWS region for S3.
    #[arg(long, default_value = DEFAULT_REGION, env = "IIIF_S3_REGION")]
    pub s3_region: String,

    // =========================================================================
    // Cache Configuration
    // =========================================================================
    /// Variant (derivative image) cache backend.
    #[arg(long, value_enum, default_value = "memory", env = "IIIF_VARIANT_CACHE")]
    pub variant_cache: CacheKind,

    /// Info cache backend.
    #[arg(long, value_enum, default_value = "memory", env = "IIIF_INFO_CACHE")]
    pub info_cache: CacheKind,

    /// Directory of the filesystem caches.
    #[arg(long, env = "IIIF_CACHE_DIR")]
    pub cache_dir: Option<PathBuf>,

    /// Maximum variant cache size in bytes.
    #[arg(long, default_value_t = DEFAULT_VARIANT_CACHE_BYTES, env = "IIIF_CACHE_MAX_SIZE")]
    pub cache_max_size: u64,

    /// Maximum age of cached variants in seconds (0 = unlimited).
    #[arg(long, default_value_t = 0, env = "IIIF_CACHE_TTL")]
    pub cache_ttl: u64,

    /// Number of info entries kept by the memory info cache.
    #[arg(long, default_value_t = DEFAULT_INFO_CACHE_ENTRIES, env = "IIIF_INFO_CACHE_ENTRIES")]
    pub info_cache_entries: usize,

    /// Stat the source before serving a cached variant.
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set, env = "IIIF_RESOLVE_FIRST")]
    pub resolve_first: bool,

    // =========================================================================
    // Processing Configuration
    // =========================================================================
    /// Largest output image area in pixels (0 = unlimited).
    #[arg(long, default_value_t = DEFAULT_MAX_PIXELS, env = "IIIF_MAX_PIXELS")]
    pub max_pixels: u64,

    /// Largest output scale relative to the source; 1.0 forbids upscaling
    /// (0 = unlimited).
    #[arg(long, default_value_t = DEFAULT_MAX_SCALE, env = "IIIF_MAX_SCALE")]
    pub max_scale: f64,

    /// Default JPEG quality (1-100).
    #[arg(long, default_value_t = DEFAULT_JPEG_QUALITY, env = "IIIF_JPEG_QUALITY")]
    pub jpeg_quality: u8,

    /// Overlay image drawn on every output.
    #[arg(long, env = "IIIF_OVERLAY_IMAGE")]
    pub overlay_image: Option<PathBuf>,

    /// Overlay anchor (e.g. bottom-right, center, repeat).
    #[arg(long, default_value = "bottom-right", env = "IIIF_OVERLAY_POSITION")]
    pub overlay_position: Position,

    /// Overlay distance from the anchored edges, in pixels.
    #[arg(long, default_value_t = 10, env = "IIIF_OVERLAY_INSET")]
    pub overlay_inset: u32,

    /// Outputs narrower than this get no overlay.
    #[arg(long, default_value_t = 0, env = "IIIF_OVERLAY_MIN_WIDTH")]
    pub overlay_min_width: u32,

    /// Outputs shorter than this get no overlay.
    #[arg(long, default_value_t = 0, env = "IIIF_OVERLAY_MIN_HEIGHT")]
    pub overlay_min_height: u32,

    // =========================================================================
    // Authentication Configuration
    // =========================================================================
    /// Secret key for HMAC-SHA256 signed URL authorization.
    #[arg(long, env = "IIIF_AUTH_SECRET")]
    pub auth_secret: Option<String>,

    /// Require signed URLs.
    #[arg(long, default_value_t = false, action = clap::ArgAction::Set, env = "IIIF_AUTH_ENABLED")]
    pub auth_enabled: bool,

    /// Expose the cache administration endpoints.
    #[arg(long, default_value_t = false, action = clap::ArgAction::Set, env = "IIIF_ADMIN_ENABLED")]
    pub admin_enabled: bool,

    // =========================================================================
    // Cache Worker Configuration
    // =========================================================================
    /// Run the background cache worker.
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set, env = "IIIF_WORKER_ENABLED")]
    pub worker_enabled: bool,

    /// Seconds between cache worker passes.
    #[arg(long, default_value_t = DEFAULT_WORKER_INTERVAL, env = "IIIF_WORKER_INTERVAL")]
    pub worker_interval: u64,

    /// Request paths to keep cached (e.g. `cat.jpg/full/max/0/default.jpg`).
    #[arg(long, env = "IIIF_PREWARM", value_delimiter = ',')]
    pub prewarm: Vec<String>,

    // =========================================================================
    // HTTP Configuration
    // =========================================================================
    /// HTTP Cache-Control max-age in seconds.
    #[arg(long, default_value_t = DEFAULT_CACHE_MAX_AGE, env = "IIIF_CACHE_MAX_AGE")]
    pub cache_max_age: u32,

    /// Allowed CORS origins (comma-separated). Any origin when unset.
    #[arg(long, env = "IIIF_CORS_ORIGINS", value_delimiter = ',')]
    pub cors_origins: Option<Vec<String>>,

    /// Public base URL used for `id` in info.json. Derived from the `Host`
    /// header when unset.
    #[arg(long, env = "IIIF_PUBLIC_URL")]
    pub public_url: Option<String>,

    // =========================================================================
    // Logging Configuration
    // =========================================================================
    /// Enable verbose logging (debug level).
    #[arg(short, long, default_value_t = false)]
    pub verbose: bool,

    /// Disable request tracing.
    #[arg(long, default_value_t = false)]
    pub no_tracing: bool,
}

impl ServeConfig {
    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` describing the first inconsistency found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.auth_enabled && self.auth_secret.as_deref().map_or(true, str::is_empty) {
            return Err(ConfigError::Missing(
                "Authentication is enabled but no secret provided. \
                 Set --auth-secret or IIIF_AUTH_SECRET, or disable auth with --auth-enabled=false"
                    .to_string(),
            ));
        }

        match self.source {
            SourceKind::Filesystem if self.source_root.is_none() => {
                return Err(ConfigError::Missing(
                    "Filesystem source root is required. Set --source-root or IIIF_SOURCE_ROOT"
                        .to_string(),
                ));
            }
            SourceKind::S3 if self.s3_bucket.as_deref().map_or(true, str::is_empty) => {
                return Err(ConfigError::Missing(
                    "S3 bucket name is required. Set --s3-bucket or IIIF_S3_BUCKET".to_string(),
                ));
            }
            _ => {}
        }

        let uses_fs_cache = self.variant_cache == CacheKind::Filesystem
            || self.info_cache == CacheKind::Filesystem;
        if uses_fs_cache && self.cache_dir.is_none() {
            return Err(ConfigError::Missing(
                "Filesystem caches need a directory. Set --cache-dir or IIIF_CACHE_DIR".to_string(),
            ));
        }

        if self.variant_cache != CacheKind::None && self.cache_max_size == 0 {
            return Err(ConfigError::Invalid(
                "cache_max_size must be greater than 0".to_string(),
            ));
        }
        if self.info_cache == CacheKind::Memory && self.info_cache_entries == 0 {
            return Err(ConfigError::Invalid(
                "info_cache_entries must be greater than 0".to_string(),
            ));
        }

        if self.jpeg_quality == 0 || self.jpeg_quality > 100 {
            return Err(ConfigError::Invalid(
                "jpeg_quality must be between 1 and 100".to_string(),
            ));
        }

        if !self.max_scale.is_finite() || self.max_scale < 0.0 {
            return Err(ConfigError::Invalid(
                "max_scale must be a positive number, or 0 for unlimited".to_string(),
            ));
        }

        if self.worker_enabled && self.worker_interval == 0 {
            return Err(ConfigError::Invalid(
                "worker_interval must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Get the server bind address as "host:port".
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn max_pixels(&self) -> Option<u64> {
        (self.max_pixels > 0).then_some(self.max_pixels)
    }

    pub fn max_scale(&self) -> Option<f64> {
        (self.max_scale > 0.0).then_some(self.max_scale)
    }

    pub fn cache_ttl(&self) -> Option<Duration> {
        (self.cache_ttl > 0).then(|| Duration::from_secs(self.cache_ttl))
    }

    pub fn worker_interval(&self) -> Duration {
        Duration::from_secs(self.worker_interval)
    }

    /// Get the auth secret, or an empty string (call validate() first).
    pub fn auth_secret_or_empty(&self) -> &str {
        self.auth_secret.as_deref().unwrap_or("")
    }
}

// =============================================================================
// Sign
// =============================================================================

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignOutputFormat {
    /// Only the signature.
    Signature,
    /// Path or URL with query parameters.
    Url,
    /// JSON with signature, expiry and URL.
    Json,
}

#[derive(Args, Debug, Clone)]
pub struct SignConfig {
    /// Request path to sign, e.g. `/iiif/3/cat.jpg/full/max/0/default.jpg`.
    #[arg(long)]
    pub path: String,

    /// Signing secret.
    #[arg(long, env = "IIIF_AUTH_SECRET")]
    pub secret: String,

    /// Signature lifetime in seconds.
    #[arg(long, default_value_t = DEFAULT_SIGN_TTL)]
    pub ttl: u64,

    /// Extra query parameters included in the signature (`key=value`).
    #[arg(long = "param")]
    pub params: Vec<String>,

    /// Base URL prepended in `url` and `json` output.
    #[arg(long)]
    pub base_url: Option<String>,

    #[arg(long, value_enum, default_value = "url")]
    pub format: SignOutputFormat,
}

impl SignConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.secret.is_empty() {
            return Err(ConfigError::Missing("A signing secret is required".to_string()));
        }
        if !self.path.starts_with('/') {
            return Err(ConfigError::Invalid("Path must start with '/'".to_string()));
        }
        if self.ttl == 0 {
            return Err(ConfigError::Invalid("ttl must be greater than 0".to_string()));
        }
        Ok(())
    }

    /// Parse `key=value` parameters.
    pub fn parse_params(&self) -> Result<Vec<(String, String)>, ConfigError> {
        self.params
            .iter()
            .map(|param| {
                param
                    .split_once('=')
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .ok_or_else(|| {
                        ConfigError::Invalid(format!("Parameter '{}' is not key=value", param))
                    })
            })
            .collect()
    }
}

// =============================================================================
// Check
// =============================================================================

#[derive(Args, Debug, Clone)]
pub struct CheckConfig {
    #[arg(long, value_enum, default_value = "filesystem", env = "IIIF_SOURCE")]
    pub source: SourceKind,

    #[arg(long, env = "IIIF_SOURCE_ROOT")]
    pub source_root: Option<PathBuf>,

    #[arg(long, env = "IIIF_S3_BUCKET")]
    pub s3_bucket: Option<String>,

    #[arg(long, default_value = "", env = "IIIF_S3_PREFIX")]
    pub s3_prefix: String,

    #[arg(long, env = "IIIF_S3_ENDPOINT")]
    pub s3_endpoint: Option<String>,

    #[arg(long, default_value = DEFAULT_REGION, env = "IIIF_S3_REGION")]
    pub s3_region: String,

    /// Identifier to resolve and inspect.
    #[arg(long)]
    pub test_image: Option<String>,

    #[arg(short, long, default_value_t = false)]
    pub verbose: bool,
}

// =============================================================================
// Tests
// =============================================================================
