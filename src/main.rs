//! IIIF Streamer - An IIIF image server with derivative caching.
//!
//! This binary starts the HTTP server and configures all components.

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use iiif_streamer::{
    cache::{FilesystemVariantCache, MemoryVariantCache},
    codec::CodecRegistry,
    config::{
        CacheKind, CheckConfig, Cli, Command, ServeConfig, SignConfig, SignOutputFormat,
        SourceKind,
    },
    delegate::{DefaultDelegate, Delegate, SignedUrlDelegate, UrlSigner},
    error::ConfigError,
    info::{FilesystemInfoCache, Info, MemoryInfoCache},
    operation::{Identifier, Overlay},
    pipeline::{ImageRequest, ImageService, OverlaySource, ServicePolicy},
    server::{create_router, RouterConfig},
    source::{create_s3_client, FilesystemResolver, S3Resolver, Source, SourceResolver},
    worker::{CacheWorker, WorkerConfig},
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match cli.into_command() {
        Command::Serve(config) => run_serve(config).await,
        Command::Sign(config) => run_sign(config),
        Command::Check(config) => run_check(config).await,
    }
}

// =============================================================================
// Serve Command
// =============================================================================

async fn run_serve(config: ServeConfig) -> ExitCode {
    init_logging(config.verbose);

    if let Err(e) = config.validate() {
        error!("Configuration error: {}", e);
        return ExitCode::FAILURE;
    }

    print_banner();
    log_configuration(&config);

    let codecs = Arc::new(CodecRegistry::with_defaults());
    match config.source {
        SourceKind::Filesystem => {
            let Some(root) = config.source_root.clone() else {
                error!("Configuration error: missing source root");
                return ExitCode::FAILURE;
            };
            serve(FilesystemResolver::new(root), codecs, &config).await
        }
        SourceKind::S3 => {
            let bucket = config.s3_bucket.clone().unwrap_or_default();
            let client = create_s3_client(config.s3_endpoint.as_deref(), &config.s3_region).await;
            serve(
                S3Resolver::new(client, bucket, config.s3_prefix.clone()),
                codecs,
                &config,
            )
            .await
        }
    }
}

async fn serve<R: SourceResolver>(
    resolver: R,
    codecs: Arc<CodecRegistry>,
    config: &ServeConfig,
) -> ExitCode {
    let service = match build_service(resolver, codecs, config).await {
        Ok(service) => Arc::new(service),
        Err(e) => {
            error!("Configuration error: {}", e);
            return ExitCode::FAILURE;
        }
    };

    if config.worker_enabled {
        match build_worker_config(config) {
            Ok(worker_config) => {
                let worker = Arc::new(CacheWorker::new(Arc::clone(&service), worker_config));
                let _handle = worker.spawn(config.worker_interval());
                info!(
                    interval_secs = config.worker_interval,
                    "Cache worker started"
                );
            }
            Err(e) => {
                error!("Configuration error: {}", e);
                return ExitCode::FAILURE;
            }
        }
    }

    let router_config = match build_router_config(config) {
        Ok(router_config) => router_config,
        Err(e) => {
            error!("Configuration error: {}", e);
            return ExitCode::FAILURE;
        }
    };
    let router = create_router(service, router_config);
    let addr = config.bind_address();

    info!("");
    info!("────────────────────────────────────────────────────────────────");
    info!("  Server listening on: http://{}", addr);
    info!("");
    info!("  Try these endpoints:");
    info!("    curl http://{}/health", addr);
    info!("    curl http://{}/iiif/3/<identifier>/info.json", addr);
    if !config.auth_enabled {
        info!("    curl http://{}/iiif/3/<identifier>/full/max/0/default.jpg", addr);
    }
    info!("────────────────────────────────────────────────────────────────");
    info!("");

    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to bind to {}: {}", addr, e);
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = axum::serve(listener, router).await {
        error!("Server error: {}", e);
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}

/// Assemble the image service from the configuration.
async fn build_service<R: SourceResolver>(
    resolver: R,
    codecs: Arc<CodecRegistry>,
    config: &ServeConfig,
) -> Result<ImageService<R>, ConfigError> {
    let mut service = ImageService::new(resolver, codecs).with_policy(build_policy(config));

    match config.variant_cache {
        CacheKind::None => {}
        CacheKind::Memory => {
            service = service.with_variant_cache(Arc::new(MemoryVariantCache::with_capacity(
                config.cache_max_size,
            )));
        }
        CacheKind::Filesystem => {
            let cache = FilesystemVariantCache::new(cache_dir(config)?.join("variants"));
            match cache.clean_temp().await {
                Ok(0) => {}
                Ok(removed) => info!(removed, "Removed interrupted cache writes"),
                Err(e) => warn!(error = %e, "Failed to clean variant cache temp files"),
            }
            service = service.with_variant_cache(Arc::new(cache));
        }
    }

    match config.info_cache {
        CacheKind::None => {}
        CacheKind::Memory => {
            service = service.with_info_cache(Arc::new(MemoryInfoCache::with_capacity(
                config.info_cache_entries,
            )));
        }
        CacheKind::Filesystem => {
            service = service.with_info_cache(Arc::new(FilesystemInfoCache::new(
                cache_dir(config)?.join("info"),
            )));
        }
    }

    let delegate: Arc<dyn Delegate> = if config.auth_enabled {
        let signer = UrlSigner::new(config.auth_secret_or_empty())?;
        Arc::new(SignedUrlDelegate::new(signer))
    } else {
        Arc::new(DefaultDelegate)
    };

    Ok(service.with_delegate(delegate))
}

fn cache_dir(config: &ServeConfig) -> Result<std::path::PathBuf, ConfigError> {
    config
        .cache_dir
        .clone()
        .ok_or_else(|| ConfigError::Missing("cache directory".to_string()))
}

fn build_policy(config: &ServeConfig) -> ServicePolicy {
    let overlay = match &config.overlay_image {
        Some(path) => OverlaySource::Static(Overlay {
            image: path.to_string_lossy().into_owned(),
            position: config.overlay_position,
            inset: config.overlay_inset,
        }),
        None => OverlaySource::Disabled,
    };

    ServicePolicy {
        resolve_first: config.resolve_first,
        max_pixels: config.max_pixels(),
        max_scale: config.max_scale(),
        jpeg_quality: config.jpeg_quality,
        overlay,
        overlay_min_width: config.overlay_min_width,
        overlay_min_height: config.overlay_min_height,
    }
}

fn build_worker_config(config: &ServeConfig) -> Result<WorkerConfig, ConfigError> {
    let prewarm = config
        .prewarm
        .iter()
        .map(|path| {
            ImageRequest::parse_path(path)
                .map_err(|e| ConfigError::Invalid(format!("prewarm path '{}': {}", path, e)))
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(WorkerConfig {
        max_age: config.cache_ttl(),
        max_size: (config.variant_cache != CacheKind::None).then_some(config.cache_max_size),
        prewarm,
    })
}

/// Build RouterConfig from the application ServeConfig.
fn build_router_config(config: &ServeConfig) -> Result<RouterConfig, ConfigError> {
    let admin_signer = if config.admin_enabled && config.auth_enabled {
        Some(UrlSigner::new(config.auth_secret_or_empty())?)
    } else {
        None
    };

    let mut router_config = RouterConfig::default()
        .with_cache_max_age(config.cache_max_age)
        .with_tracing(!config.no_tracing)
        .with_admin(config.admin_enabled)
        .with_admin_signer(admin_signer)
        .with_public_url(config.public_url.clone());

    if let Some(ref origins) = config.cors_origins {
        router_config = router_config.with_cors_origins(origins.clone());
    }

    Ok(router_config)
}

fn log_configuration(config: &ServeConfig) {
    info!("Configuration:");
    match config.source {
        SourceKind::Filesystem => {
            if let Some(ref root) = config.source_root {
                info!("  Source: filesystem at {}", root.display());
            }
        }
        SourceKind::S3 => {
            info!(
                "  Source: s3://{}/{}",
                config.s3_bucket.as_deref().unwrap_or_default(),
                config.s3_prefix
            );
            if let Some(ref endpoint) = config.s3_endpoint {
                info!("  S3 endpoint: {}", endpoint);
            }
            info!("  S3 region: {}", config.s3_region);
        }
    }

    if config.auth_enabled {
        info!("  Auth: signed URLs");
    } else {
        warn!("  Auth: DISABLED - all images are publicly accessible");
        warn!("        Enable for production: --auth-enabled --auth-secret=<secret>");
    }

    info!(
        "  Caches: variants {:?} ({}MB), info {:?}",
        config.variant_cache,
        config.cache_max_size / (1024 * 1024),
        config.info_cache
    );
    if let Some(max) = config.max_pixels() {
        info!("  Max pixels: {}", max);
    }
    if let Some(max) = config.max_scale() {
        info!("  Max scale: {}", max);
    }
    if config.admin_enabled {
        if config.auth_enabled {
            info!("  Admin routes: enabled (signed URLs required)");
        } else {
            info!("  Admin routes: enabled (unauthenticated)");
        }
    }
}

/// Print the startup banner.
fn print_banner() {
    let version = env!("CARGO_PKG_VERSION");
    info!("");
    info!("██╗██╗██╗███████╗");
    info!("██║██║██║██╔════╝");
    info!("██║██║██║█████╗  ");
    info!("██║██║██║██╔══╝  ");
    info!("██║██║██║██║     ");
    info!("╚═╝╚═╝╚═╝╚═╝      streamer v{}", version);
    info!("");
}

/// Initialize the tracing/logging subsystem.
fn init_logging(verbose: bool) {
    let env_filter = if verbose {
        "iiif_streamer=debug,tower_http=debug"
    } else {
        "iiif_streamer=info,tower_http=info"
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| env_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

// =============================================================================
// Sign Command
// =============================================================================

fn run_sign(config: SignConfig) -> ExitCode {
    if let Err(e) = config.validate() {
        eprintln!("Error: {}", e);
        return ExitCode::FAILURE;
    }

    let params = match config.parse_params() {
        Ok(p) => p,
        Err(e) => {
            eprintln!("Error: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let signer = match UrlSigner::new(&config.secret) {
        Ok(signer) => signer,
        Err(e) => {
            eprintln!("Error: {}", e);
            return ExitCode::FAILURE;
        }
    };
    let ttl = Duration::from_secs(config.ttl);

    let params_ref: Vec<(&str, &str)> = params
        .iter()
        .map(|(k, v)| (k.as_str(), v.as_str()))
        .collect();

    match config.format {
        SignOutputFormat::Signature => {
            let (signature, _) = signer.sign_with_params(&config.path, ttl, &params_ref);
            println!("{}", signature);
        }
        SignOutputFormat::Json => {
            let (signature, expiry) = signer.sign_with_params(&config.path, ttl, &params_ref);
            let url = config.base_url.as_deref().map(|base_url| {
                let mut serializer = url::form_urlencoded::Serializer::new(String::new());
                for (key, value) in &params_ref {
                    serializer.append_pair(key, value);
                }
                serializer.append_pair("exp", &expiry.to_string());
                serializer.append_pair("sig", &signature);
                format!(
                    "{}{}?{}",
                    base_url.trim_end_matches('/'),
                    config.path,
                    serializer.finish()
                )
            });

            let json = serde_json::json!({
                "signature": signature,
                "expiry": expiry,
                "path": config.path,
                "ttl": config.ttl,
                "url": url,
            });
            match serde_json::to_string_pretty(&json) {
                Ok(text) => println!("{}", text),
                Err(e) => {
                    eprintln!("Error: {}", e);
                    return ExitCode::FAILURE;
                }
            }
        }
        SignOutputFormat::Url => {
            let base_url = config
                .base_url
                .as_deref()
                .map(|b| b.trim_end_matches('/'))
                .unwrap_or("");
            println!(
                "{}",
                signer.generate_signed_url(base_url, &config.path, ttl, &params_ref)
            );
            if config.base_url.is_none() {
                eprintln!();
                eprintln!("Tip: Use --base-url to generate a complete URL");
            }
        }
    }

    ExitCode::SUCCESS
}

// =============================================================================
// Check Command
// =============================================================================

async fn run_check(config: CheckConfig) -> ExitCode {
    if config.verbose {
        init_logging(true);
    }

    println!("IIIF Streamer Configuration Check");
    println!("═════════════════════════════════");
    println!();

    match config.source {
        SourceKind::Filesystem => {
            let Some(root) = config.source_root.clone() else {
                println!("✗ Source root: missing (set --source-root)");
                return ExitCode::FAILURE;
            };
            if !root.is_dir() {
                println!("✗ Source root: {} is not a directory", root.display());
                return ExitCode::FAILURE;
            }
            println!("✓ Source root: {}", root.display());
            check_image(FilesystemResolver::new(root), config.test_image.as_deref()).await
        }
        SourceKind::S3 => {
            let Some(bucket) = config.s3_bucket.clone().filter(|b| !b.is_empty()) else {
                println!("✗ Bucket: missing (set --s3-bucket)");
                return ExitCode::FAILURE;
            };
            println!("✓ Bucket: {}", bucket);
            if let Some(ref endpoint) = config.s3_endpoint {
                println!("✓ Endpoint: {}", endpoint);
            }
            println!("✓ Region: {}", config.s3_region);

            let client = create_s3_client(config.s3_endpoint.as_deref(), &config.s3_region).await;
            print!("Testing S3 connection... ");
            match client.head_bucket().bucket(&bucket).send().await {
                Ok(_) => println!("✓ success"),
                Err(e) => {
                    println!("✗ failed");
                    println!();
                    println!("Error: {}", e);
                    println!();
                    println!("Please check:");
                    println!("  - Your AWS credentials are configured correctly");
                    println!("  - The bucket '{}' exists and is accessible", bucket);
                    if config.s3_endpoint.is_some() {
                        println!("  - The S3 endpoint is correct and reachable");
                    }
                    return ExitCode::FAILURE;
                }
            }
            let resolver = S3Resolver::new(client, bucket, config.s3_prefix.clone());
            check_image(resolver, config.test_image.as_deref()).await
        }
    }
}

/// Resolve, read and inspect one image.
async fn check_image<R: SourceResolver>(resolver: R, test_image: Option<&str>) -> ExitCode {
    let Some(name) = test_image else {
        println!();
        println!("═════════════════════════════════");
        println!("✓ All checks passed!");
        return ExitCode::SUCCESS;
    };

    println!();
    print!("Testing image '{}'... ", name);
    let identifier = Identifier::new(name);

    let source = match resolver.resolve(&identifier).await {
        Ok(source) => source,
        Err(e) => {
            println!("✗ {}", e);
            return ExitCode::FAILURE;
        }
    };
    let stat = match source.stat().await {
        Ok(stat) => stat,
        Err(e) => {
            println!("✗ {}", e);
            return ExitCode::FAILURE;
        }
    };
    println!("✓ found");
    if let Some(length) = stat.length {
        println!("  Size: {:.2} MB", length as f64 / (1024.0 * 1024.0));
    }

    let data = match source.read().await {
        Ok(data) => data,
        Err(e) => {
            println!("  ✗ read failed: {}", e);
            return ExitCode::FAILURE;
        }
    };
    let codecs = CodecRegistry::with_defaults();
    let inspected = codecs
        .decoder_for(identifier.as_str(), data)
        .map_err(|e| e.to_string())
        .and_then(|mut decoder| {
            Info::read_from(&identifier, decoder.as_mut()).map_err(|e| e.to_string())
        });
    match inspected {
        Ok(info) => {
            let size = info.oriented_size();
            println!("  Format: {}", info.source_format);
            println!("  Dimensions: {}x{}", size.width, size.height);
        }
        Err(e) => {
            println!("  ✗ reading info failed: {}", e);
            return ExitCode::FAILURE;
        }
    }

    println!();
    println!("═════════════════════════════════");
    println!("✓ All checks passed!");
    ExitCode::SUCCESS
}
