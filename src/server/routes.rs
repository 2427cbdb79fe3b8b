//! Router configuration for the IIIF image server.
//!
//! # Route Structure
//!
//! ```text
//! /health                                              - Health check
//! /iiif/3/{identifier}                                 - Redirect to info.json
//! /iiif/3/{identifier}/info.json                       - Image information
//! /iiif/3/{identifier}/{region}/{size}/{rotation}/{qf} - Image
//! /admin/cache                                         - DELETE: purge all (admin)
//! /admin/cache/{identifier}                            - DELETE: purge one (admin)
//! /admin/cache/purge-invalid                           - POST: purge stale (admin)
//! ```
//!
//! Image and info requests are authorized by the service's delegate. The
//! admin routes are guarded here, by [`require_signature`], when an admin
//! signer is configured.
//!
//! # Example
//!
//! ```ignore
//! use iiif_streamer::server::{create_router, RouterConfig};
//!
//! let config = RouterConfig::default()
//!     .with_cors_origins(vec!["https://example.com".to_string()]);
//! let router = create_router(Arc::new(service), config);
//!
//! let listener = tokio::net::TcpListener::bind("0.0.0.0:3000").await?;
//! axum::serve(listener, router).await?;
//! ```

use std::sync::Arc;
use std::time::Duration;

use axum::{
    middleware,
    routing::{delete, get, post},
    Router,
};
use http::header::{
    AUTHORIZATION, CONTENT_TYPE, IF_MODIFIED_SINCE, IF_NONE_MATCH,
};
use http::Method;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use super::handlers::{
    base_redirect_handler, health_handler, image_handler, info_handler, purge_all_handler,
    purge_identifier_handler, purge_invalid_handler, require_signature, AppState,
};
use crate::delegate::UrlSigner;
use crate::pipeline::ImageService;
use crate::source::SourceResolver;

// =============================================================================
// Router Configuration
// =============================================================================

/// Configuration for the HTTP router.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Allowed CORS origins (None = allow any origin)
    pub cors_origins: Option<Vec<String>>,

    /// Cache-Control max-age in seconds
    pub cache_max_age: u32,

    /// Whether to enable request tracing
    pub enable_tracing: bool,

    /// Whether to expose the cache administration routes
    pub admin_enabled: bool,

    /// Public base URL used for `id` in info.json
    pub public_url: Option<String>,

    /// Signer whose signatures the admin routes require (None = open)
    pub admin_signer: Option<UrlSigner>,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            cors_origins: None,
            cache_max_age: 3600,
            enable_tracing: true,
            admin_enabled: false,
            public_url: None,
            admin_signer: None,
        }
    }
}

impl RouterConfig {
    /// Set specific allowed CORS origins.
    ///
    /// Pass an empty vec to disallow all cross-origin requests.
    pub fn with_cors_origins(mut self, origins: Vec<String>) -> Self {
        self.cors_origins = Some(origins);
        self
    }

    /// Set the Cache-Control max-age in seconds.
    pub fn with_cache_max_age(mut self, seconds: u32) -> Self {
        self.cache_max_age = seconds;
        self
    }

    /// Enable or disable request tracing.
    pub fn with_tracing(mut self, enabled: bool) -> Self {
        self.enable_tracing = enabled;
        self
    }

    /// Enable or disable the admin routes.
    pub fn with_admin(mut self, enabled: bool) -> Self {
        self.admin_enabled = enabled;
        self
    }

    pub fn with_public_url(mut self, url: Option<String>) -> Self {
        self.public_url = url;
        self
    }

    /// Require URLs signed by `signer` on the admin routes.
    pub fn with_admin_signer(mut self, signer: Option<UrlSigner>) -> Self {
        self.admin_signer = signer;
        self
    }
}

// =============================================================================
// Router Builder
// =============================================================================

/// Create the main application router.
pub fn create_router<R>(service: Arc<ImageService<R>>, config: RouterConfig) -> Router
where
    R: SourceResolver + 'static,
{
    let app_state = AppState::new(service)
        .with_cache_max_age(config.cache_max_age)
        .with_public_url(config.public_url.clone());

    let cors = build_cors_layer(&config);

    let mut router = Router::new()
        .route("/health", get(health_handler::<R>))
        .route("/iiif/3/{identifier}", get(base_redirect_handler))
        .route("/iiif/3/{identifier}/info.json", get(info_handler::<R>))
        .route(
            "/iiif/3/{identifier}/{region}/{size}/{rotation}/{quality_format}",
            get(image_handler::<R>),
        );

    if config.admin_enabled {
        let mut admin = Router::new()
            .route("/admin/cache", delete(purge_all_handler::<R>))
            .route(
                "/admin/cache/purge-invalid",
                post(purge_invalid_handler::<R>),
            )
            .route(
                "/admin/cache/{identifier}",
                delete(purge_identifier_handler::<R>),
            );
        if let Some(signer) = config.admin_signer.clone() {
            admin = admin.route_layer(middleware::from_fn_with_state(signer, require_signature));
        }
        router = router.merge(admin);
    }

    let router = router.with_state(app_state).layer(cors);

    if config.enable_tracing {
        router.layer(TraceLayer::new_for_http())
    } else {
        router
    }
}

/// Build the CORS layer based on configuration.
fn build_cors_layer(config: &RouterConfig) -> CorsLayer {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::HEAD, Method::OPTIONS])
        .allow_headers([AUTHORIZATION, CONTENT_TYPE, IF_NONE_MATCH, IF_MODIFIED_SINCE])
        .max_age(Duration::from_secs(86400)); // 24 hours

    match &config.cors_origins {
        None => cors.allow_origin(Any),
        Some(origins) if origins.is_empty() => cors,
        Some(origins) => {
            let parsed_origins: Vec<_> = origins.iter().filter_map(|o| o.parse().ok()).collect();
            cors.allow_origin(parsed_origins)
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_router_config_defaults() {
        let config = RouterConfig::default();
        assert!(config.cors_origins.is_none());
        assert_eq!(config.cache_max_age, 3600);
        assert!(config.enable_tracing);
        assert!(!config.admin_enabled);
        assert!(config.admin_signer.is_none());
    }

    #[test]
    fn test_router_config_builder() {
        let config = RouterConfig::default()
            .with_cors_origins(vec!["https://example.com".to_string()])
            .with_cache_max_age(7200)
            .with_admin(true)
            .with_tracing(false);

        assert_eq!(
            config.cors_origins,
            Some(vec!["https://example.com".to_string()])
        );
        assert_eq!(config.cache_max_age, 7200);
        assert!(config.admin_enabled);
        assert!(!config.enable_tracing);
    }

    #[test]
    fn test_build_cors_layer_variants() {
        let _any = build_cors_layer(&RouterConfig::default());
        let _none = build_cors_layer(&RouterConfig::default().with_cors_origins(vec![]));
        let _some = build_cors_layer(
            &RouterConfig::default().with_cors_origins(vec!["https://a.org".to_string()]),
        );
    }
}
