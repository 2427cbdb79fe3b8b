//! HTTP request handlers for the IIIF image API.
//!
//! # Endpoints
//!
//! - `GET /health` - Health check endpoint
//! - `GET /iiif/3/{identifier}` - Redirect to `info.json`
//! - `GET /iiif/3/{identifier}/info.json` - Image information
//! - `GET /iiif/3/{identifier}/{region}/{size}/{rotation}/{quality}.{format}` - Image
//! - `DELETE /admin/cache` - Purge both caches
//! - `DELETE /admin/cache/{identifier}` - Purge one identifier
//! - `POST /admin/cache/purge-invalid` - Purge stale variants
//!
//! Admin routes require a signed URL when the server signs its image URLs.

use std::sync::Arc;
use std::time::SystemTime;

use axum::{
    body::Body,
    extract::{Path, Request, State},
    http::{header, HeaderMap, HeaderValue, StatusCode, Uri},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use crate::delegate::{ClientContext, UrlSigner};
use crate::error::{CacheError, ImageError, IoError};
use crate::operation::Identifier;
use crate::pipeline::{ImageRequest, ImageResponse, ImageService, NoopObserver};
use crate::source::SourceResolver;

/// IIIF Image API 3 context URI.
pub const IIIF_CONTEXT: &str = "http://iiif.io/api/image/3/context.json";

/// Media type of `info.json` responses.
pub const INFO_MEDIA_TYPE: &str =
    "application/ld+json;profile=\"http://iiif.io/api/image/3/context.json\"";

/// IIIF Image API 3 protocol URI.
pub const IIIF_PROTOCOL: &str = "http://iiif.io/api/image";

// =============================================================================
// Application State
// =============================================================================

/// Shared application state containing the image service.
///
/// This is passed to all handlers via Axum's State extractor.
pub struct AppState<R: SourceResolver> {
    /// The orchestrator serving image and info requests
    pub service: Arc<ImageService<R>>,

    /// Cache-Control max-age in seconds
    pub cache_max_age: u32,

    /// Prefix used for `id` in info.json, e.g. `http://host:3000`.
    /// When `None` the `Host` header of the request is used.
    pub public_url: Option<String>,
}

impl<R: SourceResolver> AppState<R> {
    pub fn new(service: Arc<ImageService<R>>) -> Self {
        Self {
            service,
            cache_max_age: 3600,
            public_url: None,
        }
    }

    pub fn with_cache_max_age(mut self, cache_max_age: u32) -> Self {
        self.cache_max_age = cache_max_age;
        self
    }

    pub fn with_public_url(mut self, public_url: Option<String>) -> Self {
        self.public_url = public_url.map(|url| url.trim_end_matches('/').to_string());
        self
    }

    /// Base URI of one image service.
    fn image_base(&self, headers: &HeaderMap, identifier: &Identifier) -> String {
        let root = match &self.public_url {
            Some(url) => url.clone(),
            None => {
                let host = headers
                    .get(header::HOST)
                    .and_then(|h| h.to_str().ok())
                    .unwrap_or("localhost");
                format!("http://{}", host)
            }
        };
        format!(
            "{}/iiif/3/{}",
            root,
            urlencoding::encode(identifier.as_str())
        )
    }
}

impl<R: SourceResolver> Clone for AppState<R> {
    fn clone(&self) -> Self {
        Self {
            service: Arc::clone(&self.service),
            cache_max_age: self.cache_max_age,
            public_url: self.public_url.clone(),
        }
    }
}

// =============================================================================
// Response Types
// =============================================================================

/// Error response body.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Error type identifier
    pub error: String,

    /// Human-readable error message
    pub message: String,

    /// HTTP status code
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            message: message.into(),
            status: None,
        }
    }

    pub fn with_status(
        error: impl Into<String>,
        message: impl Into<String>,
        status: StatusCode,
    ) -> Self {
        Self {
            error: error.into(),
            message: message.into(),
            status: Some(status.as_u16()),
        }
    }
}

/// Health check response.
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    /// Service status
    pub status: String,

    /// Service version
    pub version: String,

    /// Source implementations that have served at least one request
    pub sources: Vec<String>,
}

/// IIIF `info.json` document.
#[derive(Debug, Serialize, Deserialize)]
pub struct InfoDocument {
    #[serde(rename = "@context")]
    pub context: String,
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub protocol: String,
    pub profile: String,
    pub width: u32,
    pub height: u32,
    #[serde(rename = "extraFormats")]
    pub extra_formats: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tiles: Vec<TileDescriptor>,
}

/// One entry of `tiles` in `info.json`.
#[derive(Debug, Serialize, Deserialize)]
pub struct TileDescriptor {
    pub width: u32,
    pub height: u32,
    #[serde(rename = "scaleFactors")]
    pub scale_factors: Vec<u32>,
}

/// Result of a cache purge.
#[derive(Debug, Serialize, Deserialize)]
pub struct PurgeResponse {
    /// Number of variants removed, when known
    #[serde(skip_serializing_if = "Option::is_none")]
    pub purged: Option<usize>,

    /// Identifiers whose source changed or disappeared
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub invalid_identifiers: Vec<String>,
}

// =============================================================================
// Error Handling
// =============================================================================

impl IntoResponse for ImageError {
    fn into_response(self) -> Response {
        let (status, error_type) = match &self {
            ImageError::NotFound { .. } => (StatusCode::NOT_FOUND, "not_found"),
            ImageError::Forbidden { .. } => (StatusCode::FORBIDDEN, "forbidden"),
            ImageError::Unauthorized { .. } => (StatusCode::UNAUTHORIZED, "unauthorized"),
            ImageError::Redirect { status, .. } => (
                StatusCode::from_u16(*status).unwrap_or(StatusCode::FOUND),
                "redirect",
            ),
            ImageError::InvalidRequest { .. } => (StatusCode::BAD_REQUEST, "invalid_request"),
            ImageError::UnsupportedSourceFormat { .. } => {
                (StatusCode::UNSUPPORTED_MEDIA_TYPE, "unsupported_format")
            }
            ImageError::Io(IoError::Connection(_)) | ImageError::Io(IoError::S3(_)) => {
                (StatusCode::BAD_GATEWAY, "upstream_error")
            }
            ImageError::Io(_) => (StatusCode::INTERNAL_SERVER_ERROR, "io_error"),
            ImageError::Codec(_) => (StatusCode::INTERNAL_SERVER_ERROR, "codec_error"),
            ImageError::CacheBackend(_) => (StatusCode::INTERNAL_SERVER_ERROR, "cache_error"),
            ImageError::IllegalState(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
        };
        let message = self.to_string();

        if status.is_server_error() {
            error!(status = status.as_u16(), error_type, message = %message, "Server error");
        } else if status == StatusCode::NOT_FOUND {
            debug!(status = status.as_u16(), error_type, message = %message, "Not found");
        } else if status.is_client_error() {
            warn!(status = status.as_u16(), error_type, message = %message, "Client error");
        }

        let body = Json(ErrorResponse::with_status(error_type, message, status));
        let mut response = (status, body).into_response();
        let headers = response.headers_mut();
        match self {
            ImageError::Unauthorized { challenge } => {
                if let Ok(value) = HeaderValue::from_str(&challenge) {
                    headers.insert(header::WWW_AUTHENTICATE, value);
                }
            }
            ImageError::Redirect { location, .. } => {
                if let Ok(value) = HeaderValue::from_str(&location) {
                    headers.insert(header::LOCATION, value);
                }
            }
            _ => {}
        }
        response
    }
}

/// Wrapper so cache backend failures of admin endpoints render like
/// pipeline errors.
pub struct AdminError(pub CacheError);

impl IntoResponse for AdminError {
    fn into_response(self) -> Response {
        ImageError::CacheBackend(self.0).into_response()
    }
}

impl From<CacheError> for AdminError {
    fn from(err: CacheError) -> Self {
        AdminError(err)
    }
}

// =============================================================================
// Header helpers
// =============================================================================

/// Format a timestamp as an HTTP date (RFC 7231 IMF-fixdate).
pub fn http_date(time: SystemTime) -> String {
    DateTime::<Utc>::from(time)
        .format("%a, %d %b %Y %H:%M:%S GMT")
        .to_string()
}

/// Parse an HTTP date as sent in `If-Modified-Since`.
pub fn parse_http_date(value: &str) -> Option<SystemTime> {
    DateTime::parse_from_rfc2822(value)
        .ok()
        .map(|dt| SystemTime::from(dt.with_timezone(&Utc)))
}

fn quoted_etag(key: &str) -> String {
    format!("\"{}\"", key)
}

/// Whether conditional request headers match a cached variant.
fn not_modified(headers: &HeaderMap, response: &ImageResponse) -> bool {
    if let Some(value) = headers
        .get(header::IF_NONE_MATCH)
        .and_then(|v| v.to_str().ok())
    {
        let etag = quoted_etag(&response.etag);
        return value
            .split(',')
            .map(str::trim)
            .any(|candidate| candidate == "*" || candidate == etag);
    }

    let since = headers
        .get(header::IF_MODIFIED_SINCE)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_http_date);
    match (since, response.last_modified) {
        (Some(since), Some(modified)) => {
            // HTTP dates have one-second resolution.
            let modified = DateTime::<Utc>::from(modified).timestamp();
            let since = DateTime::<Utc>::from(since).timestamp();
            modified <= since
        }
        _ => false,
    }
}

fn client_context(uri: &Uri) -> ClientContext {
    let query = uri
        .query()
        .map(|q| {
            url::form_urlencoded::parse(q.as_bytes())
                .into_owned()
                .collect()
        })
        .unwrap_or_default();
    ClientContext::new(uri.path(), query)
}

/// Require a valid signed URL on the routes this wraps.
///
/// ```ignore
/// router.route_layer(middleware::from_fn_with_state(signer, require_signature))
/// ```
pub async fn require_signature(
    State(signer): State<UrlSigner>,
    request: Request,
    next: Next,
) -> Response {
    let client = client_context(request.uri());
    match signer.authorize(&client.path, &client.query).into_result() {
        Ok(_) => next.run(request).await,
        Err(e) => e.into_response(),
    }
}

// =============================================================================
// Handlers
// =============================================================================

/// Path parameters of an image request.
#[derive(Debug, Deserialize)]
pub struct ImagePathParams {
    pub identifier: String,
    pub region: String,
    pub size: String,
    pub rotation: String,
    pub quality_format: String,
}

/// Handle an image request.
///
/// Streams the derivative with `Content-Type`, `Cache-Control`, `ETag`,
/// `Last-Modified` and `X-Cache-Hit` headers. Conditional requests that
/// match a cached variant get `304 Not Modified`.
pub async fn image_handler<R: SourceResolver + 'static>(
    State(state): State<AppState<R>>,
    Path(params): Path<ImagePathParams>,
    uri: Uri,
    headers: HeaderMap,
) -> Result<Response, ImageError> {
    let request = ImageRequest::parse(
        params.identifier,
        &params.region,
        &params.size,
        &params.rotation,
        &params.quality_format,
    )?;

    let response = state
        .service
        .handle(&request, client_context(&uri), &mut NoopObserver)
        .await?;

    let mut builder = Response::builder()
        .header(header::CONTENT_TYPE, response.media_type)
        .header(
            header::CACHE_CONTROL,
            format!("public, max-age={}", state.cache_max_age),
        )
        .header(header::ETAG, quoted_etag(&response.etag))
        .header("X-Cache-Hit", response.cache_hit.to_string());
    if let Some(modified) = response.last_modified {
        builder = builder.header(header::LAST_MODIFIED, http_date(modified));
    }

    let result = if response.cache_hit && not_modified(&headers, &response) {
        debug!(identifier = %request.identifier, key = %response.etag, "Not modified");
        builder.status(StatusCode::NOT_MODIFIED).body(Body::empty())
    } else {
        builder
            .status(StatusCode::OK)
            .body(Body::from_stream(response.body.into_stream()))
    };
    result.map_err(|e| ImageError::IllegalState(format!("response build failed: {}", e)))
}

/// Handle an `info.json` request.
pub async fn info_handler<R: SourceResolver + 'static>(
    State(state): State<AppState<R>>,
    Path(identifier): Path<String>,
    uri: Uri,
    headers: HeaderMap,
) -> Result<Response, ImageError> {
    let identifier = Identifier::new(identifier);
    let response = state
        .service
        .info(&identifier, client_context(&uri))
        .await?;
    let info = &response.info;
    let size = info.oriented_size();
    let tile = info.oriented_tile_size();

    let tiles = if tile.width > 0 && tile.height > 0 && tile != size {
        vec![TileDescriptor {
            width: tile.width,
            height: tile.height,
            scale_factors: (0..info.num_resolutions).map(|n| 1 << n).collect(),
        }]
    } else {
        Vec::new()
    };

    let document = InfoDocument {
        context: IIIF_CONTEXT.to_string(),
        id: state.image_base(&headers, &identifier),
        kind: "ImageService3".to_string(),
        protocol: IIIF_PROTOCOL.to_string(),
        profile: "level2".to_string(),
        width: size.width,
        height: size.height,
        extra_formats: vec!["gif".into(), "tif".into(), "webp".into()],
        tiles,
    };

    let mut http_response = Json(document).into_response();
    let out = http_response.headers_mut();
    out.insert(header::CONTENT_TYPE, HeaderValue::from_static(INFO_MEDIA_TYPE));
    if let Ok(value) = HeaderValue::from_str(&format!("public, max-age={}", state.cache_max_age)) {
        out.insert(header::CACHE_CONTROL, value);
    }
    if let Some(modified) = response.last_modified {
        if let Ok(value) = HeaderValue::from_str(&http_date(modified)) {
            out.insert(header::LAST_MODIFIED, value);
        }
    }
    Ok(http_response)
}

/// Redirect the image base URI to its `info.json`.
pub async fn base_redirect_handler(Path(identifier): Path<String>) -> Response {
    let location = format!("/iiif/3/{}/info.json", urlencoding::encode(&identifier));
    match HeaderValue::from_str(&location) {
        Ok(value) => (StatusCode::SEE_OTHER, [(header::LOCATION, value)]).into_response(),
        Err(_) => ImageError::invalid("Malformed identifier").into_response(),
    }
}

/// Health check endpoint.
pub async fn health_handler<R: SourceResolver + 'static>(
    State(state): State<AppState<R>>,
) -> Json<HealthResponse> {
    let sources = state
        .service
        .usage()
        .kinds()
        .await
        .into_iter()
        .map(String::from)
        .collect();
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        sources,
    })
}

// =============================================================================
// Admin Handlers
// =============================================================================

/// Purge every cached info and variant.
pub async fn purge_all_handler<R: SourceResolver + 'static>(
    State(state): State<AppState<R>>,
) -> Result<Json<PurgeResponse>, AdminError> {
    state.service.purge_all().await?;
    Ok(Json(PurgeResponse {
        purged: None,
        invalid_identifiers: Vec::new(),
    }))
}

/// Purge the info and variants of one identifier.
pub async fn purge_identifier_handler<R: SourceResolver + 'static>(
    State(state): State<AppState<R>>,
    Path(identifier): Path<String>,
) -> Result<Json<PurgeResponse>, AdminError> {
    let purged = state
        .service
        .purge_identifier(&Identifier::new(identifier))
        .await?;
    Ok(Json(PurgeResponse {
        purged: Some(purged),
        invalid_identifiers: Vec::new(),
    }))
}

/// Purge variants whose source changed or disappeared.
pub async fn purge_invalid_handler<R: SourceResolver + 'static>(
    State(state): State<AppState<R>>,
) -> Result<Json<PurgeResponse>, AdminError> {
    let report = state.service.purge_invalid().await?;
    Ok(Json(PurgeResponse {
        purged: Some(report.removed),
        invalid_identifiers: report
            .invalid_identifiers
            .iter()
            .map(|id| id.to_string())
            .collect(),
    }))
}

// =============================================================================
// Tests
// =============================================================================
