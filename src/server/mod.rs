//! HTTP server layer.
//!
//! A thin axum front over [`ImageService`](crate::pipeline::ImageService):
//! handlers parse paths into requests, pass the raw URI to the delegate via
//! [`ClientContext`](crate::delegate::ClientContext), and stream bodies out.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                         HTTP Layer                              │
//! │     GET /iiif/3/{id}/{region}/{size}/{rotation}/{q}.{fmt}       │
//! │                                                                 │
//! │  ┌──────────────────────────┐  ┌─────────────────────────────┐  │
//! │  │        handlers          │  │           routes            │  │
//! │  │ (requests, status codes) │  │ (router config, CORS, admin)│  │
//! │  └──────────────────────────┘  └─────────────────────────────┘  │
//! └─────────────────────────────────────────────────────────────────┘
//!                               │
//!                               ▼
//!                        ImageService<R>
//! ```

pub mod handlers;
pub mod routes;

pub use handlers::{
    health_handler, http_date, image_handler, info_handler, parse_http_date, AppState,
    ErrorResponse, HealthResponse, ImagePathParams, InfoDocument, PurgeResponse,
    TileDescriptor,
};
pub use routes::{create_router, RouterConfig};
