//! Image request pipeline.
//!
//! - [`ImageRequest`]: IIIF request segments parsed into operations
//! - [`ImageService`]: the orchestrator driving a request from source to
//!   response, with per-key generation locking
//! - [`PipelineState`]: the states a request moves through
//! - [`TeeWriter`] / [`ImageBody`]: one encode feeding both the client and
//!   the variant cache

mod processor;
mod request;
mod service;
mod state;
mod stream;

pub use processor::{overlay_origin, process};
pub use request::{ImageRequest, Quality};
pub use service::{
    ImageResponse, ImageService, InfoResponse, NoopObserver, OverlaySource, RequestObserver,
    ServicePolicy, DEFAULT_JPEG_QUALITY, DEFAULT_MAX_PIXELS, DEFAULT_MAX_SCALE,
};
pub use state::{PipelineState, StateTracker};
pub use stream::{BodyChunk, ImageBody, TeeWriter, CHANNEL_CAPACITY, CHUNK_SIZE};
