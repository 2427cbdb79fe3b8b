//! Per-identifier structural metadata and its cache.
//!
//! [`Info`] is produced once by probing a decoder and then served from an
//! [`InfoCache`] until it is purged or its source changes. Entries are
//! always replaced whole.

mod filesystem;
mod memory;

use std::time::SystemTime;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::codec::{Decoder, SourceFormat};
use crate::error::{CacheError, CodecError};
use crate::operation::{Dimension, Identifier, Orientation};

pub use filesystem::FilesystemInfoCache;
pub use memory::MemoryInfoCache;

// =============================================================================
// Info
// =============================================================================

/// Structure of one sub-image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageInfo {
    /// Stored full-resolution size.
    pub size: Dimension,
    /// Native tile size.
    pub tile_size: Dimension,
}

/// Structural metadata of a source image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Info {
    pub identifier: Identifier,
    pub source_format: SourceFormat,
    pub images: Vec<ImageInfo>,
    pub num_resolutions: u32,
    pub orientation: Orientation,
    /// Last-modified time of the source when it was read.
    #[serde(default)]
    pub source_modified: Option<SystemTime>,
}

impl Info {
    /// Read everything `Info` needs from a decoder.
    pub fn read_from(identifier: &Identifier, decoder: &mut dyn Decoder) -> Result<Info, CodecError> {
        let mut images = Vec::with_capacity(decoder.num_images());
        for index in 0..decoder.num_images() {
            images.push(ImageInfo {
                size: decoder.size(index)?,
                tile_size: decoder.tile_size(index)?,
            });
        }
        let metadata = decoder.read_metadata(0)?;
        Ok(Info {
            identifier: identifier.clone(),
            source_format: decoder.format(),
            images,
            num_resolutions: decoder.num_resolutions()?.max(1),
            orientation: metadata.orientation,
            source_modified: None,
        })
    }

    /// Record the source's last-modified time at probing.
    pub fn with_source_modified(mut self, last_modified: Option<SystemTime>) -> Self {
        self.source_modified = last_modified;
        self
    }

    /// Whether this was read from a different version of the source than
    /// the one last modified at `last_modified`.
    pub fn is_stale(&self, last_modified: Option<SystemTime>) -> bool {
        match last_modified {
            Some(current) => self.source_modified != Some(current),
            None => false,
        }
    }

    /// Stored size of the primary image.
    pub fn full_size(&self) -> Dimension {
        self.images
            .first()
            .map(|image| image.size)
            .unwrap_or(Dimension::new(0, 0))
    }

    /// Upright size of the primary image.
    pub fn oriented_size(&self) -> Dimension {
        self.orientation.oriented_size(self.full_size())
    }

    /// Upright tile size of the primary image.
    pub fn oriented_tile_size(&self) -> Dimension {
        let tile = self
            .images
            .first()
            .map(|image| image.tile_size)
            .unwrap_or(Dimension::new(0, 0));
        self.orientation.oriented_size(tile)
    }
}

// =============================================================================
// InfoCache
// =============================================================================

/// Storage for [`Info`] keyed by identifier.
///
/// Every method may fail with a [`CacheError`]; callers treat such failures
/// as a miss and fall back to the source.
#[async_trait]
pub trait InfoCache: Send + Sync {
    /// `Ok(None)` means unknown: read from the source.
    async fn get(&self, identifier: &Identifier) -> Result<Option<Info>, CacheError>;

    /// Store `info`, replacing any previous entry.
    async fn put(&self, identifier: &Identifier, info: &Info) -> Result<(), CacheError>;

    async fn purge(&self, identifier: &Identifier) -> Result<(), CacheError>;

    async fn purge_all(&self) -> Result<(), CacheError>;
}
