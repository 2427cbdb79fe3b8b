//! Source resolution.
//!
//! A [`SourceResolver`] maps an opaque [`Identifier`] to a [`Source`]: a
//! handle that can report existence and modification time cheaply
//! ([`Source::stat`]) and hand over the full byte stream
//! ([`Source::read`]) when a decode is actually needed.
//!
//! ```text
//! Identifier ──► SourceResolver::resolve ──► Source
//!                                             ├── stat()  (HEAD / metadata)
//!                                             └── read()  (GET / read file)
//! ```

mod filesystem;
mod s3;
mod usage;

use std::time::SystemTime;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::IoError;
use crate::operation::Identifier;

pub use filesystem::{FilesystemResolver, FilesystemSource};
pub use s3::{create_s3_client, S3Resolver, S3Source};
pub use usage::SourceUsage;

/// Cheap facts about a source, obtained without reading its content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatResult {
    /// Last modification time, when the backend reports one.
    pub last_modified: Option<SystemTime>,
    /// Length in bytes, when known.
    pub length: Option<u64>,
}

/// A byte-accessible origin for one image.
#[async_trait]
pub trait Source: Send + Sync {
    /// Check existence and fetch metadata.
    ///
    /// # Errors
    ///
    /// Returns `IoError::NotFound` if the source does not exist.
    async fn stat(&self) -> Result<StatResult, IoError>;

    /// Read the complete content.
    async fn read(&self) -> Result<Bytes, IoError>;

    /// Location of this source for logging (e.g. `s3://bucket/key`).
    fn location(&self) -> &str;
}

/// Maps identifiers to sources.
#[async_trait]
pub trait SourceResolver: Send + Sync + 'static {
    /// The source type produced by this resolver.
    type Source: Source + 'static;

    /// Short name of this implementation, reported by the health check.
    fn kind(&self) -> &'static str;

    /// Resolve an identifier. Resolution itself performs no I/O beyond what
    /// is needed to name the object; existence is checked by `stat`.
    ///
    /// # Errors
    ///
    /// Returns `IoError::NotFound` for identifiers that can never name a
    /// source (e.g. path traversal).
    async fn resolve(&self, identifier: &Identifier) -> Result<Self::Source, IoError>;
}
