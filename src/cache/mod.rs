//! Variant (derivative image) cache.
//!
//! Entries are keyed by [`OperationList::key`] and hold the complete encoded
//! bytes of one rendered variant plus [`VariantMeta`].
//!
//! # Write path
//!
//! ```text
//! new_writer(ops) ──► VariantWriter (std::io::Write)
//!                          │  bytes stream in (temp storage)
//!                          ▼
//!                     commit() ──► entry published atomically
//!                     drop()   ──► temp storage discarded
//! ```
//!
//! Readers never observe a partially written entry. Serializing concurrent
//! generators of the same key is not the backend's job; the orchestrator
//! does that with a [`KeyLockTable`].

mod filesystem;
mod lock;
mod memory;

use std::collections::{BTreeSet, HashMap};
use std::io::Write;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{CacheError, IoError};
use crate::operation::{Identifier, OperationList};
use crate::source::{Source, SourceResolver};

pub use filesystem::FilesystemVariantCache;
pub use lock::{KeyGuard, KeyLockTable};
pub use memory::MemoryVariantCache;

// =============================================================================
// Entries
// =============================================================================

/// Metadata stored alongside every variant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariantMeta {
    /// SHA-256 cache key.
    pub key: String,
    /// Canonical operation list string the key was derived from.
    pub canonical: String,
    pub identifier: Identifier,
    /// When the entry was published; compared against source modification.
    pub created: SystemTime,
    /// Length of the encoded bytes.
    pub size: u64,
}

impl VariantMeta {
    /// Metadata for an entry about to be written for `ops`.
    pub fn for_operations(ops: &OperationList) -> Self {
        Self {
            key: ops.key().to_string(),
            canonical: ops.canonical().to_string(),
            identifier: ops.identifier().clone(),
            created: SystemTime::now(),
            size: 0,
        }
    }
}

/// A complete cached variant.
#[derive(Debug, Clone)]
pub struct CachedVariant {
    pub data: Bytes,
    pub meta: VariantMeta,
}

/// Streaming writer for one cache entry.
///
/// Dropping the writer without calling [`commit`](Self::commit) discards
/// everything written.
#[async_trait]
pub trait VariantWriter: Write + Send {
    /// Publish the written bytes as a complete entry.
    async fn commit(self: Box<Self>) -> Result<VariantMeta, CacheError>;
}

// =============================================================================
// Source validation
// =============================================================================

/// What the source of an identifier currently looks like.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceState {
    /// The source no longer exists.
    Missing,
    /// The source exists and was last modified at this time.
    Modified(SystemTime),
    /// The source exists but reports no modification time.
    Unknown,
}

impl SourceState {
    /// Whether an entry created at `created` is outdated by this state.
    pub fn invalidates(&self, created: SystemTime) -> bool {
        match self {
            SourceState::Missing => true,
            SourceState::Modified(modified) => *modified > created,
            SourceState::Unknown => false,
        }
    }
}

/// Reports the current state of sources for [`VariantCache::purge_invalid`].
#[async_trait]
pub trait SourceValidator: Send + Sync {
    async fn source_state(&self, identifier: &Identifier) -> Result<SourceState, IoError>;
}

#[async_trait]
impl<R: SourceResolver> SourceValidator for R {
    async fn source_state(&self, identifier: &Identifier) -> Result<SourceState, IoError> {
        let source = match self.resolve(identifier).await {
            Ok(source) => source,
            Err(IoError::NotFound(_)) => return Ok(SourceState::Missing),
            Err(e) => return Err(e),
        };
        match source.stat().await {
            Ok(stat) => Ok(stat
                .last_modified
                .map(SourceState::Modified)
                .unwrap_or(SourceState::Unknown)),
            Err(IoError::NotFound(_)) => Ok(SourceState::Missing),
            Err(e) => Err(e),
        }
    }
}

/// Outcome of [`VariantCache::purge_invalid`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PurgeReport {
    /// Number of entries removed.
    pub removed: usize,
    /// Identifiers whose source was missing or modified.
    pub invalid_identifiers: BTreeSet<Identifier>,
}

// =============================================================================
// VariantCache
// =============================================================================

/// Storage for rendered variants.
///
/// Implementations must be safe for concurrent use and must publish entries
/// atomically. The provided maintenance methods are written against
/// [`entries`](Self::entries) and [`remove`](Self::remove); backends
/// override them where they can do better.
#[async_trait]
pub trait VariantCache: Send + Sync {
    /// Read a complete entry, or `None` on a miss.
    async fn read(&self, ops: &OperationList) -> Result<Option<CachedVariant>, CacheError>;

    /// Open a writer whose commit publishes the entry for `ops`.
    async fn new_writer(&self, ops: &OperationList)
        -> Result<Box<dyn VariantWriter>, CacheError>;

    /// Metadata of every published entry.
    async fn entries(&self) -> Result<Vec<VariantMeta>, CacheError>;

    /// Remove the entry with this key, if present.
    async fn remove(&self, key: &str) -> Result<bool, CacheError>;

    async fn purge_all(&self) -> Result<(), CacheError>;

    async fn exists(&self, ops: &OperationList) -> Result<bool, CacheError> {
        Ok(self.read(ops).await?.is_some())
    }

    async fn purge(&self, ops: &OperationList) -> Result<bool, CacheError> {
        self.remove(ops.key()).await
    }

    /// Remove every variant of one source. Returns the number removed.
    async fn purge_identifier(&self, identifier: &Identifier) -> Result<usize, CacheError> {
        let mut removed = 0;
        for meta in self.entries().await? {
            if &meta.identifier == identifier && self.remove(&meta.key).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Remove entries whose source is gone or was modified after the entry
    /// was created. Sources that cannot be checked are left alone.
    async fn purge_invalid(
        &self,
        validator: &dyn SourceValidator,
    ) -> Result<PurgeReport, CacheError> {
        let entries = self.entries().await?;
        let mut states: HashMap<Identifier, Option<SourceState>> = HashMap::new();
        let mut report = PurgeReport::default();

        for meta in entries {
            if !states.contains_key(&meta.identifier) {
                let state = match validator.source_state(&meta.identifier).await {
                    Ok(state) => Some(state),
                    Err(e) => {
                        warn!(
                            identifier = %meta.identifier,
                            error = %e,
                            "Could not validate source, keeping its variants"
                        );
                        None
                    }
                };
                states.insert(meta.identifier.clone(), state);
            }

            let invalid = matches!(
                states.get(&meta.identifier),
                Some(Some(state)) if state.invalidates(meta.created)
            );
            if invalid {
                if self.remove(&meta.key).await? {
                    report.removed += 1;
                }
                report.invalid_identifiers.insert(meta.identifier);
            }
        }
        Ok(report)
    }

    /// Remove entries older than `max_age`.
    async fn purge_expired(&self, max_age: Duration) -> Result<usize, CacheError> {
        let now = SystemTime::now();
        let mut removed = 0;
        for meta in self.entries().await? {
            let age = now.duration_since(meta.created).unwrap_or_default();
            if age > max_age && self.remove(&meta.key).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Remove the oldest entries until the total size is at most
    /// `max_bytes`.
    async fn evict_to_size(&self, max_bytes: u64) -> Result<usize, CacheError> {
        let mut entries = self.entries().await?;
        let mut total: u64 = entries.iter().map(|m| m.size).sum();
        entries.sort_by_key(|m| m.created);

        let mut removed = 0;
        for meta in entries {
            if total <= max_bytes {
                break;
            }
            if self.remove(&meta.key).await? {
                total = total.saturating_sub(meta.size);
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Total size of all entries in bytes.
    async fn total_size(&self) -> Result<u64, CacheError> {
        Ok(self.entries().await?.iter().map(|m| m.size).sum())
    }
}
