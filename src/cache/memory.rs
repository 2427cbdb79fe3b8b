use std::io::Write;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use lru::LruCache;
use tokio::sync::RwLock;
use tracing::debug;

use super::{CachedVariant, VariantCache, VariantMeta, VariantWriter};
use crate::error::CacheError;
use crate::operation::OperationList;

/// Default capacity: 256MB
pub const DEFAULT_VARIANT_CACHE_CAPACITY: u64 = 256 * 1024 * 1024;

struct Inner {
    entries: LruCache<String, CachedVariant>,
    current_size: u64,
    max_size: u64,
}

impl Inner {
    fn insert(&mut self, variant: CachedVariant) {
        let size = variant.meta.size;
        if let Some(old) = self.entries.put(variant.meta.key.clone(), variant) {
            self.current_size = self.current_size.saturating_sub(old.meta.size);
        }
        self.current_size += size;

        // Evict entries until we're under capacity
        while self.current_size > self.max_size {
            match self.entries.pop_lru() {
                Some((key, evicted)) => {
                    debug!(key = %key, size = evicted.meta.size, "Evicted variant");
                    self.current_size = self.current_size.saturating_sub(evicted.meta.size);
                }
                None => {
                    self.current_size = 0;
                    break;
                }
            }
        }
    }

    fn remove(&mut self, key: &str) -> bool {
        match self.entries.pop(key) {
            Some(old) => {
                self.current_size = self.current_size.saturating_sub(old.meta.size);
                true
            }
            None => false,
        }
    }
}

/// In-process LRU variant cache bounded by total encoded size.
///
/// Entries become visible only when their writer commits. An entry larger
/// than the whole capacity is evicted immediately after insertion.
#[derive(Clone)]
pub struct MemoryVariantCache {
    inner: Arc<RwLock<Inner>>,
}

impl MemoryVariantCache {
    /// Create a cache with the default capacity (256MB).
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_VARIANT_CACHE_CAPACITY)
    }

    /// # Arguments
    ///
    /// * `max_size` - Maximum total size of cached variants in bytes
    pub fn with_capacity(max_size: u64) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Inner {
                entries: LruCache::unbounded(),
                current_size: 0,
                max_size,
            })),
        }
    }

    /// Current total size in bytes.
    pub async fn size(&self) -> u64 {
        self.inner.read().await.current_size
    }

    /// Number of cached variants.
    pub async fn len(&self) -> usize {
        self.inner.read().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl Default for MemoryVariantCache {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl VariantCache for MemoryVariantCache {
    async fn read(&self, ops: &OperationList) -> Result<Option<CachedVariant>, CacheError> {
        let mut inner = self.inner.write().await;
        Ok(inner.entries.get(ops.key()).cloned())
    }

    async fn exists(&self, ops: &OperationList) -> Result<bool, CacheError> {
        Ok(self.inner.read().await.entries.contains(ops.key()))
    }

    async fn new_writer(
        &self,
        ops: &OperationList,
    ) -> Result<Box<dyn VariantWriter>, CacheError> {
        Ok(Box::new(MemoryVariantWriter {
            buffer: Vec::new(),
            meta: VariantMeta::for_operations(ops),
            inner: Arc::clone(&self.inner),
        }))
    }

    async fn entries(&self) -> Result<Vec<VariantMeta>, CacheError> {
        let inner = self.inner.read().await;
        Ok(inner.entries.iter().map(|(_, v)| v.meta.clone()).collect())
    }

    async fn remove(&self, key: &str) -> Result<bool, CacheError> {
        Ok(self.inner.write().await.remove(key))
    }

    async fn purge_all(&self) -> Result<(), CacheError> {
        let mut inner = self.inner.write().await;
        inner.entries.clear();
        inner.current_size = 0;
        Ok(())
    }

    async fn evict_to_size(&self, max_bytes: u64) -> Result<usize, CacheError> {
        let mut inner = self.inner.write().await;
        let mut removed = 0;
        while inner.current_size > max_bytes {
            match inner.entries.pop_lru() {
                Some((_, evicted)) => {
                    inner.current_size = inner.current_size.saturating_sub(evicted.meta.size);
                    removed += 1;
                }
                None => break,
            }
        }
        Ok(removed)
    }

    async fn total_size(&self) -> Result<u64, CacheError> {
        Ok(self.size().await)
    }
}

/// Buffers an entry in memory until commit.
struct MemoryVariantWriter {
    buffer: Vec<u8>,
    meta: VariantMeta,
    inner: Arc<RwLock<Inner>>,
}

impl Write for MemoryVariantWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.buffer.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[async_trait]
impl VariantWriter for MemoryVariantWriter {
    async fn commit(self: Box<Self>) -> Result<VariantMeta, CacheError> {
        let MemoryVariantWriter {
            buffer,
            mut meta,
            inner,
        } = *self;
        meta.size = buffer.len() as u64;
        meta.created = std::time::SystemTime::now();
        inner.write().await.insert(CachedVariant {
            data: Bytes::from(buffer),
            meta: meta.clone(),
        });
        Ok(meta)
    }
}
