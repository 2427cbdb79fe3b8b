use std::num::NonZeroUsize;

use async_trait::async_trait;
use lru::LruCache;
use tokio::sync::RwLock;

use super::{Info, InfoCache};
use crate::error::CacheError;
use crate::operation::Identifier;

/// Default number of cached `Info` entries.
pub const DEFAULT_INFO_CACHE_CAPACITY: usize = 10_000;

/// In-process LRU [`InfoCache`].
pub struct MemoryInfoCache {
    cache: RwLock<LruCache<Identifier, Info>>,
}

impl MemoryInfoCache {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_INFO_CACHE_CAPACITY)
    }

    /// # Arguments
    ///
    /// * `capacity` - Maximum number of entries (at least 1)
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            cache: RwLock::new(LruCache::new(capacity)),
        }
    }

    pub async fn len(&self) -> usize {
        self.cache.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.cache.read().await.is_empty()
    }
}

impl Default for MemoryInfoCache {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl InfoCache for MemoryInfoCache {
    async fn get(&self, identifier: &Identifier) -> Result<Option<Info>, CacheError> {
        // Write lock: `get` promotes the entry.
        let mut cache = self.cache.write().await;
        Ok(cache.get(identifier).cloned())
    }

    async fn put(&self, identifier: &Identifier, info: &Info) -> Result<(), CacheError> {
        let mut cache = self.cache.write().await;
        cache.put(identifier.clone(), info.clone());
        Ok(())
    }

    async fn purge(&self, identifier: &Identifier) -> Result<(), CacheError> {
        self.cache.write().await.pop(identifier);
        Ok(())
    }

    async fn purge_all(&self) -> Result<(), CacheError> {
        self.cache.write().await.clear();
        Ok(())
    }
}
