//! Per-key generation locks.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

type LockMap = Arc<Mutex<HashMap<String, Arc<AsyncMutex<()>>>>>;

/// A table of async mutexes keyed by canonical cache key.
///
/// Locks for different keys never contend. An entry lives only while some
/// task holds or awaits it; the last guard to leave removes it.
#[derive(Debug, Clone, Default)]
pub struct KeyLockTable {
    locks: LockMap,
}

impl KeyLockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive ownership of `key`.
    pub async fn lock(&self, key: &str) -> KeyGuard {
        let lock = {
            let mut map = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            Arc::clone(map.entry(key.to_string()).or_default())
        };
        let guard = lock.lock_owned().await;
        KeyGuard {
            key: key.to_string(),
            table: Arc::clone(&self.locks),
            guard: Some(guard),
        }
    }

    /// Number of keys currently held or awaited.
    pub fn len(&self) -> usize {
        self.locks.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Exclusive ownership of one key. Releases on drop.
#[derive(Debug)]
pub struct KeyGuard {
    key: String,
    table: LockMap,
    guard: Option<OwnedMutexGuard<()>>,
}

impl KeyGuard {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for KeyGuard {
    fn drop(&mut self) {
        // Release first so our own reference no longer counts.
        self.guard.take();
        let mut map = self.table.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(lock) = map.get(&self.key) {
            if Arc::strong_count(lock) == 1 {
                map.remove(&self.key);
            }
        }
    }
}
