use std::collections::BTreeSet;
use std::sync::Arc;

use tokio::sync::RwLock;

/// The set of source implementations that have served at least one request.
///
/// Keyed by implementation name, not by identifier. Cloning shares the set.
#[derive(Debug, Clone, Default)]
pub struct SourceUsage {
    kinds: Arc<RwLock<BTreeSet<&'static str>>>,
}

impl SourceUsage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `kind` was used.
    pub async fn record(&self, kind: &'static str) {
        // Fast path: already recorded.
        if self.kinds.read().await.contains(kind) {
            return;
        }
        self.kinds.write().await.insert(kind);
    }

    /// Names of all implementations used so far, sorted.
    pub async fn kinds(&self) -> Vec<&'static str> {
        self.kinds.read().await.iter().copied().collect()
    }
}
