//! Background cache maintenance.
//!
//! A [`CacheWorker`] runs periodic passes over the caches of an
//! [`ImageService`]:
//!
//! ```text
//! purge_invalid ─► purge_expired (TTL) ─► evict_to_size (max bytes) ─► pre-warm
//! ```
//!
//! Passes never overlap: a pass that outlasts the interval makes the next
//! tick a no-op. A failing step is logged and the pass moves on.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::pipeline::{ImageRequest, ImageService};
use crate::source::SourceResolver;

/// What the worker does on each pass.
#[derive(Debug, Clone, Default)]
pub struct WorkerConfig {
    /// Remove variants older than this.
    pub max_age: Option<Duration>,
    /// Shrink the variant cache to at most this many bytes.
    pub max_size: Option<u64>,
    /// Requests kept cached.
    pub prewarm: Vec<ImageRequest>,
}

/// Counts from one maintenance pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassReport {
    pub invalid: usize,
    pub expired: usize,
    pub evicted: usize,
    pub warmed: usize,
    /// Steps that failed.
    pub failures: usize,
}

/// Periodic cache maintenance for one service.
pub struct CacheWorker<R: SourceResolver> {
    service: Arc<ImageService<R>>,
    config: WorkerConfig,
    running: AtomicBool,
}

/// Clears the running flag when a pass ends, even by panic.
struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl<R: SourceResolver> CacheWorker<R> {
    pub fn new(service: Arc<ImageService<R>>, config: WorkerConfig) -> Self {
        Self {
            service,
            config,
            running: AtomicBool::new(false),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Run one pass. Returns `None` if a pass is already in progress.
    pub async fn run_once(&self) -> Option<PassReport> {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Cache worker pass already running, skipping");
            return None;
        }
        let _guard = RunningGuard(&self.running);

        let mut report = PassReport::default();

        match self.service.purge_invalid().await {
            Ok(purged) => report.invalid = purged.removed,
            Err(e) => {
                warn!(error = %e, step = "purge_invalid", "Cache worker step failed");
                report.failures += 1;
            }
        }

        if let Some(cache) = self.service.variant_cache() {
            if let Some(max_age) = self.config.max_age {
                match cache.purge_expired(max_age).await {
                    Ok(n) => report.expired = n,
                    Err(e) => {
                        warn!(error = %e, step = "purge_expired", "Cache worker step failed");
                        report.failures += 1;
                    }
                }
            }
            if let Some(max_size) = self.config.max_size {
                match cache.evict_to_size(max_size).await {
                    Ok(n) => report.evicted = n,
                    Err(e) => {
                        warn!(error = %e, step = "evict_to_size", "Cache worker step failed");
                        report.failures += 1;
                    }
                }
            }
        }

        for request in &self.config.prewarm {
            match self.service.warm(request).await {
                Ok(true) => report.warmed += 1,
                Ok(false) => {}
                Err(e) => {
                    warn!(
                        identifier = %request.identifier,
                        error = %e,
                        step = "prewarm",
                        "Cache worker step failed"
                    );
                    report.failures += 1;
                }
            }
        }

        info!(
            invalid = report.invalid,
            expired = report.expired,
            evicted = report.evicted,
            warmed = report.warmed,
            failures = report.failures,
            "Cache worker pass complete"
        );
        Some(report)
    }

    /// Run passes every `interval` until the returned task is aborted.
    pub fn spawn(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let worker = Arc::clone(&self);
                // A panicking pass must not end the schedule.
                if let Err(e) = tokio::spawn(async move { worker.run_once().await }).await {
                    warn!(error = %e, "Cache worker pass aborted");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{MemoryVariantCache, VariantCache};
    use crate::codec::CodecRegistry;
    use crate::source::FilesystemResolver;
    use std::io::Cursor;

    fn write_png(dir: &std::path::Path, name: &str) {
        let img = image::RgbImage::from_pixel(8, 8, image::Rgb([10, 20, 30]));
        let mut buf = Cursor::new(Vec::new());
        image::DynamicImage::ImageRgb8(img)
            .write_to(&mut buf, image::ImageFormat::Png)
            .unwrap();
        std::fs::write(dir.join(name), buf.into_inner()).unwrap();
    }

    fn service(
        root: &std::path::Path,
        cache: &MemoryVariantCache,
    ) -> Arc<ImageService<FilesystemResolver>> {
        Arc::new(
            ImageService::new(
                FilesystemResolver::new(root),
                Arc::new(CodecRegistry::with_defaults()),
            )
            .with_variant_cache(Arc::new(cache.clone())),
        )
    }

    #[tokio::test]
    async fn test_prewarm_then_purge_missing_source() {
        let dir = tempfile::tempdir().unwrap();
        write_png(dir.path(), "a.png");
        let cache = MemoryVariantCache::new();
        let request = ImageRequest::parse("a.png", "full", "max", "0", "default.png").unwrap();
        let worker = CacheWorker::new(
            service(dir.path(), &cache),
            WorkerConfig {
                prewarm: vec![request],
                ..WorkerConfig::default()
            },
        );

        let report = worker.run_once().await.unwrap();
        assert_eq!(report.warmed, 1);
        assert_eq!(report.failures, 0);

        // Commit happens after the body is drained; wait for it.
        for _ in 0..50 {
            if !cache.is_empty().await {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(cache.len().await, 1);

        std::fs::remove_file(dir.path().join("a.png")).unwrap();
        let report = worker.run_once().await.unwrap();
        assert_eq!(report.invalid, 1);
        assert_eq!(report.failures, 1); // pre-warm of the removed source
        assert!(cache.entries().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_passes_do_not_overlap() {
        let dir = tempfile::tempdir().unwrap();
        let cache = MemoryVariantCache::new();
        let worker = CacheWorker::new(service(dir.path(), &cache), WorkerConfig::default());

        worker.running.store(true, Ordering::Release);
        assert!(worker.run_once().await.is_none());
        worker.running.store(false, Ordering::Release);
        assert!(worker.run_once().await.is_some());
        assert!(!worker.is_running());
    }
}
