use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::{debug, warn};

use super::{CachedVariant, VariantCache, VariantMeta, VariantWriter};
use crate::error::CacheError;
use crate::operation::OperationList;

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Variant cache on the local filesystem.
///
/// Layout under the root directory:
///
/// ```text
/// <root>/variants/<aa>/<bb>/<key>        encoded bytes
/// <root>/variants/<aa>/<bb>/<key>.json   VariantMeta sidecar
/// <root>/tmp/                            in-progress writes
/// ```
///
/// `<aa>` and `<bb>` are the first two byte pairs of the hex key. Data is
/// written to `tmp/` and renamed into place on commit, followed by the
/// sidecar. An entry counts as present only when both files exist and the
/// data length matches the sidecar.
#[derive(Debug, Clone)]
pub struct FilesystemVariantCache {
    root: PathBuf,
}

impl FilesystemVariantCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn variants_dir(&self) -> PathBuf {
        self.root.join("variants")
    }

    fn temp_dir(&self) -> PathBuf {
        self.root.join("tmp")
    }

    fn data_path(&self, key: &str) -> PathBuf {
        let (a, b) = shard(key);
        self.variants_dir().join(a).join(b).join(key)
    }

    fn meta_path(&self, key: &str) -> PathBuf {
        let (a, b) = shard(key);
        self.variants_dir()
            .join(a)
            .join(b)
            .join(format!("{}.json", key))
    }

    fn temp_path(&self, key: &str) -> PathBuf {
        let n = TEMP_COUNTER.fetch_add(1, Ordering::Relaxed);
        self.temp_dir()
            .join(format!("{}-{}-{}.tmp", key, std::process::id(), n))
    }

    async fn read_meta(&self, key: &str) -> Result<Option<VariantMeta>, CacheError> {
        match tokio::fs::read(self.meta_path(key)).await {
            Ok(data) => Ok(Some(serde_json::from_slice(&data)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Remove stale temp files left by a crashed process.
    pub async fn clean_temp(&self) -> Result<usize, CacheError> {
        let mut dir = match tokio::fs::read_dir(self.temp_dir()).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };
        let prefix = format!("-{}-", std::process::id());
        let mut removed = 0;
        while let Some(entry) = dir.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            // Files of this process may belong to live writers.
            if name.contains(&prefix) {
                continue;
            }
            if remove_if_present(&entry.path()).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }
}

fn shard(key: &str) -> (&str, &str) {
    let a = key.get(0..2).unwrap_or("00");
    let b = key.get(2..4).unwrap_or("00");
    (a, b)
}

async fn remove_if_present(path: &Path) -> Result<bool, CacheError> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

async fn read_dir_paths(path: &Path) -> Result<Vec<PathBuf>, CacheError> {
    let mut dir = match tokio::fs::read_dir(path).await {
        Ok(dir) => dir,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let mut paths = Vec::new();
    while let Some(entry) = dir.next_entry().await? {
        paths.push(entry.path());
    }
    Ok(paths)
}

#[async_trait]
impl VariantCache for FilesystemVariantCache {
    async fn read(&self, ops: &OperationList) -> Result<Option<CachedVariant>, CacheError> {
        let Some(meta) = self.read_meta(ops.key()).await? else {
            return Ok(None);
        };
        let data = match tokio::fs::read(self.data_path(ops.key())).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if data.len() as u64 != meta.size || meta.canonical != ops.canonical() {
            // Sidecar and data from different generations.
            debug!(key = %ops.key(), "Variant sidecar mismatch, treating as miss");
            return Ok(None);
        }
        Ok(Some(CachedVariant {
            data: Bytes::from(data),
            meta,
        }))
    }

    async fn exists(&self, ops: &OperationList) -> Result<bool, CacheError> {
        let meta = tokio::fs::try_exists(self.meta_path(ops.key())).await?;
        let data = tokio::fs::try_exists(self.data_path(ops.key())).await?;
        Ok(meta && data)
    }

    async fn new_writer(
        &self,
        ops: &OperationList,
    ) -> Result<Box<dyn VariantWriter>, CacheError> {
        tokio::fs::create_dir_all(self.temp_dir()).await?;
        let temp = self.temp_path(ops.key());
        let file = tokio::fs::File::create(&temp).await?.into_std().await;

        Ok(Box::new(FilesystemVariantWriter {
            file: Some(BufWriter::new(file)),
            temp,
            data_path: self.data_path(ops.key()),
            meta_path: self.meta_path(ops.key()),
            sidecar_temp: self.temp_path(&format!("{}.json", ops.key())),
            meta: VariantMeta::for_operations(ops),
            written: 0,
        }))
    }

    async fn entries(&self) -> Result<Vec<VariantMeta>, CacheError> {
        let mut entries = Vec::new();
        for first in read_dir_paths(&self.variants_dir()).await? {
            for second in read_dir_paths(&first).await? {
                for path in read_dir_paths(&second).await? {
                    if path.extension().and_then(|e| e.to_str()) != Some("json") {
                        continue;
                    }
                    let data = match tokio::fs::read(&path).await {
                        Ok(data) => data,
                        // Removed concurrently.
                        Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                        Err(e) => return Err(e.into()),
                    };
                    match serde_json::from_slice::<VariantMeta>(&data) {
                        Ok(meta) => entries.push(meta),
                        Err(e) => {
                            warn!(path = %path.display(), error = %e, "Skipping unreadable sidecar")
                        }
                    }
                }
            }
        }
        Ok(entries)
    }

    async fn remove(&self, key: &str) -> Result<bool, CacheError> {
        // Sidecar first: without it the entry is already a miss.
        let meta = remove_if_present(&self.meta_path(key)).await?;
        let data = remove_if_present(&self.data_path(key)).await?;
        Ok(meta || data)
    }

    async fn purge_all(&self) -> Result<(), CacheError> {
        match tokio::fs::remove_dir_all(self.variants_dir()).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Streams an entry into a temp file; commit renames it into place.
struct FilesystemVariantWriter {
    file: Option<BufWriter<File>>,
    temp: PathBuf,
    data_path: PathBuf,
    meta_path: PathBuf,
    sidecar_temp: PathBuf,
    meta: VariantMeta,
    written: u64,
}

impl Write for FilesystemVariantWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| std::io::Error::other("writer closed"))?;
        let n = file.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self.file.as_mut() {
            Some(file) => file.flush(),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl VariantWriter for FilesystemVariantWriter {
    async fn commit(self: Box<Self>) -> Result<VariantMeta, CacheError> {
        let mut this = *self;
        let file = this
            .file
            .take()
            .ok_or_else(|| CacheError::Closed("writer already committed".to_string()))?;
        tokio::task::spawn_blocking(move || -> Result<(), CacheError> {
            let file = file
                .into_inner()
                .map_err(|e| CacheError::Io(e.error().to_string()))?;
            file.sync_all()?;
            Ok(())
        })
        .await
        .map_err(|e| CacheError::Io(format!("sync task failed: {}", e)))??;

        let mut meta = this.meta.clone();
        meta.size = this.written;
        meta.created = SystemTime::now();
        let sidecar = serde_json::to_vec(&meta)?;

        if let Some(parent) = this.data_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&this.sidecar_temp, &sidecar).await?;

        // Retire any previous sidecar so the new data is never paired with it.
        remove_if_present(&this.meta_path).await?;
        tokio::fs::rename(&this.temp, &this.data_path).await?;
        tokio::fs::rename(&this.sidecar_temp, &this.meta_path).await?;

        debug!(key = %meta.key, size = meta.size, "Committed variant");
        Ok(meta)
    }
}

impl Drop for FilesystemVariantWriter {
    fn drop(&mut self) {
        // Either never committed or interrupted mid-commit.
        self.file.take();
        let _ = std::fs::remove_file(&self.temp);
        let _ = std::fs::remove_file(&self.sidecar_temp);
    }
}
