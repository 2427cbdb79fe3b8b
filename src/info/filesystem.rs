use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use super::{Info, InfoCache};
use crate::error::CacheError;
use crate::operation::Identifier;

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// [`InfoCache`] storing one JSON document per identifier.
///
/// Layout under the root directory:
///
/// ```text
/// <root>/info/<sha256(identifier)>.json
/// <root>/tmp/                      (in-progress writes)
/// ```
///
/// Documents are written to `tmp/` and renamed into place, so readers see
/// either the old or the new document.
#[derive(Debug, Clone)]
pub struct FilesystemInfoCache {
    root: PathBuf,
}

impl FilesystemInfoCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn info_dir(&self) -> PathBuf {
        self.root.join("info")
    }

    fn path_for(&self, identifier: &Identifier) -> PathBuf {
        let digest = hex::encode(Sha256::digest(identifier.as_str().as_bytes()));
        self.info_dir().join(format!("{}.json", digest))
    }

    fn temp_path(&self) -> PathBuf {
        let n = TEMP_COUNTER.fetch_add(1, Ordering::Relaxed);
        self.root
            .join("tmp")
            .join(format!("info-{}-{}.json", std::process::id(), n))
    }
}

async fn remove_if_present(path: &Path) -> Result<(), CacheError> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[async_trait]
impl InfoCache for FilesystemInfoCache {
    async fn get(&self, identifier: &Identifier) -> Result<Option<Info>, CacheError> {
        let data = match tokio::fs::read(self.path_for(identifier)).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let info: Info = serde_json::from_slice(&data)?;
        // Digest collision.
        if &info.identifier != identifier {
            return Ok(None);
        }
        Ok(Some(info))
    }

    async fn put(&self, identifier: &Identifier, info: &Info) -> Result<(), CacheError> {
        let data = serde_json::to_vec(info)?;
        let target = self.path_for(identifier);
        let temp = self.temp_path();

        tokio::fs::create_dir_all(self.info_dir()).await?;
        tokio::fs::create_dir_all(self.root.join("tmp")).await?;
        tokio::fs::write(&temp, &data).await?;
        if let Err(e) = tokio::fs::rename(&temp, &target).await {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(e.into());
        }
        Ok(())
    }

    async fn purge(&self, identifier: &Identifier) -> Result<(), CacheError> {
        remove_if_present(&self.path_for(identifier)).await
    }

    async fn purge_all(&self) -> Result<(), CacheError> {
        match tokio::fs::remove_dir_all(self.info_dir()).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
