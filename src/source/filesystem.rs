use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;

use super::{Source, SourceResolver, StatResult};
use crate::error::IoError;
use crate::operation::Identifier;

/// Resolves identifiers to files beneath a root directory.
///
/// The identifier is interpreted as a relative path. Anything that would
/// escape the root (absolute paths, `..` components) resolves to not-found.
#[derive(Debug, Clone)]
pub struct FilesystemResolver {
    root: PathBuf,
}

impl FilesystemResolver {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, identifier: &Identifier) -> Option<PathBuf> {
        let relative = Path::new(identifier.as_str());
        if identifier.as_str().is_empty() {
            return None;
        }
        let safe = relative
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
        safe.then(|| self.root.join(relative))
    }
}

#[async_trait]
impl SourceResolver for FilesystemResolver {
    type Source = FilesystemSource;

    fn kind(&self) -> &'static str {
        "filesystem"
    }

    async fn resolve(&self, identifier: &Identifier) -> Result<Self::Source, IoError> {
        let path = self
            .path_for(identifier)
            .ok_or_else(|| IoError::NotFound(identifier.to_string()))?;
        let location = path.display().to_string();
        Ok(FilesystemSource { path, location })
    }
}

/// A file on the local filesystem.
#[derive(Debug, Clone)]
pub struct FilesystemSource {
    path: PathBuf,
    location: String,
}

#[async_trait]
impl Source for FilesystemSource {
    async fn stat(&self) -> Result<StatResult, IoError> {
        let metadata = tokio::fs::metadata(&self.path)
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => IoError::NotFound(self.location.clone()),
                _ => IoError::Filesystem(format!("{}: {}", self.location, e)),
            })?;
        if !metadata.is_file() {
            return Err(IoError::NotFound(self.location.clone()));
        }
        Ok(StatResult {
            last_modified: metadata.modified().ok(),
            length: Some(metadata.len()),
        })
    }

    async fn read(&self) -> Result<Bytes, IoError> {
        let data = tokio::fs::read(&self.path)
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => IoError::NotFound(self.location.clone()),
                _ => IoError::Filesystem(format!("{}: {}", self.location, e)),
            })?;
        Ok(Bytes::from(data))
    }

    fn location(&self) -> &str {
        &self.location
    }
}
