use async_trait::async_trait;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, info};

use super::StorageProvider;
use crate::errors::{BackupError, Result};

const SCHEME: &str = "file://";

/// Stores artifacts under `{base_path}/{bucket}/{key}` on the local filesystem.
pub struct LocalStorageProvider {
    root: PathBuf,
}

impl LocalStorageProvider {
    pub fn new(base_path: PathBuf, bucket: String) -> Self {
        Self {
            root: base_path.join(bucket),
        }
    }

    fn path_for_key(&self, key: &str) -> Result<PathBuf> {
        let relative = Path::new(key);
        let clean = relative
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
        if key.is_empty() || !clean {
            return Err(BackupError::InvalidState(format!(
                "storage key escapes the storage root: {}",
                key
            )));
        }
        Ok(self.root.join(relative))
    }

    fn path_for_location(&self, location: &str) -> Result<PathBuf> {
        let raw = location.strip_prefix(SCHEME).ok_or_else(|| {
            BackupError::InvalidState(format!("not a local storage location: {}", location))
        })?;
        let path = PathBuf::from(raw);
        let escapes = path.components().any(|c| c == Component::ParentDir);
        if escapes || !path.starts_with(&self.root) {
            return Err(BackupError::InvalidState(format!(
                "location is outside the storage root: {}",
                location
            )));
        }
        Ok(path)
    }
}

#[async_trait]
impl StorageProvider for LocalStorageProvider {
    async fn upload(&self, local_path: &Path, key: &str) -> Result<String> {
        let target = self.path_for_key(key)?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                BackupError::Storage(format!("create {}: {}", parent.display(), e))
            })?;
        }
        let bytes = tokio::fs::copy(local_path, &target).await.map_err(|e| {
            BackupError::Storage(format!(
                "copy {} to {}: {}",
                local_path.display(),
                target.display(),
                e
            ))
        })?;
        info!(key, bytes, path = %target.display(), "Stored artifact locally");
        Ok(format!("{}{}", SCHEME, target.display()))
    }

    async fn download(&self, location: &str, destination: &Path) -> Result<PathBuf> {
        let source = self.path_for_location(location)?;
        if !tokio::fs::try_exists(&source).await? {
            return Err(BackupError::NotFound(format!("artifact {}", location)));
        }
        if let Some(parent) = destination.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::copy(&source, destination).await.map_err(|e| {
            BackupError::Storage(format!("copy {}: {}", source.display(), e))
        })?;
        debug!(location, destination = %destination.display(), "Fetched artifact");
        Ok(destination.to_path_buf())
    }

    async fn delete(&self, location: &str) -> Result<()> {
        let path = self.path_for_location(location)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(location, "Artifact already absent");
                Ok(())
            }
            Err(e) => Err(BackupError::Storage(format!("delete {}: {}", path.display(), e))),
        }
    }
}
