//! Object storage for backup artifacts.

pub mod local;
pub mod replicated;
pub mod s3;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::{StorageBackend, StorageConfig};
use crate::errors::Result;
use crate::model::BackupKind;

pub use local::LocalStorageProvider;
pub use replicated::{Replica, ReplicatedStorage};
pub use s3::S3StorageProvider;

#[async_trait]
pub trait StorageProvider: Send + Sync {
    /// Stores `local_path` under `key` and returns the location URI recorded on the
    /// backup record.
    async fn upload(&self, local_path: &Path, key: &str) -> Result<String>;

    /// Fetches the object at `location` into `destination`.
    async fn download(&self, location: &str, destination: &Path) -> Result<PathBuf>;

    async fn delete(&self, location: &str) -> Result<()>;
}

/// `{datasource}/{task}/{kind}/{kind}_{timestamp}.{ext}`, e.g.
/// `mysql/42/full/full_20240501T020000123Z.sql`.
pub fn storage_key(
    datasource_type: &str,
    task_id: i64,
    kind: BackupKind,
    started_at: DateTime<Utc>,
    extension: &str,
) -> String {
    format!(
        "{ds}/{task}/{kind}/{kind}_{ts}.{ext}",
        ds = datasource_type,
        task = task_id,
        kind = kind.slug(),
        ts = started_at.format("%Y%m%dT%H%M%S%3fZ"),
        ext = extension.trim_start_matches('.'),
    )
}

async fn build_backend(backend: &StorageBackend, bucket: &str) -> Arc<dyn StorageProvider> {
    match backend {
        StorageBackend::Local { base_path } => Arc::new(LocalStorageProvider::new(
            base_path.clone(),
            bucket.to_string(),
        )),
        StorageBackend::S3(spaces_config) => Arc::new(S3StorageProvider::connect(spaces_config).await),
    }
}

/// The replicated store, when any replica is enabled.
pub async fn build_replicated(config: &StorageConfig) -> Result<Option<Arc<ReplicatedStorage>>> {
    if config.replicas.is_empty() {
        return Ok(None);
    }
    let mut replicas = Vec::with_capacity(config.replicas.len());
    for replica in &config.replicas {
        replicas.push(Replica::new(
            replica.name.clone(),
            build_backend(&replica.backend, &config.bucket).await,
        ));
    }
    Ok(Some(Arc::new(ReplicatedStorage::new(replicas)?)))
}

pub async fn build_storage(config: &StorageConfig) -> Result<Arc<dyn StorageProvider>> {
    match build_replicated(config).await? {
        Some(replicated) => Ok(replicated),
        None => Ok(build_backend(&config.backend, &config.bucket).await),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReplicaConfig;
    use chrono::TimeZone;

    #[tokio::test]
    async fn test_enabled_replicas_replace_the_single_backend() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = StorageConfig {
            bucket: "backup".into(),
            backend: StorageBackend::Local { base_path: dir.path().join("single") },
            replicas: Vec::new(),
        };
        assert!(build_replicated(&config).await.unwrap().is_none());

        config.replicas = ["a", "b"]
            .into_iter()
            .map(|name| ReplicaConfig {
                name: name.into(),
                backend: StorageBackend::Local { base_path: dir.path().join(name) },
            })
            .collect();
        let replicated = build_replicated(&config).await.unwrap().unwrap();
        assert_eq!(replicated.replica_names().collect::<Vec<_>>(), vec!["a", "b"]);

        let source = dir.path().join("dump.sql");
        tokio::fs::write(&source, b"x").await.unwrap();
        let location = build_storage(&config).await.unwrap().upload(&source, "mysql/1/full/f.sql").await.unwrap();
        assert!(location.starts_with("replicated:"));
        assert!(!dir.path().join("single").exists());
    }

    #[test]
    fn test_storage_key_layout() {
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 2, 0, 0).unwrap()
            + chrono::Duration::milliseconds(123);
        assert_eq!(
            storage_key("mysql", 42, BackupKind::Full, at, "sql"),
            "mysql/42/full/full_20240501T020000123Z.sql"
        );
        assert_eq!(
            storage_key("postgres", 7, BackupKind::Incremental, at, ".sql.gz"),
            "postgres/7/incremental/incremental_20240501T020000123Z.sql.gz"
        );
    }
}
