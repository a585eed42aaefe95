use async_trait::async_trait;
use aws_sdk_s3 as s3;
use s3::config::Region;
use s3::primitives::ByteStream;
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use super::StorageProvider;
use crate::config::SpacesConfig;
use crate::errors::{BackupError, Result};

/// Parses an S3 URI (s3://bucket/key) into bucket and key.
pub fn parse_s3_uri(s3_uri: &str) -> Result<(String, String)> {
    let uri = url::Url::parse(s3_uri)
        .map_err(|e| BackupError::Parse(format!("invalid S3 URI {}: {}", s3_uri, e)))?;
    if uri.scheme() != "s3" {
        return Err(BackupError::Parse(format!("S3 URI must start with s3://: {}", s3_uri)));
    }
    let bucket = uri
        .host_str()
        .ok_or_else(|| BackupError::Parse(format!("S3 URI missing bucket name: {}", s3_uri)))?
        .to_string();
    let key = uri.path().trim_start_matches('/').to_string();
    if key.is_empty() {
        return Err(BackupError::Parse(format!("S3 URI missing object key: {}", s3_uri)));
    }
    Ok((bucket, key))
}

/// S3-compatible object storage (AWS, DigitalOcean Spaces, MinIO).
pub struct S3StorageProvider {
    client: s3::Client,
    bucket_name: String,
    folder_prefix: Option<String>,
}

impl S3StorageProvider {
    pub async fn connect(spaces_config: &SpacesConfig) -> Self {
        let sdk_config = aws_config::defaults(s3::config::BehaviorVersion::latest())
            .endpoint_url(&spaces_config.endpoint_url)
            .region(Region::new(spaces_config.region.clone()))
            .credentials_provider(s3::config::Credentials::new(
                &spaces_config.access_key_id,
                &spaces_config.secret_access_key,
                None,
                None,
                "Static",
            ))
            .load()
            .await;

        Self {
            client: s3::Client::new(&sdk_config),
            bucket_name: spaces_config.bucket_name.clone(),
            folder_prefix: spaces_config.folder_prefix.clone(),
        }
    }

    fn object_key(&self, key: &str) -> String {
        match &self.folder_prefix {
            Some(prefix) => format!("{}/{}", prefix.trim_end_matches('/'), key),
            None => key.to_string(),
        }
    }
}

#[async_trait]
impl StorageProvider for S3StorageProvider {
    async fn upload(&self, local_path: &Path, key: &str) -> Result<String> {
        let object_key = self.object_key(key);
        debug!(bucket = %self.bucket_name, key = %object_key, "Uploading artifact");

        let body = ByteStream::from_path(local_path).await.map_err(|e| {
            BackupError::Storage(format!("read {}: {}", local_path.display(), e))
        })?;

        self.client
            .put_object()
            .bucket(&self.bucket_name)
            .key(&object_key)
            .body(body)
            .send()
            .await
            .map_err(|e| {
                BackupError::Storage(format!(
                    "upload to s3://{}/{}: {}",
                    self.bucket_name, object_key, e
                ))
            })?;

        let location = format!("s3://{}/{}", self.bucket_name, object_key);
        info!(location = %location, "Uploaded artifact");
        Ok(location)
    }

    async fn download(&self, location: &str, destination: &Path) -> Result<PathBuf> {
        let (bucket, key) = parse_s3_uri(location)?;
        if let Some(parent) = destination.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut object = self
            .client
            .get_object()
            .bucket(&bucket)
            .key(&key)
            .send()
            .await
            .map_err(|e| BackupError::Storage(format!("get {}: {}", location, e)))?;

        let mut output_file = File::create(destination).await?;
        let mut total_bytes = 0usize;
        while let Some(chunk) = object
            .body
            .try_next()
            .await
            .map_err(|e| BackupError::Storage(format!("read {}: {}", location, e)))?
        {
            output_file.write_all(&chunk).await?;
            total_bytes += chunk.len();
        }
        output_file.flush().await?;

        info!(location, bytes = total_bytes, destination = %destination.display(), "Downloaded artifact");
        Ok(destination.to_path_buf())
    }

    async fn delete(&self, location: &str) -> Result<()> {
        let (bucket, key) = parse_s3_uri(location)?;
        self.client
            .delete_object()
            .bucket(&bucket)
            .key(&key)
            .send()
            .await
            .map_err(|e| BackupError::Storage(format!("delete {}: {}", location, e)))?;
        debug!(location, "Deleted artifact");
        Ok(())
    }
}
