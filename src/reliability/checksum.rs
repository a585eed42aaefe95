use md5::Md5;
use sha2::{Digest, Sha256};
use std::path::Path;
use tokio::fs::File;
use tokio::io::AsyncReadExt;
use tracing::debug;

use crate::errors::{BackupError, Result};
use crate::model::Checksum;

const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Computes MD5 and SHA-256 over the exact bytes of a file in a single pass.
#[derive(Debug, Clone, Default)]
pub struct ChecksumService;

impl ChecksumService {
    pub fn new() -> Self {
        Self
    }

    pub async fn compute(&self, path: &Path) -> Result<Checksum> {
        let mut file = File::open(path).await.map_err(|e| {
            BackupError::Io(std::io::Error::new(
                e.kind(),
                format!("Failed to open {} for checksum: {}", path.display(), e),
            ))
        })?;

        let mut md5 = Md5::new();
        let mut sha256 = Sha256::new();
        let mut buffer = vec![0u8; READ_BUFFER_SIZE];
        let mut total = 0u64;
        loop {
            let read = file.read(&mut buffer).await?;
            if read == 0 {
                break;
            }
            md5.update(&buffer[..read]);
            sha256.update(&buffer[..read]);
            total += read as u64;
        }

        let checksum = Checksum {
            md5: hex::encode(md5.finalize()),
            sha256: hex::encode(sha256.finalize()),
        };
        debug!(path = %path.display(), bytes = total, md5 = %checksum.md5, "Checksum computed");
        Ok(checksum)
    }

    /// Compares a file against an expected SHA-256 (case-insensitive hex).
    pub async fn verify_sha256(&self, path: &Path, expected: &str) -> Result<bool> {
        let actual = self.compute(path).await?;
        Ok(actual.sha256.eq_ignore_ascii_case(expected))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[tokio::test]
    async fn test_checksum_of_known_content() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"Hello, World!").unwrap();

        let checksum = ChecksumService::new().compute(file.path()).await.unwrap();
        assert_eq!(checksum.md5, "65a8e27d8879283831b664bd8b7f0ad4");
        assert_eq!(
            checksum.sha256,
            "dffd6021bb2bd5b0af676290809ec3a53191dd81c7f70a4b28688a362182986f"
        );
    }

    #[tokio::test]
    async fn test_checksum_of_empty_file() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let checksum = ChecksumService::new().compute(file.path()).await.unwrap();
        assert_eq!(checksum.md5, "d41d8cd98f00b204e9800998ecf8427e");
        assert_eq!(
            checksum.sha256,
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[tokio::test]
    async fn test_missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = ChecksumService::new().compute(&dir.path().join("absent.sql")).await;
        assert!(matches!(result, Err(BackupError::Io(_))));
    }

    #[tokio::test]
    async fn test_verify_sha256_ignores_case() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"Hello, World!").unwrap();
        let service = ChecksumService::new();
        assert!(service
            .verify_sha256(file.path(), "DFFD6021BB2BD5B0AF676290809EC3A53191DD81C7F70A4B28688A362182986F")
            .await
            .unwrap());
        assert!(!service.verify_sha256(file.path(), "00").await.unwrap());
    }
}
