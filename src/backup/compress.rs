use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::errors::{BackupError, Result};

pub const GZIP_SUFFIX: &str = ".gz";

pub fn is_gzip(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == "gz")
}

fn gzip_blocking(source: &Path, destination: &Path) -> Result<u64> {
    let mut input = BufReader::new(File::open(source)?);
    let output = BufWriter::new(File::create(destination)?);
    let mut encoder = GzEncoder::new(output, Compression::default());
    std::io::copy(&mut input, &mut encoder)?;
    let mut output = encoder.finish()?;
    output.flush()?;
    Ok(std::fs::metadata(destination)?.len())
}

fn gunzip_blocking(source: &Path, destination: &Path) -> Result<u64> {
    let mut decoder = GzDecoder::new(BufReader::new(File::open(source)?));
    let mut output = BufWriter::new(File::create(destination)?);
    let bytes = std::io::copy(&mut decoder, &mut output)?;
    output.flush()?;
    Ok(bytes)
}

/// Compresses `source` into `{source}.gz`, removes `source` and returns the new path.
pub async fn gzip_file(source: &Path) -> Result<PathBuf> {
    let mut name = source.as_os_str().to_owned();
    name.push(GZIP_SUFFIX);
    let destination = PathBuf::from(name);

    let (src, dst) = (source.to_path_buf(), destination.clone());
    let result = tokio::task::spawn_blocking(move || gzip_blocking(&src, &dst))
        .await
        .map_err(|e| BackupError::InvalidState(format!("compression task failed: {}", e)))?;
    match result {
        Ok(bytes) => {
            tokio::fs::remove_file(source).await?;
            debug!(path = %destination.display(), bytes, "Compressed artifact");
            Ok(destination)
        }
        Err(e) => {
            let _ = tokio::fs::remove_file(&destination).await;
            Err(e)
        }
    }
}

/// Decompresses a `.gz` file to `destination`.
pub async fn gunzip_file(source: &Path, destination: &Path) -> Result<u64> {
    let (src, dst) = (source.to_path_buf(), destination.to_path_buf());
    tokio::task::spawn_blocking(move || gunzip_blocking(&src, &dst))
        .await
        .map_err(|e| BackupError::InvalidState(format!("decompression task failed: {}", e)))?
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_gzip_then_gunzip_restores_content() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("dump.sql");
        let body = "INSERT INTO t VALUES (1);\n".repeat(500);
        std::fs::write(&source, &body).unwrap();

        let compressed = gzip_file(&source).await.unwrap();
        assert!(is_gzip(&compressed));
        assert!(!source.exists());
        assert!(std::fs::metadata(&compressed).unwrap().len() < body.len() as u64);

        let restored = dir.path().join("restored.sql");
        let bytes = gunzip_file(&compressed, &restored).await.unwrap();
        assert_eq!(bytes, body.len() as u64);
        assert_eq!(std::fs::read_to_string(&restored).unwrap(), body);
    }

    #[tokio::test]
    async fn test_gunzip_rejects_plain_text() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("plain.sql.gz");
        std::fs::write(&source, "not gzip").unwrap();
        assert!(gunzip_file(&source, &dir.path().join("out.sql")).await.is_err());
    }
}
