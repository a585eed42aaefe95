use tracing::{debug, warn};

use crate::backup::{Artifact, BackupExecutor};
use crate::errors::Result;
use crate::model::BackupRecord;
use crate::reliability::ChecksumService;

/// Checks a downloaded artifact before it is applied. Returns the reason it must not
/// be restored, or `None` when it is fit to apply.
pub async fn verify_downloaded(
    checksums: &ChecksumService,
    executor: &dyn BackupExecutor,
    record: &BackupRecord,
    artifact: &Artifact,
) -> Result<Option<String>> {
    match &record.checksum {
        Some(expected) => {
            if !checksums.verify_sha256(&artifact.path, &expected.sha256).await? {
                return Ok(Some(format!("checksum mismatch for backup {}", record.id)));
            }
            debug!(id = record.id, "Checksum verified");
        }
        None => warn!(id = record.id, "Backup has no recorded checksum, skipping verification"),
    }
    if !executor.verify(artifact).await? {
        return Ok(Some(format!("artifact of backup {} is missing or empty", record.id)));
    }
    Ok(None)
}
