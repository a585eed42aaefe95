use chrono::Utc;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};

use super::compress::gzip_file;
use super::executor::{Artifact, BackupExecutor, BackupRequest, ExecutorRegistry, remove_partial};
use crate::audit::AuditStore;
use crate::chain::IncrementalChain;
use crate::errors::{BackupError, Result};
use crate::metrics::OperationMetrics;
use crate::model::{BackupKind, BackupOutcome, BackupRecord, LogPosition};
use crate::reliability::{ChecksumService, LockManager, RetryPolicy, task_lock_key, with_lock};
use crate::storage::{StorageProvider, storage_key};

/// Wraps every executor with locking, retrying, checksums, upload and the audit record.
pub struct BackupPipeline {
    registry: ExecutorRegistry,
    locks: Arc<dyn LockManager>,
    retry: RetryPolicy,
    checksums: ChecksumService,
    storage: Arc<dyn StorageProvider>,
    audit: Arc<dyn AuditStore>,
    metrics: Arc<OperationMetrics>,
    compress: bool,
}

impl BackupPipeline {
    pub fn new(
        registry: ExecutorRegistry,
        locks: Arc<dyn LockManager>,
        retry: RetryPolicy,
        storage: Arc<dyn StorageProvider>,
        audit: Arc<dyn AuditStore>,
    ) -> Self {
        Self {
            registry,
            locks,
            retry,
            checksums: ChecksumService::new(),
            storage,
            audit,
            metrics: Arc::new(OperationMetrics::new()),
            compress: false,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<OperationMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_compression(mut self, compress: bool) -> Self {
        self.compress = compress;
        self
    }

    /// Runs one backup to a terminal record. At most one run per datasource and task
    /// executes at a time.
    pub async fn run(&self, request: BackupRequest) -> Result<BackupRecord> {
        let executor = self.registry.get(request.datasource_type())?;
        let key = task_lock_key(request.datasource_type(), request.task_id);
        with_lock(self.locks.as_ref(), &key, || async {
            let started = Instant::now();
            self.metrics.backup_started();
            let result = self
                .retry
                .run("backup", |attempt| self.attempt(executor.as_ref(), &request, attempt))
                .await;
            self.metrics.backup_finished(result.is_ok(), started.elapsed());
            if let Ok(record) = &result {
                self.metrics
                    .uploaded(u64::try_from(record.file_size_bytes.unwrap_or(0)).unwrap_or(0));
            }
            result
        })
        .await
    }

    async fn attempt(&self, executor: &dyn BackupExecutor, request: &BackupRequest, attempt: u32) -> Result<BackupRecord> {
        if attempt > 1 {
            self.metrics.retried();
        }
        let request = self.resolve(request).await?;
        let mut record = BackupRecord::running(
            request.task_id,
            request.datasource_type(),
            request.kind,
            request.base_full_id,
            Utc::now(),
        );
        record.id = self.audit.insert_backup(&record).await?;
        info!(
            id = record.id,
            task_id = record.task_id,
            kind = %record.kind,
            datasource = %record.datasource_type,
            attempt,
            "Backup started"
        );

        let committed = match self.produce(executor, &request, &record).await {
            Ok(outcome) => self.commit(&record, outcome).await,
            Err(e) => Err(e),
        };
        match committed {
            Ok(record) => {
                info!(
                    id = record.id,
                    size = record.file_size_bytes.unwrap_or(0),
                    location = record.storage_location.as_deref().unwrap_or(""),
                    duration_secs = record.duration_seconds.unwrap_or(0),
                    "Backup succeeded"
                );
                Ok(record)
            }
            Err(e) => {
                error!(id = record.id, error = %e, "Backup failed");
                record.mark_failed(e.to_string(), Utc::now())?;
                if let Err(update_err) = self.audit.update_backup(&record).await {
                    warn!(id = record.id, error = %update_err, "Could not record backup failure");
                }
                Err(e)
            }
        }
    }

    /// Persists the SUCCESS state. When that write fails the uploaded object is
    /// removed and the record is left RUNNING for the caller to mark FAILED.
    async fn commit(&self, record: &BackupRecord, outcome: BackupOutcome) -> Result<BackupRecord> {
        let location = outcome.storage_location.clone();
        let mut done = record.clone();
        done.mark_success(outcome, Utc::now())?;
        if let Err(e) = self.audit.update_backup(&done).await {
            if let Err(delete_err) = self.storage.delete(&location).await {
                warn!(location = %location, error = %delete_err, "Could not remove artifact of unrecorded backup");
            }
            return Err(e);
        }
        Ok(done)
    }

    /// Fills in the base full backup and start position of an incremental.
    async fn resolve(&self, request: &BackupRequest) -> Result<BackupRequest> {
        let mut request = request.clone();
        if request.kind != BackupKind::Incremental {
            return Ok(request);
        }
        let full = self
            .audit
            .latest_full_backup(request.task_id)
            .await?
            .ok_or_else(|| {
                BackupError::NotFound(format!("full backup for task {} to base an incremental on", request.task_id))
            })?;
        let incrementals = self
            .audit
            .success_backups(request.task_id)
            .await?
            .into_iter()
            .filter(|r| r.is_incremental() && r.base_full_id == Some(full.id))
            .collect();
        let chain = IncrementalChain::new(full, incrementals);
        request.base_full_id = Some(chain.full_backup.id);
        if request.start_position.is_none() {
            request.start_position = match &chain.newest_member().log_range_end {
                Some(token) => Some(token.parse::<LogPosition>()?),
                None => {
                    warn!(
                        task_id = request.task_id,
                        chain = %chain.chain_id,
                        "Chain tail has no end position, starting from the current position"
                    );
                    None
                }
            };
        }
        Ok(request)
    }

    async fn produce(&self, executor: &dyn BackupExecutor, request: &BackupRequest, record: &BackupRecord) -> Result<BackupOutcome> {
        let artifact = executor.execute(request).await?;
        let result = self.store(artifact.clone(), record).await;
        match &result {
            Ok((stored, _)) => remove_partial(&stored.path).await,
            Err(_) => {
                remove_partial(&artifact.path).await;
                let mut packed = artifact.path.as_os_str().to_owned();
                packed.push(super::compress::GZIP_SUFFIX);
                remove_partial(std::path::Path::new(&packed)).await;
            }
        }
        result.map(|(_, outcome)| outcome)
    }

    async fn store(&self, mut artifact: Artifact, record: &BackupRecord) -> Result<(Artifact, BackupOutcome)> {
        if !executor_output_ok(&artifact) {
            return Err(BackupError::InvalidState(format!(
                "executor produced an empty artifact at {}",
                artifact.path.display()
            )));
        }
        if self.compress {
            let packed = gzip_file(&artifact.path).await?;
            let (start, end) = (artifact.log_range_start.take(), artifact.log_range_end.take());
            artifact = Artifact::from_file(packed, artifact.kind).await?.with_range(start, end);
        }
        let checksum = self.checksums.compute(&artifact.path).await?;
        let key = storage_key(
            &record.datasource_type,
            record.task_id,
            record.kind,
            record.started_at,
            &artifact.extension,
        );
        let location = self.storage.upload(&artifact.path, &key).await?;
        let outcome = BackupOutcome {
            file_size_bytes: i64::try_from(artifact.size_bytes).unwrap_or(i64::MAX),
            checksum,
            storage_location: location,
            log_range_start: artifact.log_range_start.as_ref().map(ToString::to_string),
            log_range_end: artifact.log_range_end.as_ref().map(ToString::to_string),
        };
        Ok((artifact, outcome))
    }
}

fn executor_output_ok(artifact: &Artifact) -> bool {
    artifact.size_bytes > 0
}
