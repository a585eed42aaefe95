use chrono::{DateTime, Duration, Utc};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};

use super::verification::verify_downloaded;
use crate::audit::AuditStore;
use crate::backup::{Artifact, BackupExecutor, ExecutorRegistry};
use crate::chain::{IncrementalChain, IncrementalChainManager, can_restore_to, get_backups_to_restore, validate_chain};
use crate::errors::{BackupError, Result};
use crate::metrics::OperationMetrics;
use crate::model::{BackupRecord, ConnectionInfo, RestoreRecord, RunStatus};
use crate::reliability::{ChecksumService, LockManager, task_lock_key, with_lock};
use crate::storage::StorageProvider;

#[derive(Debug, Clone)]
pub struct PointRestoreRequest {
    pub task_id: i64,
    pub datasource_type: String,
    pub target_time: DateTime<Utc>,
    /// Defaults to the configured datasource database.
    pub target_database: Option<String>,
    pub operator: String,
    pub remark: Option<String>,
}

#[derive(Debug, Clone)]
pub struct BackupRestoreRequest {
    pub task_id: i64,
    pub datasource_type: String,
    pub history_id: i64,
    pub target_database: Option<String>,
    pub operator: String,
    pub remark: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RestoreStatistics {
    pub total: i64,
    pub success: i64,
    pub failed: i64,
    /// Percentage of all restores that succeeded; 0 when there were none.
    pub success_rate: f64,
}

/// Assembles the backups needed to reach a target and applies them in order.
pub struct RestoreOrchestrator {
    registry: ExecutorRegistry,
    chains: IncrementalChainManager,
    audit: Arc<dyn AuditStore>,
    storage: Arc<dyn StorageProvider>,
    locks: Arc<dyn LockManager>,
    checksums: ChecksumService,
    metrics: Arc<OperationMetrics>,
    staging_dir: PathBuf,
    server: ConnectionInfo,
}

impl RestoreOrchestrator {
    pub fn new(
        registry: ExecutorRegistry,
        audit: Arc<dyn AuditStore>,
        storage: Arc<dyn StorageProvider>,
        locks: Arc<dyn LockManager>,
        staging_dir: PathBuf,
        server: ConnectionInfo,
    ) -> Self {
        Self {
            registry,
            chains: IncrementalChainManager::new(audit.clone(), storage.clone()),
            audit,
            storage,
            locks,
            checksums: ChecksumService::new(),
            metrics: Arc::new(OperationMetrics::new()),
            staging_dir,
            server,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<OperationMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Restores the task's data as of `target_time`. Planning problems are recorded
    /// and returned as errors; `Ok(false)` means a restore tool failed part way.
    pub async fn restore_to_point(&self, request: PointRestoreRequest) -> Result<bool> {
        let executor = self.registry.get(&request.datasource_type)?;
        let key = task_lock_key(&request.datasource_type, request.task_id);
        self.measured(with_lock(self.locks.as_ref(), &key, || async {
            let mut record = RestoreRecord::running(
                request.task_id,
                None,
                Some(request.target_time),
                &request.operator,
                request.remark.clone(),
                Utc::now(),
            );
            record.id = self.audit.insert_restore(&record).await?;
            info!(
                id = record.id,
                task_id = request.task_id,
                target_time = %request.target_time,
                operator = %request.operator,
                "Point-in-time restore started"
            );

            let backups = match self.plan(request.task_id, request.target_time).await {
                Ok(backups) => backups,
                Err(e) => return self.abort(record, e).await,
            };
            self.apply(record, executor.as_ref(), backups, request.target_database.as_deref())
                .await
        }))
        .await
    }

    /// Applies the one named backup, without consulting its chain.
    pub async fn restore_to_backup(&self, request: BackupRestoreRequest) -> Result<bool> {
        let executor = self.registry.get(&request.datasource_type)?;
        let key = task_lock_key(&request.datasource_type, request.task_id);
        self.measured(with_lock(self.locks.as_ref(), &key, || async {
            let mut record = RestoreRecord::running(
                request.task_id,
                Some(request.history_id),
                None,
                &request.operator,
                request.remark.clone(),
                Utc::now(),
            );
            record.id = self.audit.insert_restore(&record).await?;
            info!(id = record.id, history_id = request.history_id, operator = %request.operator, "Backup restore started");

            let backup = match self.restorable_backup(&request).await {
                Ok(backup) => backup,
                Err(e) => return self.abort(record, e).await,
            };
            self.apply(record, executor.as_ref(), vec![backup], request.target_database.as_deref())
                .await
        }))
        .await
    }

    async fn measured(&self, restore: impl Future<Output = Result<bool>>) -> Result<bool> {
        let started = Instant::now();
        self.metrics.restore_started();
        let result = restore.await;
        self.metrics.restore_finished(matches!(result, Ok(true)), started.elapsed());
        result
    }

    pub async fn latest_pitr(&self, task_id: i64) -> Result<Option<RestoreRecord>> {
        self.audit.latest_pitr(task_id).await
    }

    /// Restore outcomes over the last `days` days. The success rate is the share of
    /// all restores started in the window, running ones included.
    pub async fn restore_statistics(&self, task_id: i64, days: i64) -> Result<RestoreStatistics> {
        let to = Utc::now();
        let from = to - Duration::days(days);
        let total = self.audit.count_restores(task_id, from, to, None).await?;
        let success = self
            .audit
            .count_restores(task_id, from, to, Some(RunStatus::Success))
            .await?;
        let failed = self
            .audit
            .count_restores(task_id, from, to, Some(RunStatus::Failed))
            .await?;
        let success_rate = if total == 0 {
            0.0
        } else {
            success as f64 * 100.0 / total as f64
        };
        Ok(RestoreStatistics {
            total,
            success,
            failed,
            success_rate,
        })
    }

    /// The backups to apply for `t`, refusing chains that fail validation.
    async fn plan(&self, task_id: i64, t: DateTime<Utc>) -> Result<Vec<BackupRecord>> {
        let chain = self
            .chains
            .build_chain_to_time(task_id, t)
            .await?
            .ok_or_else(|| BackupError::NotFound(format!("no full backup for task {}", task_id)))?;
        if !can_restore_to(&chain, t) {
            return Err(BackupError::InvalidState(format!(
                "earliest full backup started at {}, after the requested point",
                chain.full_backup.started_at
            )));
        }
        let backups = get_backups_to_restore(&chain, t);
        let applicable = IncrementalChain::new(
            chain.full_backup.clone(),
            backups.iter().skip(1).cloned().collect(),
        );
        let validation = validate_chain(&applicable);
        for warning in &validation.warnings {
            warn!(chain = %chain.chain_id, warning = %warning, "Chain validation warning");
        }
        if !validation.valid {
            return Err(BackupError::ChainIntegrity(format!(
                "{} is not restorable: {}",
                chain.chain_id,
                validation.errors.join("; ")
            )));
        }
        Ok(backups)
    }

    async fn restorable_backup(&self, request: &BackupRestoreRequest) -> Result<BackupRecord> {
        let backup = self
            .audit
            .get_backup(request.history_id)
            .await?
            .ok_or_else(|| BackupError::NotFound(format!("backup {}", request.history_id)))?;
        if backup.task_id != request.task_id || backup.datasource_type != request.datasource_type {
            return Err(BackupError::InvalidState(format!(
                "backup {} belongs to {} task {}",
                backup.id, backup.datasource_type, backup.task_id
            )));
        }
        if backup.status != RunStatus::Success || backup.retired_at.is_some() {
            return Err(BackupError::InvalidState(format!(
                "backup {} is not a live successful backup",
                backup.id
            )));
        }
        Ok(backup)
    }

    async fn apply(
        &self,
        record: RestoreRecord,
        executor: &dyn BackupExecutor,
        backups: Vec<BackupRecord>,
        target_database: Option<&str>,
    ) -> Result<bool> {
        let target = match target_database {
            Some(name) => self.server.with_database(name),
            None => self.server.clone(),
        };
        if target.database != self.server.database
            && !executor.replays_into_other_database()
            && backups.iter().any(|b| b.is_incremental())
        {
            let e = BackupError::InvalidState(format!(
                "{} change scripts can only be replayed into {}",
                executor.datasource_type(),
                self.server.database
            ));
            return self.abort(record, e).await;
        }

        let downloads = match self.download_dir().await {
            Ok(dir) => dir,
            Err(e) => return self.abort(record, e).await,
        };
        let total = backups.len();
        for (applied, backup) in backups.iter().enumerate() {
            match self.apply_one(executor, backup, &target, downloads.path()).await {
                Ok(None) => info!(
                    id = record.id,
                    backup = backup.id,
                    kind = %backup.kind,
                    step = applied + 1,
                    total,
                    "Backup applied"
                ),
                Ok(Some(reason)) => {
                    let message = format!("applied {}/{}; backup {}: {}", applied, total, backup.id, reason);
                    return self.fail(record, message).await;
                }
                Err(e) => {
                    let message = format!("applied {}/{}; backup {}: {}", applied, total, backup.id, e);
                    return self.abort_with(record, message, e).await;
                }
            }
        }

        let mut done = record.clone();
        done.finish(true, None, Utc::now())?;
        if let Err(e) = self.audit.update_restore(&done).await {
            return self.abort(record, e).await;
        }
        let record = done;
        info!(
            id = record.id,
            database = %target.database,
            backups = total,
            duration_secs = record.duration_seconds.unwrap_or(0),
            "Restore succeeded"
        );
        Ok(true)
    }

    async fn download_dir(&self) -> Result<tempfile::TempDir> {
        tokio::fs::create_dir_all(&self.staging_dir).await?;
        Ok(tempfile::Builder::new()
            .prefix("restore-")
            .tempdir_in(&self.staging_dir)?)
    }

    async fn apply_one(
        &self,
        executor: &dyn BackupExecutor,
        backup: &BackupRecord,
        target: &ConnectionInfo,
        downloads: &Path,
    ) -> Result<Option<String>> {
        let location = backup
            .storage_location
            .as_deref()
            .ok_or_else(|| BackupError::InvalidState(format!("backup {} has no storage location", backup.id)))?;
        let name = location.rsplit('/').next().unwrap_or("artifact");
        let local = self
            .storage
            .download(location, &downloads.join(format!("{}_{}", backup.id, name)))
            .await?;
        let artifact = Artifact::from_file(local, backup.kind).await?;
        if let Some(reason) = verify_downloaded(&self.checksums, executor, backup, &artifact).await? {
            return Err(BackupError::ChainIntegrity(reason));
        }
        if executor.restore(&artifact, target).await? {
            let _ = tokio::fs::remove_file(&artifact.path).await;
            Ok(None)
        } else {
            Ok(Some(format!("{} restore tool failed", executor.datasource_type())))
        }
    }

    async fn fail(&self, mut record: RestoreRecord, reason: String) -> Result<bool> {
        error!(id = record.id, reason = %reason, "Restore failed");
        record.finish(false, Some(reason), Utc::now())?;
        self.audit.update_restore(&record).await?;
        Ok(false)
    }

    async fn abort(&self, record: RestoreRecord, e: BackupError) -> Result<bool> {
        let message = e.to_string();
        self.abort_with(record, message, e).await
    }

    async fn abort_with(&self, mut record: RestoreRecord, message: String, e: BackupError) -> Result<bool> {
        error!(id = record.id, error = %message, "Restore aborted");
        record.finish(false, Some(message), Utc::now())?;
        if let Err(update_err) = self.audit.update_restore(&record).await {
            warn!(id = record.id, error = %update_err, "Could not record restore failure");
        }
        Err(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemoryAuditStore;
    use crate::model::{BackupKind, Checksum, LogPosition};
    use crate::reliability::LocalLockManager;
    use crate::storage::LocalStorageProvider;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Records what it was asked to restore; fails on a chosen file content.
    #[derive(Default)]
    struct RecordingExecutor {
        applied: Mutex<Vec<(String, String)>>,
        fail_on: Option<String>,
        cross_database: bool,
    }

    #[async_trait]
    impl BackupExecutor for RecordingExecutor {
        fn datasource_type(&self) -> &'static str {
            "mysql"
        }

        async fn execute_full(&self, _request: &crate::backup::BackupRequest) -> Result<Artifact> {
            Err(BackupError::InvalidState("not used".into()))
        }

        async fn execute_incremental(&self, _request: &crate::backup::BackupRequest) -> Result<Artifact> {
            Err(BackupError::InvalidState("not used".into()))
        }

        async fn restore(&self, artifact: &Artifact, target: &ConnectionInfo) -> Result<bool> {
            let body = tokio::fs::read_to_string(&artifact.path).await?;
            if self.fail_on.as_deref() == Some(body.as_str()) {
                return Ok(false);
            }
            self.applied.lock().unwrap().push((body, target.database.clone()));
            Ok(true)
        }

        async fn current_position(&self, _conn: &ConnectionInfo) -> Result<LogPosition> {
            Ok(LogPosition::Start)
        }

        fn replays_into_other_database(&self) -> bool {
            self.cross_database
        }
    }

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, hour, 0, 0).unwrap()
    }

    struct Fixture {
        dir: TempDir,
        audit: Arc<MemoryAuditStore>,
        storage: Arc<LocalStorageProvider>,
        executor: Arc<RecordingExecutor>,
        orchestrator: RestoreOrchestrator,
    }

    fn fixture(executor: RecordingExecutor) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let audit = Arc::new(MemoryAuditStore::new());
        let storage = Arc::new(LocalStorageProvider::new(dir.path().join("store"), "backup".into()));
        let executor = Arc::new(executor);
        let mut registry = ExecutorRegistry::new();
        registry.register(executor.clone());
        let orchestrator = RestoreOrchestrator::new(
            registry,
            audit.clone(),
            storage.clone(),
            Arc::new(LocalLockManager::new(std::time::Duration::from_millis(100))),
            dir.path().join("staging"),
            ConnectionInfo::from_url("mysql://root:pw@localhost/shop").unwrap(),
        );
        Fixture {
            dir,
            audit,
            storage,
            executor,
            orchestrator,
        }
    }

    impl Fixture {
        /// Uploads `body` and seeds a SUCCESS record pointing at it.
        async fn seed(&self, id: i64, kind: BackupKind, hour: u32, base: Option<i64>, range: (u64, u64), body: &str) -> BackupRecord {
            let source = self.dir.path().join(format!("src_{}.sql", id));
            tokio::fs::write(&source, body).await.unwrap();
            let checksum = ChecksumService::new().compute(&source).await.unwrap();
            let location = self
                .storage
                .upload(&source, &format!("mysql/42/{}/{}_{}.sql", kind.slug(), kind.slug(), id))
                .await
                .unwrap();
            let mut record = BackupRecord::running(42, "mysql", kind, base, at(hour));
            record.id = id;
            record.status = RunStatus::Success;
            record.file_size_bytes = Some(body.len() as i64);
            record.checksum = Some(Checksum {
                md5: checksum.md5,
                sha256: checksum.sha256,
            });
            record.storage_location = Some(location);
            if kind == BackupKind::Incremental {
                record.log_range_start = Some(format!("mysql-bin.000001:{}", range.0));
            }
            record.log_range_end = Some(format!("mysql-bin.000001:{}", range.1));
            self.audit.seed_backup(record.clone());
            record
        }

        async fn seed_chain(&self) {
            self.seed(1, BackupKind::Full, 0, None, (0, 100), "full").await;
            self.seed(2, BackupKind::Incremental, 1, Some(1), (100, 200), "inc-1").await;
            self.seed(3, BackupKind::Incremental, 2, Some(1), (200, 300), "inc-2").await;
        }

        fn applied(&self) -> Vec<String> {
            self.executor.applied.lock().unwrap().iter().map(|(b, _)| b.clone()).collect()
        }

        fn point(&self, hour: u32, minute: u32) -> PointRestoreRequest {
            PointRestoreRequest {
                task_id: 42,
                datasource_type: "mysql".into(),
                target_time: at(hour) + Duration::minutes(minute as i64),
                target_database: None,
                operator: "ops".into(),
                remark: Some("drill".into()),
            }
        }
    }

    #[tokio::test]
    async fn test_point_restore_applies_full_then_incrementals_up_to_target() {
        let f = fixture(RecordingExecutor::default());
        f.seed_chain().await;
        assert!(f.orchestrator.restore_to_point(f.point(1, 30)).await.unwrap());
        assert_eq!(f.applied(), vec!["full", "inc-1"]);

        let record = f.orchestrator.latest_pitr(42).await.unwrap().unwrap();
        assert_eq!(record.status, RunStatus::Success);
        assert_eq!(record.target_point, Some(at(1) + Duration::minutes(30)));
        assert_eq!(record.remark.as_deref(), Some("drill"));
        // downloads are cleaned up
        let staging = f.dir.path().join("staging");
        assert_eq!(std::fs::read_dir(staging).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_point_before_first_full_is_refused() {
        let f = fixture(RecordingExecutor::default());
        f.seed(1, BackupKind::Full, 5, None, (0, 100), "full").await;
        let err = f.orchestrator.restore_to_point(f.point(4, 0)).await.unwrap_err();
        assert!(matches!(err, BackupError::InvalidState(_)));
        assert!(f.applied().is_empty());
        let record = f.orchestrator.latest_pitr(42).await.unwrap().unwrap();
        assert_eq!(record.status, RunStatus::Failed);
        assert!(record.error_message.unwrap().contains("after the requested point"));
    }

    #[tokio::test]
    async fn test_point_restore_without_chain_is_not_found() {
        let f = fixture(RecordingExecutor::default());
        let mut request = f.point(3, 0);
        request.task_id = 999;
        let err = f.orchestrator.restore_to_point(request).await.unwrap_err();
        assert!(matches!(err, BackupError::NotFound(_)));
        let record = f.orchestrator.latest_pitr(999).await.unwrap().unwrap();
        assert_eq!(record.status, RunStatus::Failed);
        assert!(record.finished_at.is_some());
        assert!(record.error_message.unwrap().contains("no full backup for task 999"));
    }

    #[tokio::test]
    async fn test_broken_chain_is_not_applied() {
        let f = fixture(RecordingExecutor::default());
        f.seed(1, BackupKind::Full, 0, None, (0, 100), "full").await;
        f.seed(2, BackupKind::Incremental, 1, Some(1), (150, 200), "inc-1").await;
        let err = f.orchestrator.restore_to_point(f.point(3, 0)).await.unwrap_err();
        assert!(matches!(err, BackupError::ChainIntegrity(_)));
        assert!(f.applied().is_empty());
        let record = f.orchestrator.latest_pitr(42).await.unwrap().unwrap();
        assert_eq!(record.status, RunStatus::Failed);
        assert!(record.error_message.unwrap().contains("gap between backup 1"));
    }

    #[tokio::test]
    async fn test_partial_failure_reports_applied_count() {
        let f = fixture(RecordingExecutor {
            fail_on: Some("inc-2".into()),
            ..Default::default()
        });
        f.seed_chain().await;
        assert!(!f.orchestrator.restore_to_point(f.point(3, 0)).await.unwrap());
        assert_eq!(f.applied(), vec!["full", "inc-1"]);
        let record = f.orchestrator.latest_pitr(42).await.unwrap().unwrap();
        assert_eq!(record.status, RunStatus::Failed);
        let message = record.error_message.unwrap();
        assert!(message.starts_with("applied 2/3; backup 3"), "{message}");
    }

    #[tokio::test]
    async fn test_checksum_mismatch_stops_the_sequence() {
        let f = fixture(RecordingExecutor::default());
        f.seed_chain().await;
        let mut tampered = f.audit.get_backup(2).await.unwrap().unwrap();
        tampered.checksum.as_mut().unwrap().sha256 = "0".repeat(64);
        f.audit.seed_backup(tampered);
        let err = f.orchestrator.restore_to_point(f.point(3, 0)).await.unwrap_err();
        assert!(matches!(err, BackupError::ChainIntegrity(_)));
        assert_eq!(f.applied(), vec!["full"]);
        let record = f.orchestrator.latest_pitr(42).await.unwrap().unwrap();
        let message = record.error_message.unwrap();
        assert!(message.starts_with("applied 1/3; backup 2"), "{message}");
        assert!(message.contains("checksum mismatch for backup 2"), "{message}");
    }

    fn single(history_id: i64, target_database: Option<&str>) -> BackupRestoreRequest {
        BackupRestoreRequest {
            task_id: 42,
            datasource_type: "mysql".into(),
            history_id,
            target_database: target_database.map(str::to_string),
            operator: "ops".into(),
            remark: None,
        }
    }

    #[tokio::test]
    async fn test_restore_to_backup_applies_only_that_backup() {
        let f = fixture(RecordingExecutor::default());
        f.seed_chain().await;
        assert!(f.orchestrator.restore_to_backup(single(3, None)).await.unwrap());
        assert_eq!(f.applied(), vec!["inc-2"]);
        let restore = f.audit.get_restore(1).await.unwrap().unwrap();
        assert_eq!(restore.history_id, Some(3));
        assert_eq!(restore.status, RunStatus::Success);
        assert!(!restore.is_pitr());
    }

    #[tokio::test]
    async fn test_restore_to_full_into_other_database() {
        let f = fixture(RecordingExecutor::default());
        f.seed_chain().await;
        assert!(f.orchestrator.restore_to_backup(single(1, Some("shop_copy"))).await.unwrap());
        assert_eq!(
            *f.executor.applied.lock().unwrap(),
            vec![("full".to_string(), "shop_copy".to_string())]
        );
    }

    #[tokio::test]
    async fn test_incrementals_refused_for_other_database_when_unsupported() {
        let f = fixture(RecordingExecutor::default());
        f.seed_chain().await;
        let mut request = f.point(3, 0);
        request.target_database = Some("shop_copy".into());
        let err = f.orchestrator.restore_to_point(request).await.unwrap_err();
        assert!(matches!(err, BackupError::InvalidState(_)));
        assert!(f.applied().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_backup_is_not_found_and_recorded() {
        let f = fixture(RecordingExecutor::default());
        assert!(matches!(
            f.orchestrator.restore_to_backup(single(404, None)).await,
            Err(BackupError::NotFound(_))
        ));
        let restore = f.audit.get_restore(1).await.unwrap().unwrap();
        assert_eq!(restore.history_id, Some(404));
        assert_eq!(restore.status, RunStatus::Failed);
        assert!(restore.error_message.unwrap().contains("backup 404"));
    }

    #[tokio::test]
    async fn test_failed_backup_is_not_restorable() {
        let f = fixture(RecordingExecutor::default());
        let mut failed = f.seed(1, BackupKind::Full, 0, None, (0, 100), "full").await;
        failed.status = RunStatus::Failed;
        f.audit.seed_backup(failed);
        let err = f.orchestrator.restore_to_backup(single(1, None)).await.unwrap_err();
        assert!(matches!(err, BackupError::InvalidState(_)));
        assert!(f.applied().is_empty());
    }

    #[tokio::test]
    async fn test_restore_statistics() {
        let f = fixture(RecordingExecutor {
            fail_on: Some("inc-1".into()),
            ..Default::default()
        });
        f.seed_chain().await;
        assert!(f.orchestrator.restore_to_point(f.point(0, 30)).await.unwrap());
        assert!(!f.orchestrator.restore_to_point(f.point(1, 30)).await.unwrap());
        let stats = f.orchestrator.restore_statistics(42, 1).await.unwrap();
        assert_eq!((stats.total, stats.success, stats.failed), (2, 1, 1));
        assert!((stats.success_rate - 50.0).abs() < f64::EPSILON);

        // a restore still running counts towards the total
        let running = RestoreRecord::running(42, Some(1), None, "ops", None, Utc::now());
        f.audit.insert_restore(&running).await.unwrap();
        let stats = f.orchestrator.restore_statistics(42, 1).await.unwrap();
        assert_eq!((stats.total, stats.success, stats.failed), (3, 1, 1));
        assert!((stats.success_rate - 100.0 / 3.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_metrics_track_restore_outcomes() {
        let metrics = Arc::new(OperationMetrics::new());
        let mut f = fixture(RecordingExecutor {
            fail_on: Some("inc-1".into()),
            ..Default::default()
        });
        f.orchestrator = f.orchestrator.with_metrics(metrics.clone());
        f.seed_chain().await;
        assert!(f.orchestrator.restore_to_point(f.point(0, 30)).await.unwrap());
        assert!(!f.orchestrator.restore_to_point(f.point(1, 30)).await.unwrap());
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.restore_total, 2);
        assert_eq!((snapshot.restore_success, snapshot.restore_failure), (1, 1));
        assert_eq!(snapshot.active_restores, 0);
    }
}
