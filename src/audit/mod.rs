//! Persistence of backup and restore audit records.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::errors::Result;
use crate::model::{BackupRecord, RestoreRecord, RunStatus};

pub use memory::MemoryAuditStore;
pub use postgres::PgAuditStore;

#[async_trait]
pub trait AuditStore: Send + Sync {
    /// Persists a new record and returns its assigned id.
    async fn insert_backup(&self, record: &BackupRecord) -> Result<i64>;

    async fn update_backup(&self, record: &BackupRecord) -> Result<()>;

    async fn get_backup(&self, id: i64) -> Result<Option<BackupRecord>>;

    /// All records of a task, ordered by `started_at` then id.
    async fn backups_by_task(&self, task_id: i64) -> Result<Vec<BackupRecord>>;

    async fn backups_in_range(
        &self,
        task_id: i64,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<BackupRecord>>;

    /// Newest non-retired successful full backup of a task.
    async fn latest_full_backup(&self, task_id: i64) -> Result<Option<BackupRecord>>;

    /// Non-retired SUCCESS records of a task, ordered by `started_at` then id.
    async fn success_backups(&self, task_id: i64) -> Result<Vec<BackupRecord>>;

    /// Sets `retired_at` on the given records; returns how many were changed.
    async fn mark_retired(&self, ids: &[i64], at: DateTime<Utc>) -> Result<u64>;

    async fn insert_restore(&self, record: &RestoreRecord) -> Result<i64>;

    async fn update_restore(&self, record: &RestoreRecord) -> Result<()>;

    async fn get_restore(&self, id: i64) -> Result<Option<RestoreRecord>>;

    /// Most recent point-in-time restore attempt of a task.
    async fn latest_pitr(&self, task_id: i64) -> Result<Option<RestoreRecord>>;

    async fn count_restores(
        &self,
        task_id: i64,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        status: Option<RunStatus>,
    ) -> Result<i64>;
}
