use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use tracing::info;

use super::AuditStore;
use crate::errors::{BackupError, Result};
use crate::model::{BackupRecord, Checksum, RestoreRecord, RunStatus};

const SCHEMA: &[&str] = &[
    r#"CREATE TABLE IF NOT EXISTS backup_history (
        id BIGSERIAL PRIMARY KEY,
        task_id BIGINT NOT NULL,
        datasource_type TEXT NOT NULL,
        backup_type TEXT NOT NULL,
        status TEXT NOT NULL,
        started_at TIMESTAMPTZ NOT NULL,
        finished_at TIMESTAMPTZ,
        duration_seconds BIGINT,
        file_size_bytes BIGINT,
        checksum_md5 TEXT,
        checksum_sha256 TEXT,
        storage_location TEXT,
        base_full_id BIGINT,
        log_range_start TEXT,
        log_range_end TEXT,
        error_message TEXT,
        retired_at TIMESTAMPTZ
    )"#,
    "CREATE INDEX IF NOT EXISTS idx_backup_history_task ON backup_history (task_id, started_at)",
    r#"CREATE TABLE IF NOT EXISTS restore_record (
        id BIGSERIAL PRIMARY KEY,
        task_id BIGINT NOT NULL,
        history_id BIGINT,
        target_point TIMESTAMPTZ,
        status TEXT NOT NULL,
        operator TEXT NOT NULL,
        remark TEXT,
        started_at TIMESTAMPTZ NOT NULL,
        finished_at TIMESTAMPTZ,
        duration_seconds BIGINT,
        error_message TEXT
    )"#,
    "CREATE INDEX IF NOT EXISTS idx_restore_record_task ON restore_record (task_id, started_at)",
];

const BACKUP_COLUMNS: &str = "id, task_id, datasource_type, backup_type, status, started_at, \
    finished_at, duration_seconds, file_size_bytes, checksum_md5, checksum_sha256, \
    storage_location, base_full_id, log_range_start, log_range_end, error_message, retired_at";

const RESTORE_COLUMNS: &str = "id, task_id, history_id, target_point, status, operator, remark, \
    started_at, finished_at, duration_seconds, error_message";

/// Audit store backed by two PostgreSQL tables, `backup_history` and `restore_record`.
pub struct PgAuditStore {
    pool: PgPool,
}

impl PgAuditStore {
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub async fn ensure_schema(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        info!("Audit schema is ready");
        Ok(())
    }

    async fn fetch_backups(&self, sql: &str, task_id: i64) -> Result<Vec<BackupRecord>> {
        let rows = sqlx::query(sql).bind(task_id).fetch_all(&self.pool).await?;
        rows.iter().map(backup_from_row).collect()
    }
}

fn backup_from_row(row: &PgRow) -> Result<BackupRecord> {
    let kind: String = row.try_get("backup_type")?;
    let status: String = row.try_get("status")?;
    let md5: Option<String> = row.try_get("checksum_md5")?;
    let sha256: Option<String> = row.try_get("checksum_sha256")?;
    Ok(BackupRecord {
        id: row.try_get("id")?,
        task_id: row.try_get("task_id")?,
        datasource_type: row.try_get("datasource_type")?,
        kind: kind.parse()?,
        status: status.parse()?,
        started_at: row.try_get("started_at")?,
        finished_at: row.try_get("finished_at")?,
        duration_seconds: row.try_get("duration_seconds")?,
        file_size_bytes: row.try_get("file_size_bytes")?,
        checksum: match (md5, sha256) {
            (Some(md5), Some(sha256)) => Some(Checksum { md5, sha256 }),
            _ => None,
        },
        storage_location: row.try_get("storage_location")?,
        base_full_id: row.try_get("base_full_id")?,
        log_range_start: row.try_get("log_range_start")?,
        log_range_end: row.try_get("log_range_end")?,
        error_message: row.try_get("error_message")?,
        retired_at: row.try_get("retired_at")?,
    })
}

fn restore_from_row(row: &PgRow) -> Result<RestoreRecord> {
    let status: String = row.try_get("status")?;
    Ok(RestoreRecord {
        id: row.try_get("id")?,
        task_id: row.try_get("task_id")?,
        history_id: row.try_get("history_id")?,
        target_point: row.try_get("target_point")?,
        status: status.parse()?,
        operator: row.try_get("operator")?,
        remark: row.try_get("remark")?,
        started_at: row.try_get("started_at")?,
        finished_at: row.try_get("finished_at")?,
        duration_seconds: row.try_get("duration_seconds")?,
        error_message: row.try_get("error_message")?,
    })
}

#[async_trait]
impl AuditStore for PgAuditStore {
    async fn insert_backup(&self, record: &BackupRecord) -> Result<i64> {
        let id: i64 = sqlx::query_scalar(
            "INSERT INTO backup_history (task_id, datasource_type, backup_type, status, started_at, base_full_id) \
             VALUES ($1, $2, $3, $4, $5, $6) RETURNING id",
        )
        .bind(record.task_id)
        .bind(&record.datasource_type)
        .bind(record.kind.as_str())
        .bind(record.status.as_str())
        .bind(record.started_at)
        .bind(record.base_full_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    async fn update_backup(&self, record: &BackupRecord) -> Result<()> {
        let result = sqlx::query(
            "UPDATE backup_history SET status = $2, finished_at = $3, duration_seconds = $4, \
             file_size_bytes = $5, checksum_md5 = $6, checksum_sha256 = $7, storage_location = $8, \
             log_range_start = $9, log_range_end = $10, error_message = $11, retired_at = $12 \
             WHERE id = $1",
        )
        .bind(record.id)
        .bind(record.status.as_str())
        .bind(record.finished_at)
        .bind(record.duration_seconds)
        .bind(record.file_size_bytes)
        .bind(record.checksum.as_ref().map(|c| c.md5.clone()))
        .bind(record.checksum.as_ref().map(|c| c.sha256.clone()))
        .bind(&record.storage_location)
        .bind(&record.log_range_start)
        .bind(&record.log_range_end)
        .bind(&record.error_message)
        .bind(record.retired_at)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(BackupError::NotFound(format!("backup record {}", record.id)));
        }
        Ok(())
    }

    async fn get_backup(&self, id: i64) -> Result<Option<BackupRecord>> {
        let sql = format!("SELECT {} FROM backup_history WHERE id = $1", BACKUP_COLUMNS);
        let row = sqlx::query(&sql).bind(id).fetch_optional(&self.pool).await?;
        row.as_ref().map(backup_from_row).transpose()
    }

    async fn backups_by_task(&self, task_id: i64) -> Result<Vec<BackupRecord>> {
        let sql = format!(
            "SELECT {} FROM backup_history WHERE task_id = $1 ORDER BY started_at, id",
            BACKUP_COLUMNS
        );
        self.fetch_backups(&sql, task_id).await
    }

    async fn backups_in_range(
        &self,
        task_id: i64,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<BackupRecord>> {
        let sql = format!(
            "SELECT {} FROM backup_history WHERE task_id = $1 AND started_at BETWEEN $2 AND $3 \
             ORDER BY started_at, id",
            BACKUP_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(task_id)
            .bind(from)
            .bind(to)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(backup_from_row).collect()
    }

    async fn latest_full_backup(&self, task_id: i64) -> Result<Option<BackupRecord>> {
        let sql = format!(
            "SELECT {} FROM backup_history WHERE task_id = $1 AND backup_type = 'FULL' \
             AND status = 'SUCCESS' AND retired_at IS NULL ORDER BY started_at DESC, id DESC LIMIT 1",
            BACKUP_COLUMNS
        );
        let row = sqlx::query(&sql).bind(task_id).fetch_optional(&self.pool).await?;
        row.as_ref().map(backup_from_row).transpose()
    }

    async fn success_backups(&self, task_id: i64) -> Result<Vec<BackupRecord>> {
        let sql = format!(
            "SELECT {} FROM backup_history WHERE task_id = $1 AND status = 'SUCCESS' \
             AND retired_at IS NULL ORDER BY started_at, id",
            BACKUP_COLUMNS
        );
        self.fetch_backups(&sql, task_id).await
    }

    async fn mark_retired(&self, ids: &[i64], at: DateTime<Utc>) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let result = sqlx::query(
            "UPDATE backup_history SET retired_at = $2 WHERE id = ANY($1) AND retired_at IS NULL",
        )
        .bind(ids)
        .bind(at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn insert_restore(&self, record: &RestoreRecord) -> Result<i64> {
        let id: i64 = sqlx::query_scalar(
            "INSERT INTO restore_record (task_id, history_id, target_point, status, operator, remark, started_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7) RETURNING id",
        )
        .bind(record.task_id)
        .bind(record.history_id)
        .bind(record.target_point)
        .bind(record.status.as_str())
        .bind(&record.operator)
        .bind(&record.remark)
        .bind(record.started_at)
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    async fn update_restore(&self, record: &RestoreRecord) -> Result<()> {
        let result = sqlx::query(
            "UPDATE restore_record SET status = $2, finished_at = $3, duration_seconds = $4, \
             error_message = $5 WHERE id = $1",
        )
        .bind(record.id)
        .bind(record.status.as_str())
        .bind(record.finished_at)
        .bind(record.duration_seconds)
        .bind(&record.error_message)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(BackupError::NotFound(format!("restore record {}", record.id)));
        }
        Ok(())
    }

    async fn get_restore(&self, id: i64) -> Result<Option<RestoreRecord>> {
        let sql = format!("SELECT {} FROM restore_record WHERE id = $1", RESTORE_COLUMNS);
        let row = sqlx::query(&sql).bind(id).fetch_optional(&self.pool).await?;
        row.as_ref().map(restore_from_row).transpose()
    }

    async fn latest_pitr(&self, task_id: i64) -> Result<Option<RestoreRecord>> {
        let sql = format!(
            "SELECT {} FROM restore_record WHERE task_id = $1 AND target_point IS NOT NULL \
             ORDER BY started_at DESC, id DESC LIMIT 1",
            RESTORE_COLUMNS
        );
        let row = sqlx::query(&sql).bind(task_id).fetch_optional(&self.pool).await?;
        row.as_ref().map(restore_from_row).transpose()
    }

    async fn count_restores(
        &self,
        task_id: i64,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        status: Option<RunStatus>,
    ) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM restore_record WHERE task_id = $1 AND started_at BETWEEN $2 AND $3 \
             AND ($4::TEXT IS NULL OR status = $4)",
        )
        .bind(task_id)
        .bind(from)
        .bind(to)
        .bind(status.map(|s| s.as_str()))
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }
}
