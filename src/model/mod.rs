//! Audit records and the value types shared by the pipeline, chain manager and
//! restore orchestrator.

pub mod connection;
pub mod position;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::errors::{BackupError, Result};
pub use connection::ConnectionInfo;
pub use position::LogPosition;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BackupKind {
    Full,
    Incremental,
}

impl BackupKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackupKind::Full => "FULL",
            BackupKind::Incremental => "INCREMENTAL",
        }
    }

    /// Lower-case form used in storage keys and file names.
    pub fn slug(&self) -> &'static str {
        match self {
            BackupKind::Full => "full",
            BackupKind::Incremental => "incremental",
        }
    }
}

impl fmt::Display for BackupKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackupKind {
    type Err = BackupError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "FULL" => Ok(BackupKind::Full),
            "INCREMENTAL" => Ok(BackupKind::Incremental),
            other => Err(BackupError::Parse(format!("unknown backup kind: {}", other))),
        }
    }
}

/// `RUNNING -> {SUCCESS, FAILED}`; both terminal states are final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Running,
    Success,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "RUNNING",
            RunStatus::Success => "SUCCESS",
            RunStatus::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Running)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = BackupError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "RUNNING" => Ok(RunStatus::Running),
            "SUCCESS" => Ok(RunStatus::Success),
            "FAILED" => Ok(RunStatus::Failed),
            other => Err(BackupError::Parse(format!("unknown status: {}", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checksum {
    pub md5: String,
    pub sha256: String,
}

/// What a successful pipeline run writes onto its record.
#[derive(Debug, Clone)]
pub struct BackupOutcome {
    pub file_size_bytes: i64,
    pub checksum: Checksum,
    pub storage_location: String,
    pub log_range_start: Option<String>,
    pub log_range_end: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupRecord {
    pub id: i64,
    pub task_id: i64,
    pub datasource_type: String,
    pub kind: BackupKind,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_seconds: Option<i64>,
    pub file_size_bytes: Option<i64>,
    pub checksum: Option<Checksum>,
    pub storage_location: Option<String>,
    pub base_full_id: Option<i64>,
    pub log_range_start: Option<String>,
    pub log_range_end: Option<String>,
    pub error_message: Option<String>,
    pub retired_at: Option<DateTime<Utc>>,
}

impl BackupRecord {
    /// A fresh RUNNING record; the audit store assigns the id on insert.
    pub fn running(
        task_id: i64,
        datasource_type: &str,
        kind: BackupKind,
        base_full_id: Option<i64>,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: 0,
            task_id,
            datasource_type: datasource_type.to_string(),
            kind,
            status: RunStatus::Running,
            started_at,
            finished_at: None,
            duration_seconds: None,
            file_size_bytes: None,
            checksum: None,
            storage_location: None,
            base_full_id: match kind {
                BackupKind::Full => None,
                BackupKind::Incremental => base_full_id,
            },
            log_range_start: None,
            log_range_end: None,
            error_message: None,
            retired_at: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Success
    }

    pub fn is_full(&self) -> bool {
        self.kind == BackupKind::Full
    }

    pub fn is_incremental(&self) -> bool {
        self.kind == BackupKind::Incremental
    }

    pub fn mark_success(&mut self, outcome: BackupOutcome, now: DateTime<Utc>) -> Result<()> {
        self.finish(RunStatus::Success, now)?;
        self.file_size_bytes = Some(outcome.file_size_bytes);
        self.checksum = Some(outcome.checksum);
        self.storage_location = Some(outcome.storage_location);
        if self.kind == BackupKind::Incremental {
            self.log_range_start = outcome.log_range_start;
        }
        self.log_range_end = outcome.log_range_end;
        Ok(())
    }

    pub fn mark_failed(&mut self, message: impl Into<String>, now: DateTime<Utc>) -> Result<()> {
        self.finish(RunStatus::Failed, now)?;
        self.error_message = Some(message.into());
        Ok(())
    }

    fn finish(&mut self, status: RunStatus, now: DateTime<Utc>) -> Result<()> {
        if self.status.is_terminal() {
            return Err(BackupError::InvalidState(format!(
                "backup record {} is already {}",
                self.id, self.status
            )));
        }
        self.status = status;
        self.finished_at = Some(now);
        self.duration_seconds = Some(elapsed_seconds(self.started_at, now));
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestoreRecord {
    pub id: i64,
    pub task_id: i64,
    pub history_id: Option<i64>,
    pub target_point: Option<DateTime<Utc>>,
    pub status: RunStatus,
    pub operator: String,
    pub remark: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_seconds: Option<i64>,
    pub error_message: Option<String>,
}

impl RestoreRecord {
    pub fn running(
        task_id: i64,
        history_id: Option<i64>,
        target_point: Option<DateTime<Utc>>,
        operator: &str,
        remark: Option<String>,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: 0,
            task_id,
            history_id,
            target_point,
            status: RunStatus::Running,
            operator: operator.to_string(),
            remark,
            started_at,
            finished_at: None,
            duration_seconds: None,
            error_message: None,
        }
    }

    pub fn is_pitr(&self) -> bool {
        self.target_point.is_some()
    }

    pub fn finish(&mut self, success: bool, error: Option<String>, now: DateTime<Utc>) -> Result<()> {
        if self.status.is_terminal() {
            return Err(BackupError::InvalidState(format!(
                "restore record {} is already {}",
                self.id, self.status
            )));
        }
        self.status = if success { RunStatus::Success } else { RunStatus::Failed };
        self.finished_at = Some(now);
        self.duration_seconds = Some(elapsed_seconds(self.started_at, now));
        self.error_message = error;
        Ok(())
    }
}

fn elapsed_seconds(start: DateTime<Utc>, end: DateTime<Utc>) -> i64 {
    (end - start).num_seconds().max(0)
}
