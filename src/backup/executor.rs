use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use uuid::Uuid;

use super::compress::{gunzip_file, is_gzip};
use crate::errors::{BackupError, Result};
use crate::model::{BackupKind, ConnectionInfo, LogPosition};

/// A backup file produced by an executor, before checksum and upload.
#[derive(Debug, Clone)]
pub struct Artifact {
    pub path: PathBuf,
    pub kind: BackupKind,
    pub size_bytes: u64,
    /// File extension used in the storage key (`sql`, `sql.gz`).
    pub extension: String,
    pub log_range_start: Option<LogPosition>,
    pub log_range_end: Option<LogPosition>,
}

impl Artifact {
    pub async fn from_file(path: PathBuf, kind: BackupKind) -> Result<Self> {
        let size_bytes = tokio::fs::metadata(&path).await?.len();
        let extension = match path.file_name().and_then(|n| n.to_str()) {
            Some(name) if name.ends_with(".sql.gz") => "sql.gz".to_string(),
            Some(name) => name.rsplit_once('.').map(|(_, ext)| ext.to_string()).unwrap_or_default(),
            None => String::new(),
        };
        Ok(Self {
            path,
            kind,
            size_bytes,
            extension,
            log_range_start: None,
            log_range_end: None,
        })
    }

    pub fn with_range(mut self, start: Option<LogPosition>, end: Option<LogPosition>) -> Self {
        self.log_range_start = start;
        self.log_range_end = end;
        self
    }
}

#[derive(Debug, Clone)]
pub struct BackupRequest {
    pub task_id: i64,
    pub kind: BackupKind,
    pub connection: ConnectionInfo,
    pub staging_dir: PathBuf,
    /// Where an incremental starts; `None` means the server's current position.
    pub start_position: Option<LogPosition>,
    pub base_full_id: Option<i64>,
}

impl BackupRequest {
    pub fn full(task_id: i64, connection: ConnectionInfo, staging_dir: PathBuf) -> Self {
        Self {
            task_id,
            kind: BackupKind::Full,
            connection,
            staging_dir,
            start_position: None,
            base_full_id: None,
        }
    }

    pub fn incremental(task_id: i64, connection: ConnectionInfo, staging_dir: PathBuf) -> Self {
        Self {
            kind: BackupKind::Incremental,
            ..Self::full(task_id, connection, staging_dir)
        }
    }

    pub fn datasource_type(&self) -> &str {
        &self.connection.datasource_type
    }

    /// A unique file in the staging directory for this request's output.
    pub fn staging_file(&self, extension: &str) -> PathBuf {
        self.staging_dir.join(format!(
            "{}_{}_{}_{}_{}.{}",
            self.datasource_type(),
            self.task_id,
            self.kind.slug(),
            Utc::now().format("%Y%m%dT%H%M%S"),
            Uuid::new_v4().simple(),
            extension
        ))
    }
}

#[async_trait]
pub trait BackupExecutor: Send + Sync {
    fn datasource_type(&self) -> &'static str;

    async fn execute_full(&self, request: &BackupRequest) -> Result<Artifact>;

    async fn execute_incremental(&self, request: &BackupRequest) -> Result<Artifact>;

    async fn execute(&self, request: &BackupRequest) -> Result<Artifact> {
        match request.kind {
            BackupKind::Full => self.execute_full(request).await,
            BackupKind::Incremental => self.execute_incremental(request).await,
        }
    }

    /// Loads a dump or replays a change script into `target`. `Ok(false)` means the
    /// client tool failed cleanly (non-zero exit, timeout).
    async fn restore(&self, artifact: &Artifact, target: &ConnectionInfo) -> Result<bool>;

    async fn current_position(&self, conn: &ConnectionInfo) -> Result<LogPosition>;

    async fn verify(&self, artifact: &Artifact) -> Result<bool> {
        match tokio::fs::metadata(&artifact.path).await {
            Ok(meta) => Ok(meta.is_file() && meta.len() > 0),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Whether change scripts can be replayed into a database with a different name
    /// than the one they were captured from.
    fn replays_into_other_database(&self) -> bool {
        true
    }
}

/// Executors keyed by datasource type.
#[derive(Default, Clone)]
pub struct ExecutorRegistry {
    executors: HashMap<String, Arc<dyn BackupExecutor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, executor: Arc<dyn BackupExecutor>) {
        self.executors
            .insert(executor.datasource_type().to_string(), executor);
    }

    pub fn get(&self, datasource_type: &str) -> Result<Arc<dyn BackupExecutor>> {
        self.executors.get(datasource_type).cloned().ok_or_else(|| {
            BackupError::NotFound(format!("backup executor for datasource type {}", datasource_type))
        })
    }
}

const START_TAG: &str = "-- start-position: ";
const END_TAG: &str = "-- end-position: ";
const GENERATED_TAG: &str = "-- generated-at: ";

/// Header written at the top of every change script.
pub fn change_script_header(start: &LogPosition, end: &LogPosition, generated_at: DateTime<Utc>) -> String {
    format!(
        "{}{}\n{}{}\n{}{}\n",
        START_TAG,
        start,
        END_TAG,
        end,
        GENERATED_TAG,
        generated_at.to_rfc3339_opts(SecondsFormat::Secs, true)
    )
}

/// A plain-text copy of an artifact for a client tool to read. Decompressed copies are
/// removed when dropped.
pub struct PlainScript {
    path: PathBuf,
    temporary: bool,
}

impl PlainScript {
    pub async fn open(artifact: &Artifact) -> Result<Self> {
        if !is_gzip(&artifact.path) {
            return Ok(Self {
                path: artifact.path.clone(),
                temporary: false,
            });
        }
        let path = artifact.path.with_extension("");
        gunzip_file(&artifact.path, &path).await?;
        Ok(Self {
            path,
            temporary: true,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for PlainScript {
    fn drop(&mut self) {
        if self.temporary {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

/// Maps a client tool run onto the restore contract: tool failures and timeouts are a
/// clean `false`, anything else propagates.
pub fn restore_outcome<T>(tool: &str, result: Result<T>) -> Result<bool> {
    match result {
        Ok(_) => Ok(true),
        Err(e @ (BackupError::ToolInvocation { .. } | BackupError::Timeout { .. })) => {
            tracing::error!(tool, error = %e, "Restore tool failed");
            Ok(false)
        }
        Err(e) => Err(e),
    }
}

/// Fails when the tool produced nothing, removing the empty file.
pub async fn require_output(tool: &str, path: &Path) -> Result<()> {
    let size = tokio::fs::metadata(path).await.map(|m| m.len()).unwrap_or(0);
    if size == 0 {
        remove_partial(path).await;
        return Err(BackupError::tool_failure(tool, Some(0), "produced no output"));
    }
    Ok(())
}

/// Removes a partially written output file, ignoring a missing one.
pub async fn remove_partial(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!(path = %path.display(), error = %e, "Failed to remove partial artifact");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_header_names_range_and_time() {
        let start = LogPosition::binlog("mysql-bin.000003", 154);
        let end = LogPosition::binlog("mysql-bin.000003", 900);
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 2, 0, 0).unwrap();
        let header = change_script_header(&start, &end, at);
        let lines: Vec<&str> = header.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0].strip_prefix(START_TAG).unwrap().parse::<LogPosition>().unwrap(), start);
        assert_eq!(lines[1].strip_prefix(END_TAG).unwrap().parse::<LogPosition>().unwrap(), end);
        assert_eq!(lines[2], "-- generated-at: 2024-05-01T02:00:00Z");
    }

    #[tokio::test]
    async fn test_artifact_extension_and_size() {
        let dir = tempfile::tempdir().unwrap();
        let plain = dir.path().join("a.sql");
        let packed = dir.path().join("b.sql.gz");
        tokio::fs::write(&plain, "abc").await.unwrap();
        tokio::fs::write(&packed, "x").await.unwrap();
        let a = Artifact::from_file(plain, BackupKind::Full).await.unwrap();
        assert_eq!((a.extension.as_str(), a.size_bytes), ("sql", 3));
        let b = Artifact::from_file(packed, BackupKind::Full).await.unwrap();
        assert_eq!(b.extension, "sql.gz");
    }

    #[test]
    fn test_staging_file_is_unique() {
        let conn = ConnectionInfo::from_url("mysql://root@localhost/shop").unwrap();
        let request = BackupRequest::incremental(42, conn, PathBuf::from("/tmp/staging"));
        let a = request.staging_file("sql");
        let b = request.staging_file("sql");
        assert_ne!(a, b);
        assert!(a.starts_with("/tmp/staging"));
        let name = a.file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with("mysql_42_incremental_"));
        assert!(name.ends_with(".sql"));
    }

    #[tokio::test]
    async fn test_plain_script_decompresses_and_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("full.sql");
        tokio::fs::write(&source, "SELECT 1;\n").await.unwrap();
        let packed = crate::backup::compress::gzip_file(&source).await.unwrap();
        let artifact = Artifact::from_file(packed, BackupKind::Full).await.unwrap();

        let script = PlainScript::open(&artifact).await.unwrap();
        let plain = script.path().to_path_buf();
        assert_eq!(plain, dir.path().join("full.sql"));
        assert_eq!(tokio::fs::read_to_string(&plain).await.unwrap(), "SELECT 1;\n");
        drop(script);
        assert!(!plain.exists());
        assert!(artifact.path.exists());
    }

    #[test]
    fn test_restore_outcome_classifies_errors() {
        let failed: Result<()> = Err(BackupError::tool_failure("psql", Some(3), "syntax error"));
        assert!(!restore_outcome("psql", failed).unwrap());
        let timed_out: Result<()> = Err(BackupError::Timeout {
            operation: "mysql".into(),
            timeout: std::time::Duration::from_secs(1),
        });
        assert!(!restore_outcome("mysql", timed_out).unwrap());
        let io: Result<()> = Err(std::io::Error::other("disk gone").into());
        assert!(restore_outcome("mysql", io).is_err());
        assert!(restore_outcome("mysql", Ok(())).unwrap());
    }

    #[test]
    fn test_registry_lookup() {
        let registry = ExecutorRegistry::new();
        assert!(matches!(registry.get("oracle"), Err(BackupError::NotFound(_))));
    }
}
