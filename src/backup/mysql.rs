use async_trait::async_trait;
use chrono::Utc;
use regex::Regex;
use std::path::Path;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

use super::executor::{
    Artifact, BackupExecutor, BackupRequest, PlainScript, change_script_header, remove_partial,
    require_output, restore_outcome,
};
use crate::changelog::{BinlogReader, ChangeLogReader};
use crate::config::ToolConfig;
use crate::errors::{BackupError, Result};
use crate::model::{BackupKind, ConnectionInfo, LogPosition};
use crate::utils::process::{ToolCommand, ToolLocator};
use crate::utils::quote_ident;

const DUMP_TOOL: &str = "mysqldump";
const CLIENT_TOOL: &str = "mysql";
/// `--master-data=2` writes the coordinates near the top of the dump.
const POSITION_SCAN_LINES: usize = 200;

pub struct MySqlBackupExecutor {
    reader: BinlogReader,
    tools: ToolLocator,
    timeouts: ToolConfig,
}

impl MySqlBackupExecutor {
    pub fn new(reader: BinlogReader, timeouts: ToolConfig) -> Self {
        Self {
            reader,
            tools: ToolLocator::from_path(),
            timeouts,
        }
    }

    pub fn with_tools(mut self, tools: ToolLocator) -> Self {
        self.tools = tools;
        self
    }

    fn command(&self, tool: &str, timeout_secs: u64, conn: &ConnectionInfo) -> Result<ToolCommand> {
        let mut command = self
            .tools
            .command(tool, Duration::from_secs(timeout_secs))?
            .arg(format!("--host={}", conn.host))
            .arg(format!("--port={}", conn.port))
            .arg(format!("--user={}", conn.username));
        if let Some(password) = &conn.password {
            command = command.env("MYSQL_PWD", password.clone());
        }
        Ok(command)
    }

    /// Appends the `mysqlbinlog` output for `[start, end)` of `conn.database` to `out`.
    async fn append_binlog_range(
        &self,
        conn: &ConnectionInfo,
        files: &[String],
        offset: u64,
        end: &LogPosition,
        out: &Path,
    ) -> Result<()> {
        let LogPosition::Binlog { offset: stop, .. } = end else {
            return Err(BackupError::InvalidState(format!("not a binlog position: {}", end)));
        };
        let mut args = vec![
            format!("--database={}", conn.database),
            format!("--start-position={}", offset),
            format!("--stop-position={}", stop),
        ];
        args.extend(self.reader.source_args(conn, files));
        let mut command = self
            .reader
            .tool(Duration::from_secs(self.timeouts.change_read_timeout_secs))?
            .args(args)
            .append_stdout_to(out);
        if let Some(password) = &conn.password {
            command = command.env("MYSQL_PWD", password.clone());
        }
        info!(command = %command.display_masked(), "Extracting binlog range");
        command.run().await?;
        Ok(())
    }
}

/// Reads the binlog coordinates `mysqldump --master-data=2` records in the dump head.
pub async fn dump_position(path: &Path) -> Result<Option<LogPosition>> {
    let pattern = Regex::new(
        r"CHANGE (?:MASTER|REPLICATION SOURCE) TO (?:MASTER|SOURCE)_LOG_FILE='([^']+)',\s*(?:MASTER|SOURCE)_LOG_POS=(\d+)",
    )
    .map_err(|e| BackupError::Parse(format!("invalid dump position pattern: {}", e)))?;
    let file = tokio::fs::File::open(path).await?;
    let mut lines = BufReader::new(file).lines();
    for _ in 0..POSITION_SCAN_LINES {
        let Some(line) = lines.next_line().await? else {
            break;
        };
        if let Some(caps) = pattern.captures(&line) {
            let offset = caps[2]
                .parse::<u64>()
                .map_err(|e| BackupError::Parse(format!("invalid binlog offset in dump: {}", e)))?;
            return Ok(Some(LogPosition::binlog(&caps[1], offset)));
        }
    }
    Ok(None)
}

#[async_trait]
impl BackupExecutor for MySqlBackupExecutor {
    fn datasource_type(&self) -> &'static str {
        "mysql"
    }

    async fn execute_full(&self, request: &BackupRequest) -> Result<Artifact> {
        let conn = &request.connection;
        tokio::fs::create_dir_all(&request.staging_dir).await?;
        let out = request.staging_file("sql");

        let command = self
            .command(DUMP_TOOL, self.timeouts.dump_timeout_secs, conn)?
            .args([
                "--single-transaction",
                "--routines",
                "--triggers",
                "--events",
                "--master-data=2",
            ])
            .arg(conn.database.clone())
            .stdout_to(&out);
        info!(task_id = request.task_id, command = %command.display_masked(), "Starting full dump");
        if let Err(e) = command.run().await {
            remove_partial(&out).await;
            return Err(e);
        }
        require_output(DUMP_TOOL, &out).await?;

        let end = match dump_position(&out).await {
            Ok(Some(position)) => Some(position),
            Ok(None) => {
                warn!(path = %out.display(), "Dump carries no binlog coordinates");
                None
            }
            Err(e) => {
                remove_partial(&out).await;
                return Err(e);
            }
        };
        let artifact = Artifact::from_file(out, BackupKind::Full).await?;
        info!(task_id = request.task_id, size = artifact.size_bytes, "Full dump finished");
        Ok(artifact.with_range(None, end))
    }

    async fn execute_incremental(&self, request: &BackupRequest) -> Result<Artifact> {
        let conn = &request.connection;
        let start = match &request.start_position {
            Some(position) => position.clone(),
            None => self.reader.current_position(conn).await?,
        };
        let end = self.reader.current_position(conn).await?;
        if end < start {
            return Err(BackupError::ChainIntegrity(format!(
                "start position {} is ahead of the server position {}",
                start, end
            )));
        }

        tokio::fs::create_dir_all(&request.staging_dir).await?;
        let out = request.staging_file("sql");
        let header = format!(
            "{}-- database: {}\n",
            change_script_header(&start, &end, Utc::now()),
            conn.database
        );
        tokio::fs::write(&out, header).await?;

        if !start.reached(&end) {
            let result = match self.reader.files_between(conn, &start, &end).await {
                Ok((files, offset)) => self.append_binlog_range(conn, &files, offset, &end, &out).await,
                Err(e) => Err(e),
            };
            if let Err(e) = result {
                remove_partial(&out).await;
                return Err(e);
            }
        }

        let artifact = Artifact::from_file(out, BackupKind::Incremental).await?;
        info!(task_id = request.task_id, %start, %end, size = artifact.size_bytes, "Incremental capture finished");
        Ok(artifact.with_range(Some(start), Some(end)))
    }

    async fn restore(&self, artifact: &Artifact, target: &ConnectionInfo) -> Result<bool> {
        let script = PlainScript::open(artifact).await?;
        let create = format!(
            "CREATE DATABASE IF NOT EXISTS {}",
            quote_ident("mysql", &target.database)
        );
        let prepared = self
            .command(CLIENT_TOOL, self.timeouts.restore_timeout_secs, target)?
            .arg(format!("--execute={}", create))
            .run()
            .await;
        if !restore_outcome(CLIENT_TOOL, prepared)? {
            return Ok(false);
        }

        let command = self
            .command(CLIENT_TOOL, self.timeouts.restore_timeout_secs, target)?
            .arg(target.database.clone())
            .stdin_from(script.path());
        info!(
            kind = %artifact.kind,
            path = %artifact.path.display(),
            database = %target.database,
            "Applying backup with mysql"
        );
        restore_outcome(CLIENT_TOOL, command.run().await)
    }

    async fn current_position(&self, conn: &ConnectionInfo) -> Result<LogPosition> {
        self.reader.current_position(conn).await
    }

    /// Binlog scripts carry `use` statements naming the source database.
    fn replays_into_other_database(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conn() -> ConnectionInfo {
        ConnectionInfo::from_url("mysql://backup:pw@127.0.0.1:3306/shop").unwrap()
    }

    #[tokio::test]
    async fn test_dump_position_reads_both_syntaxes() {
        let dir = tempfile::tempdir().unwrap();
        let legacy = dir.path().join("legacy.sql");
        tokio::fs::write(
            &legacy,
            "-- MySQL dump\n--\n-- CHANGE MASTER TO MASTER_LOG_FILE='mysql-bin.000003', MASTER_LOG_POS=154;\n",
        )
        .await
        .unwrap();
        assert_eq!(
            dump_position(&legacy).await.unwrap(),
            Some(LogPosition::binlog("mysql-bin.000003", 154))
        );

        let modern = dir.path().join("modern.sql");
        tokio::fs::write(
            &modern,
            "-- CHANGE REPLICATION SOURCE TO SOURCE_LOG_FILE='binlog.000010', SOURCE_LOG_POS=2201;\n",
        )
        .await
        .unwrap();
        assert_eq!(
            dump_position(&modern).await.unwrap(),
            Some(LogPosition::binlog("binlog.000010", 2201))
        );

        let none = dir.path().join("none.sql");
        tokio::fs::write(&none, "CREATE TABLE t (id INT);\n").await.unwrap();
        assert_eq!(dump_position(&none).await.unwrap(), None);
    }

    #[cfg(unix)]
    mod unix {
        use super::*;
        use std::os::unix::fs::PermissionsExt;
        use std::path::PathBuf;
        use tempfile::TempDir;

        fn script(dir: &Path, name: &str, body: &str) -> PathBuf {
            let path = dir.join(name);
            std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
            path
        }

        fn executor(tools: &TempDir) -> MySqlBackupExecutor {
            let reader = BinlogReader::new(None).with_program(tools.path().join("mysqlbinlog"));
            let timeouts = ToolConfig {
                dump_timeout_secs: 5,
                restore_timeout_secs: 5,
                change_read_timeout_secs: 5,
            };
            MySqlBackupExecutor::new(reader, timeouts).with_tools(ToolLocator::in_dir(tools.path()))
        }

        fn staged_files(dir: &Path) -> usize {
            std::fs::read_dir(dir).map(|d| d.count()).unwrap_or(0)
        }

        #[tokio::test]
        async fn test_full_dump_records_binlog_position() {
            let tools = tempfile::tempdir().unwrap();
            let staging = tempfile::tempdir().unwrap();
            script(
                tools.path(),
                "mysqldump",
                "[ \"$MYSQL_PWD\" = pw ] || exit 9\n\
                 echo \"-- CHANGE MASTER TO MASTER_LOG_FILE='mysql-bin.000007', MASTER_LOG_POS=886;\"\n\
                 echo \"CREATE TABLE orders (id INT);\"",
            );
            let request = BackupRequest::full(42, conn(), staging.path().to_path_buf());
            let artifact = executor(&tools).execute(&request).await.unwrap();

            assert_eq!(artifact.kind, BackupKind::Full);
            assert_eq!(artifact.extension, "sql");
            assert!(artifact.size_bytes > 0);
            assert_eq!(artifact.log_range_start, None);
            assert_eq!(artifact.log_range_end, Some(LogPosition::binlog("mysql-bin.000007", 886)));
            assert!(executor(&tools).verify(&artifact).await.unwrap());
        }

        #[tokio::test]
        async fn test_failed_dump_removes_partial_file() {
            let tools = tempfile::tempdir().unwrap();
            let staging = tempfile::tempdir().unwrap();
            script(tools.path(), "mysqldump", "echo partial; echo 'Got error: 1045' >&2; exit 2");
            let request = BackupRequest::full(42, conn(), staging.path().to_path_buf());
            let err = executor(&tools).execute_full(&request).await.unwrap_err();
            match err {
                BackupError::ToolInvocation { code, stderr, .. } => {
                    assert_eq!(code, Some(2));
                    assert!(stderr.contains("1045"));
                }
                other => panic!("unexpected error: {other}"),
            }
            assert_eq!(staged_files(staging.path()), 0);
        }

        #[tokio::test]
        async fn test_empty_dump_is_a_failure() {
            let tools = tempfile::tempdir().unwrap();
            let staging = tempfile::tempdir().unwrap();
            script(tools.path(), "mysqldump", "exit 0");
            let request = BackupRequest::full(42, conn(), staging.path().to_path_buf());
            let err = executor(&tools).execute_full(&request).await.unwrap_err();
            assert!(matches!(err, BackupError::ToolInvocation { .. }));
            assert_eq!(staged_files(staging.path()), 0);
        }

        #[tokio::test]
        async fn test_binlog_range_appends_after_header() {
            let tools = tempfile::tempdir().unwrap();
            let staging = tempfile::tempdir().unwrap();
            script(tools.path(), "mysqlbinlog", "echo \"$@\"");
            let out = staging.path().join("inc.sql");
            tokio::fs::write(&out, "-- header\n").await.unwrap();
            let files = vec!["mysql-bin.000003".to_string(), "mysql-bin.000004".to_string()];
            executor(&tools)
                .append_binlog_range(&conn(), &files, 154, &LogPosition::binlog("mysql-bin.000004", 300), &out)
                .await
                .unwrap();
            let written = tokio::fs::read_to_string(&out).await.unwrap();
            assert!(written.starts_with("-- header\n"));
            assert!(written.contains("--database=shop --start-position=154 --stop-position=300"));
            assert!(written.contains("--read-from-remote-server"));
            assert!(written.contains("mysql-bin.000003 mysql-bin.000004"));
            assert!(!written.contains("pw"));
        }

        #[tokio::test]
        async fn test_restore_feeds_script_to_client() {
            let tools = tempfile::tempdir().unwrap();
            let staging = tempfile::tempdir().unwrap();
            let received = staging.path().join("received.sql");
            script(
                tools.path(),
                "mysql",
                &format!(
                    "case \"$*\" in *--execute=*) exit 0;; esac\ncat >> {}",
                    received.display()
                ),
            );
            let dump = staging.path().join("full.sql");
            tokio::fs::write(&dump, "INSERT INTO orders VALUES (1);\n").await.unwrap();
            let artifact = Artifact::from_file(dump, BackupKind::Full).await.unwrap();

            assert!(executor(&tools).restore(&artifact, &conn()).await.unwrap());
            assert_eq!(
                tokio::fs::read_to_string(&received).await.unwrap(),
                "INSERT INTO orders VALUES (1);\n"
            );
        }

        #[tokio::test]
        async fn test_restore_reports_client_failure_as_false() {
            let tools = tempfile::tempdir().unwrap();
            let staging = tempfile::tempdir().unwrap();
            script(
                tools.path(),
                "mysql",
                "case \"$*\" in *--execute=*) exit 0;; esac\necho 'ERROR 1064' >&2; exit 1",
            );
            let dump = staging.path().join("full.sql");
            tokio::fs::write(&dump, "garbage;\n").await.unwrap();
            let artifact = Artifact::from_file(dump, BackupKind::Full).await.unwrap();
            assert!(!executor(&tools).restore(&artifact, &conn()).await.unwrap());
        }
    }
}
