use async_trait::async_trait;
use chrono::Utc;
use sqlx::{Connection, PgConnection};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::executor::{
    Artifact, BackupExecutor, BackupRequest, PlainScript, change_script_header, remove_partial,
    require_output, restore_outcome,
};
use crate::changelog::{ChangeEvent, ChangeLogReader, EventFilter, WalReader};
use crate::config::ToolConfig;
use crate::errors::{BackupError, Result};
use crate::model::{BackupKind, ConnectionInfo, LogPosition};
use crate::utils::process::{ToolCommand, ToolLocator};
use crate::utils::quote_ident;

const DUMP_TOOL: &str = "pg_dump";
const CLIENT_TOOL: &str = "psql";
const MAINTENANCE_DATABASE: &str = "postgres";
const SNAPSHOT_WAIT: Duration = Duration::from_secs(60);

pub struct PostgresBackupExecutor {
    reader: WalReader,
    tools: ToolLocator,
    timeouts: ToolConfig,
}

impl PostgresBackupExecutor {
    pub fn new(reader: WalReader, timeouts: ToolConfig) -> Self {
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
            .arg(format!("--username={}", conn.username))
            .arg("--no-password");
        if let Some(password) = &conn.password {
            command = command.env("PGPASSWORD", password.clone());
        }
        Ok(command)
    }

    /// `psql` on a logical replication connection to the source database.
    fn replication_session(&self, conn: &ConnectionInfo) -> Result<ToolCommand> {
        Ok(self
            .command(CLIENT_TOOL, self.timeouts.dump_timeout_secs, conn)?
            .args(["-X", "-A", "-t", "-q", "-v", "ON_ERROR_STOP=1"])
            .arg(format!("--dbname=dbname={} replication=database", conn.database)))
    }

    async fn dump(&self, request: &BackupRequest, snapshot: Option<&str>) -> Result<Artifact> {
        let conn = &request.connection;
        tokio::fs::create_dir_all(&request.staging_dir).await?;
        let out = request.staging_file("sql");
        let mut command = self
            .command(DUMP_TOOL, self.timeouts.dump_timeout_secs, conn)?
            .args(["--format=plain", "--no-owner", "--no-privileges"]);
        if let Some(snapshot) = snapshot {
            command = command.arg(format!("--snapshot={}", snapshot));
        }
        let command = command
            .arg(format!("--file={}", out.display()))
            .arg(conn.database.clone());
        info!(task_id = request.task_id, command = %command.display_masked(), "Starting full dump");
        if let Err(e) = command.run().await {
            remove_partial(&out).await;
            return Err(e);
        }
        require_output(DUMP_TOOL, &out).await?;
        Artifact::from_file(out, BackupKind::Full).await
    }

    /// Creates the target database when it does not exist yet. Returns whether it was created.
    async fn ensure_database(&self, target: &ConnectionInfo) -> Result<bool> {
        let admin = target.with_database(MAINTENANCE_DATABASE);
        let mut c = PgConnection::connect(&admin.to_url()?).await?;
        let exists: bool =
            sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM pg_database WHERE datname = $1)")
                .bind(&target.database)
                .fetch_one(&mut c)
                .await?;
        if !exists {
            let mut create = format!("CREATE DATABASE {}", quote_ident("postgres", &target.database));
            if !target.username.is_empty() {
                create.push_str(&format!(" OWNER {}", quote_ident("postgres", &target.username)));
            }
            sqlx::query(&create).execute(&mut c).await?;
            info!(database = %target.database, "Created target database");
        }
        let _ = c.close().await;
        Ok(!exists)
    }
}

/// Renders decoded row changes into one replayable transaction. A change that cannot
/// be expressed as SQL fails the whole script.
pub fn render_change_script(header: &str, events: &[ChangeEvent]) -> Result<String> {
    let mut script = String::from(header);
    script.push_str("BEGIN;\n");
    for event in events {
        let statement = event.statement.as_deref().ok_or_else(|| {
            BackupError::ChainIntegrity(format!(
                "{} on {} at {} has no replayable statement",
                event.kind,
                event.table.as_deref().unwrap_or("?"),
                event.position
            ))
        })?;
        script.push_str(statement);
        script.push('\n');
    }
    script.push_str("COMMIT;\n");
    Ok(script)
}

/// A replication session holding an exported snapshot open. A dump taken with
/// `--snapshot` sees exactly the transactions that committed before
/// `consistent_point`; decoding from that point yields the rest.
struct ExportedSnapshot {
    child: Child,
    stdin: Option<ChildStdin>,
    name: String,
    consistent_point: LogPosition,
}

impl ExportedSnapshot {
    async fn open(command: ToolCommand, wait: Duration) -> Result<Self> {
        let mut cmd = command.to_command();
        cmd.stdin(Stdio::piped()).stdout(Stdio::piped()).stderr(Stdio::piped());
        let mut child = cmd.spawn().map_err(|e| {
            BackupError::tool_failure(CLIENT_TOOL, None, format!("failed to start: {}", e))
        })?;
        let (Some(mut stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            return Err(BackupError::InvalidState("replication session has no pipes".into()));
        };

        let slot = format!("pitrtool_snap_{}", Uuid::new_v4().simple());
        let request = format!(
            "CREATE_REPLICATION_SLOT {} TEMPORARY LOGICAL test_decoding EXPORT_SNAPSHOT;\n",
            slot
        );
        stdin.write_all(request.as_bytes()).await?;
        stdin.flush().await?;

        let mut lines = BufReader::new(stdout).lines();
        let reply = match tokio::time::timeout(wait, lines.next_line()).await {
            Ok(line) => line?,
            Err(_) => {
                let _ = child.kill().await;
                return Err(BackupError::Timeout {
                    operation: "export snapshot".into(),
                    timeout: wait,
                });
            }
        };
        let Some(reply) = reply else {
            let status = child.wait().await?;
            let mut stderr = String::new();
            if let Some(mut pipe) = child.stderr.take() {
                let _ = pipe.read_to_string(&mut stderr).await;
            }
            return Err(BackupError::tool_failure(CLIENT_TOOL, status.code(), stderr.trim()));
        };
        let (name, consistent_point) = parse_slot_reply(&reply)?;
        debug!(slot = %slot, snapshot = %name, %consistent_point, "Exported snapshot");
        Ok(Self {
            child,
            stdin: Some(stdin),
            name,
            consistent_point,
        })
    }

    /// Ends the session; the temporary slot goes with it.
    async fn close(mut self) {
        drop(self.stdin.take());
        match tokio::time::timeout(Duration::from_secs(10), self.child.wait()).await {
            Ok(Ok(status)) if !status.success() => {
                warn!(code = ?status.code(), "Replication session exited with an error");
            }
            Ok(_) => {}
            Err(_) => {
                let _ = self.child.kill().await;
            }
        }
    }
}

/// `slot|consistent_point|snapshot|plugin`, as printed by `psql -A -t`.
fn parse_slot_reply(line: &str) -> Result<(String, LogPosition)> {
    let fields: Vec<&str> = line.trim().split('|').collect();
    match fields.as_slice() {
        [_, point, snapshot, ..] if !snapshot.is_empty() => Ok((snapshot.to_string(), point.parse()?)),
        _ => Err(BackupError::Parse(format!("unexpected replication slot reply: {:?}", line))),
    }
}

#[async_trait]
impl BackupExecutor for PostgresBackupExecutor {
    fn datasource_type(&self) -> &'static str {
        "postgres"
    }

    async fn execute_full(&self, request: &BackupRequest) -> Result<Artifact> {
        let conn = &request.connection;
        // The persistent slot has to predate the snapshot so later incrementals can
        // decode everything after its consistent point.
        if let Err(e) = self.reader.ensure_slot(conn).await {
            warn!(slot = %self.reader.slot_name(), error = %e, "Could not ensure replication slot");
        }
        let snapshot = match ExportedSnapshot::open(self.replication_session(conn)?, SNAPSHOT_WAIT).await {
            Ok(snapshot) => Some(snapshot),
            Err(e) => {
                warn!(error = %e, "Could not export a snapshot, the dump will have no end position");
                None
            }
        };

        let result = self.dump(request, snapshot.as_ref().map(|s| s.name.as_str())).await;
        let end = snapshot.as_ref().map(|s| s.consistent_point.clone());
        if let Some(snapshot) = snapshot {
            snapshot.close().await;
        }
        let artifact = result?;
        info!(task_id = request.task_id, size = artifact.size_bytes, "Full dump finished");
        Ok(artifact.with_range(None, end))
    }

    async fn execute_incremental(&self, request: &BackupRequest) -> Result<Artifact> {
        let conn = &request.connection;
        let created = self.reader.ensure_slot(conn).await?;
        let start = match &request.start_position {
            Some(position) => position.clone(),
            None => self.reader.current_position(conn).await?,
        };
        let end = self.reader.current_position(conn).await?;
        if created && !start.reached(&end) {
            return Err(BackupError::ChainIntegrity(format!(
                "replication slot {} did not exist; changes since {} are unavailable",
                self.reader.slot_name(),
                start
            )));
        }
        // Everything before start is already in a successful backup.
        if let LogPosition::Lsn(_) = start {
            self.reader.advance_slot(conn, &start).await?;
        }

        let timeout = Duration::from_secs(self.timeouts.change_read_timeout_secs);
        let events = self
            .reader
            .read_range(conn, &start, &end, &EventFilter::all(), timeout)
            .await?;

        tokio::fs::create_dir_all(&request.staging_dir).await?;
        let out = request.staging_file("sql");
        let script = render_change_script(&change_script_header(&start, &end, Utc::now()), &events)?;
        if let Err(e) = tokio::fs::write(&out, script).await {
            remove_partial(&out).await;
            return Err(e.into());
        }

        let artifact = Artifact::from_file(out, BackupKind::Incremental).await?;
        info!(
            task_id = request.task_id,
            %start,
            %end,
            events = events.len(),
            "Incremental capture finished"
        );
        Ok(artifact.with_range(Some(start), Some(end)))
    }

    async fn restore(&self, artifact: &Artifact, target: &ConnectionInfo) -> Result<bool> {
        let script = PlainScript::open(artifact).await?;
        self.ensure_database(target).await?;
        let command = self
            .command(CLIENT_TOOL, self.timeouts.restore_timeout_secs, target)?
            .args(["-X", "-q", "-v", "ON_ERROR_STOP=1"])
            .arg(format!("--dbname={}", target.database))
            .arg(format!("--file={}", script.path().display()));
        info!(
            kind = %artifact.kind,
            path = %artifact.path.display(),
            database = %target.database,
            "Applying backup with psql"
        );
        restore_outcome(CLIENT_TOOL, command.run().await)
    }

    async fn current_position(&self, conn: &ConnectionInfo) -> Result<LogPosition> {
        self.reader.current_position(conn).await
    }
}
