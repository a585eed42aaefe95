use async_trait::async_trait;
use chrono::{DateTime, Local, NaiveDate, NaiveTime, TimeZone, Utc};
use regex::Regex;
use sqlx::mysql::MySqlRow;
use sqlx::{Connection, Executor, MySqlConnection, Row};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::statement::{StatementClassifier, split_qualified};
use super::{ChangeEvent, ChangeHandler, ChangeLogReader, EventFilter, EventKind, StreamSession};
use crate::errors::{BackupError, Result};
use crate::model::{ConnectionInfo, LogPosition};
use crate::utils::process::ToolCommand;

/// First event offset in every binary log file.
pub const BINLOG_HEADER_OFFSET: u64 = 4;

const TOOL: &str = "mysqlbinlog";

#[derive(Debug, Clone, PartialEq)]
pub enum ParsedItem {
    Event(ChangeEvent),
    /// Every event before this position has been emitted.
    Progress(LogPosition),
}

/// Incremental parser for `mysqlbinlog --verbose --base64-output=DECODE-ROWS` output.
pub struct BinlogTextParser {
    file: String,
    at: u64,
    header_time: Option<DateTime<Utc>>,
    statement_time: Option<DateTime<Utc>>,
    database: Option<String>,
    in_query: bool,
    statement: String,
    classifier: StatementClassifier,
    at_re: Regex,
    header_re: Regex,
    rotate_re: Regex,
    row_re: Regex,
}

fn compile(pattern: &str) -> Result<Regex> {
    Regex::new(pattern).map_err(|e| BackupError::Parse(format!("invalid binlog pattern: {e}")))
}

impl BinlogTextParser {
    pub fn new(start_file: &str) -> Result<Self> {
        Ok(Self {
            file: start_file.to_string(),
            at: BINLOG_HEADER_OFFSET,
            header_time: None,
            statement_time: None,
            database: None,
            in_query: false,
            statement: String::new(),
            classifier: StatementClassifier::new()?,
            at_re: compile(r"^# at (\d+)\s*$")?,
            header_re: compile(
                r"^#(\d{6})\s+(\d{1,2}:\d{2}:\d{2})\s+server id\s+\d+\s+end_log_pos\s+\d+(.*)$",
            )?,
            rotate_re: compile(r"Rotate to (\S+)\s+pos:\s*(\d+)")?,
            row_re: compile(r"^### (INSERT INTO|UPDATE|DELETE FROM) (\S+)\s*$")?,
        })
    }

    pub fn current_file(&self) -> &str {
        &self.file
    }

    pub fn feed_line(&mut self, line: &str) -> Vec<ParsedItem> {
        let mut items = Vec::new();

        if let Some(c) = self.at_re.captures(line) {
            if let Ok(at) = c[1].parse::<u64>() {
                self.at = at;
                items.push(ParsedItem::Progress(LogPosition::binlog(&self.file, at)));
            }
            self.in_query = false;
            self.statement.clear();
            return items;
        }

        if let Some(c) = self.header_re.captures(line) {
            self.header_time = parse_header_time(&c[1], &c[2]);
            self.statement_time = None;
            let rest = &c[3];
            self.in_query = rest.contains("Query");
            if let Some(r) = self.rotate_re.captures(rest) {
                self.file = r[1].to_string();
                if let Ok(pos) = r[2].parse::<u64>() {
                    self.at = pos;
                    items.push(ParsedItem::Progress(LogPosition::binlog(&self.file, pos)));
                }
            }
            return items;
        }

        if let Some(c) = self.row_re.captures(line) {
            let kind = match &c[1] {
                "INSERT INTO" => EventKind::Insert,
                "UPDATE" => EventKind::Update,
                _ => EventKind::Delete,
            };
            let (database, table) = split_qualified(&c[2]);
            items.push(ParsedItem::Event(ChangeEvent {
                kind,
                database: database.or_else(|| self.database.clone()),
                table,
                timestamp: self.header_time,
                position: LogPosition::binlog(&self.file, self.at),
                statement: None,
            }));
            return items;
        }

        if line.starts_with('#') || !self.in_query {
            return items;
        }

        self.feed_query_line(line, &mut items);
        items
    }

    fn feed_query_line(&mut self, line: &str, items: &mut Vec<ParsedItem>) {
        let trimmed = line.trim();
        if self.statement.is_empty() {
            if trimmed.starts_with("/*!") || trimmed.is_empty() {
                return;
            }
            if let Some(db) = trimmed.strip_prefix("use ") {
                let name = db.trim_end_matches("/*!*/;").trim();
                self.database = split_qualified(name).1;
                return;
            }
            if let Some(ts) = trimmed.strip_prefix("SET TIMESTAMP=") {
                self.statement_time = parse_epoch(ts.trim_end_matches("/*!*/;"));
                return;
            }
            if trimmed.starts_with("SET ") && trimmed.ends_with("/*!*/;") {
                return;
            }
        }

        let (body, complete) = match trimmed.strip_suffix("/*!*/;") {
            Some(body) => (body, true),
            None => (trimmed, false),
        };
        if !body.is_empty() {
            if !self.statement.is_empty() {
                self.statement.push('\n');
            }
            self.statement.push_str(body);
        }
        if !complete {
            return;
        }

        let sql = std::mem::take(&mut self.statement);
        let sql = sql.trim();
        let upper = sql.to_ascii_uppercase();
        if sql.is_empty() || matches!(upper.as_str(), "BEGIN" | "COMMIT" | "ROLLBACK") {
            return;
        }
        let info = self.classifier.classify(sql);
        items.push(ParsedItem::Event(ChangeEvent {
            kind: info.kind,
            database: info.database.or_else(|| self.database.clone()),
            table: info.table,
            timestamp: self.statement_time.or(self.header_time),
            position: LogPosition::binlog(&self.file, self.at),
            statement: Some(sql.to_string()),
        }));
    }
}

/// Header times are printed in the local zone of the machine running mysqlbinlog.
fn parse_header_time(date: &str, time: &str) -> Option<DateTime<Utc>> {
    let date = NaiveDate::parse_from_str(date, "%y%m%d").ok()?;
    let time = NaiveTime::parse_from_str(time, "%H:%M:%S").ok()?;
    Local
        .from_local_datetime(&date.and_time(time))
        .earliest()
        .map(|t| t.with_timezone(&Utc))
}

fn parse_epoch(raw: &str) -> Option<DateTime<Utc>> {
    let (secs, frac) = match raw.split_once('.') {
        Some((s, f)) => (s, f),
        None => (raw, ""),
    };
    let secs = secs.trim().parse::<i64>().ok()?;
    let micros = if frac.is_empty() {
        0
    } else {
        format!("{:0<6}", &frac[..frac.len().min(6)]).parse::<u32>().ok()?
    };
    DateTime::from_timestamp(secs, micros * 1_000)
}

fn text_column(row: &MySqlRow, name: &str) -> Result<String> {
    match row.try_get::<String, _>(name) {
        Ok(value) => Ok(value),
        Err(_) => {
            let bytes: Vec<u8> = row.try_get(name)?;
            Ok(String::from_utf8_lossy(&bytes).into_owned())
        }
    }
}

async fn connect(conn: &ConnectionInfo) -> Result<MySqlConnection> {
    Ok(MySqlConnection::connect(&conn.to_url()?).await?)
}

/// Reads the server's binary log through `mysqlbinlog`, either from the server
/// (`--read-from-remote-server`) or from a local binlog directory.
pub struct BinlogReader {
    log_dir: Option<PathBuf>,
    program: Option<PathBuf>,
}

impl BinlogReader {
    pub fn new(log_dir: Option<PathBuf>) -> Self {
        Self {
            log_dir,
            program: None,
        }
    }

    /// Uses `program` instead of the `mysqlbinlog` found on `PATH`.
    pub fn with_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = Some(program.into());
        self
    }

    pub fn log_dir(&self) -> Option<&Path> {
        self.log_dir.as_deref()
    }

    pub(crate) fn tool(&self, timeout: Duration) -> Result<ToolCommand> {
        match &self.program {
            Some(program) => Ok(ToolCommand::new(TOOL, program, timeout)),
            None => ToolCommand::locate(TOOL, timeout),
        }
    }

    /// Binary log file names known to the server, oldest first.
    pub async fn binary_logs(&self, conn: &ConnectionInfo) -> Result<Vec<String>> {
        let mut c = connect(conn).await?;
        let rows = c.fetch_all("SHOW BINARY LOGS").await?;
        let names = rows
            .iter()
            .map(|row| text_column(row, "Log_name"))
            .collect::<Result<Vec<_>>>()?;
        let _ = c.close().await;
        Ok(names)
    }

    /// Files spanning `[start, end]` and the offset to start reading the first one at.
    pub async fn files_between(
        &self,
        conn: &ConnectionInfo,
        start: &LogPosition,
        end: &LogPosition,
    ) -> Result<(Vec<String>, u64)> {
        let LogPosition::Binlog { file: end_file, .. } = end else {
            return Err(BackupError::InvalidState(format!("not a binlog position: {}", end)));
        };
        let logs = self.binary_logs(conn).await?;
        let (start_file, offset) = match start {
            LogPosition::Start => match logs.first() {
                Some(first) => (first.clone(), BINLOG_HEADER_OFFSET),
                None => return Err(BackupError::NotFound("binary logs on the server".into())),
            },
            LogPosition::Binlog { file, offset } => (file.clone(), *offset),
            LogPosition::Lsn(_) => {
                return Err(BackupError::InvalidState(format!("not a binlog position: {}", start)));
            }
        };
        let files: Vec<String> = logs
            .into_iter()
            .filter(|name| name.as_str() >= start_file.as_str() && name.as_str() <= end_file.as_str())
            .collect();
        if files.first() != Some(&start_file) {
            return Err(BackupError::ChainIntegrity(format!(
                "binary log {} is no longer available on the server",
                start_file
            )));
        }
        Ok((files, offset))
    }

    /// Source arguments shared by bounded reads, streaming and incremental dumps.
    pub(crate) fn source_args(&self, conn: &ConnectionInfo, files: &[String]) -> Vec<String> {
        let mut args = Vec::new();
        match &self.log_dir {
            Some(dir) => {
                args.extend(files.iter().map(|f| dir.join(f).display().to_string()));
            }
            None => {
                args.push("--read-from-remote-server".to_string());
                args.push(format!("--host={}", conn.host));
                args.push(format!("--port={}", conn.port));
                args.push(format!("--user={}", conn.username));
                args.extend(files.iter().cloned());
            }
        }
        args
    }
}

#[async_trait]
impl ChangeLogReader for BinlogReader {
    fn datasource_type(&self) -> &'static str {
        "mysql"
    }

    async fn current_position(&self, conn: &ConnectionInfo) -> Result<LogPosition> {
        let mut c = connect(conn).await?;
        let row = match c.fetch_optional("SHOW MASTER STATUS").await {
            Ok(row) => row,
            Err(e) => {
                debug!(error = %e, "SHOW MASTER STATUS failed, trying SHOW BINARY LOG STATUS");
                c.fetch_optional("SHOW BINARY LOG STATUS").await?
            }
        };
        let _ = c.close().await;
        let row = row.ok_or_else(|| {
            BackupError::InvalidState("binary logging is not enabled on the server".into())
        })?;
        let file = text_column(&row, "File")?;
        let offset: u64 = row.try_get("Position")?;
        Ok(LogPosition::binlog(file, offset))
    }

    async fn stream_from(
        &self,
        conn: &ConnectionInfo,
        position: LogPosition,
        handler: Arc<dyn ChangeHandler>,
    ) -> Result<StreamSession> {
        let (file, offset) = match position {
            LogPosition::Binlog { file, offset } => (file, offset),
            LogPosition::Start => {
                let logs = self.binary_logs(conn).await?;
                let first = logs
                    .into_iter()
                    .next()
                    .ok_or_else(|| BackupError::NotFound("binary logs on the server".into()))?;
                (first, BINLOG_HEADER_OFFSET)
            }
            other => {
                return Err(BackupError::InvalidState(format!("not a binlog position: {}", other)));
            }
        };

        let remote = BinlogReader::new(None);
        let mut args = vec![
            "--verbose".to_string(),
            "--base64-output=DECODE-ROWS".to_string(),
            "--stop-never".to_string(),
            format!("--start-position={}", offset),
        ];
        args.extend(remote.source_args(conn, std::slice::from_ref(&file)));
        let mut tool = self.tool(Duration::MAX)?.args(args);
        if let Some(password) = &conn.password {
            tool = tool.env("MYSQL_PWD", password.clone());
        }
        info!(command = %tool.display_masked(), "Starting binlog stream");

        let mut command = tool.to_command();
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let mut child = command
            .spawn()
            .map_err(|e| BackupError::tool_failure(TOOL, None, format!("failed to start: {}", e)))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| BackupError::InvalidState("mysqlbinlog stdout unavailable".into()))?;
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(stderr = %line, "mysqlbinlog");
                }
            });
        }

        let mut parser = BinlogTextParser::new(&file)?;
        let token = CancellationToken::new();
        let connected = Arc::new(AtomicBool::new(true));
        let task_token = token.clone();
        let task_connected = connected.clone();

        let task = tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                tokio::select! {
                    _ = task_token.cancelled() => break,
                    line = lines.next_line() => match line {
                        Ok(Some(line)) => {
                            for item in parser.feed_line(&line) {
                                match item {
                                    ParsedItem::Event(event) => handler.on_event(event),
                                    ParsedItem::Progress(p) => handler.on_progress(&p),
                                }
                            }
                        }
                        Ok(None) => {
                            match child.wait().await {
                                Ok(status) if !status.success() => handler.on_error(
                                    BackupError::tool_failure(TOOL, status.code(), "binlog stream ended"),
                                ),
                                Ok(_) => {}
                                Err(e) => handler.on_error(e.into()),
                            }
                            break;
                        }
                        Err(e) => {
                            handler.on_error(e.into());
                            break;
                        }
                    }
                }
            }
            if let Err(e) = child.kill().await {
                debug!(error = %e, "mysqlbinlog already exited");
            }
            task_connected.store(false, Ordering::SeqCst);
        });

        Ok(StreamSession::new(token, connected, task))
    }

    async fn read_range(
        &self,
        conn: &ConnectionInfo,
        start: &LogPosition,
        end: &LogPosition,
        filter: &EventFilter,
        timeout: Duration,
    ) -> Result<Vec<ChangeEvent>> {
        if start.reached(end) {
            return Ok(Vec::new());
        }
        let LogPosition::Binlog { offset: stop, .. } = end else {
            return Err(BackupError::InvalidState(format!("not a binlog position: {}", end)));
        };
        let (files, offset) = self.files_between(conn, start, end).await?;
        let mut args = vec![
            "--verbose".to_string(),
            "--base64-output=DECODE-ROWS".to_string(),
            format!("--start-position={}", offset),
            format!("--stop-position={}", stop),
        ];
        args.extend(self.source_args(conn, &files));
        let mut tool = self.tool(timeout)?.args(args).capture_stdout();
        if let Some(password) = &conn.password {
            tool = tool.env("MYSQL_PWD", password.clone());
        }
        let output = tool.run().await?;

        let mut parser = BinlogTextParser::new(&files[0])?;
        let events = output
            .stdout
            .lines()
            .flat_map(|line| parser.feed_line(line))
            .filter_map(|item| match item {
                ParsedItem::Event(event) => Some(event),
                ParsedItem::Progress(_) => None,
            })
            .filter(|event| event.position.reached(start) && !event.position.reached(end))
            .filter(|event| filter.matches(event))
            .collect::<Vec<_>>();
        if events.is_empty() {
            warn!(%start, %end, "No change events in binlog range");
        }
        Ok(events)
    }
}
