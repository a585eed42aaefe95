use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;
use sqlx::{Connection, PgConnection, Row};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{ChangeEvent, ChangeHandler, ChangeLogReader, EventKind, StreamSession};
use crate::errors::{BackupError, Result};
use crate::model::{ConnectionInfo, LogPosition};
use crate::utils::quote_ident;

/// One column of a decoded tuple. `value` is the SQL literal exactly as the decoder
/// printed it (`'text'`, `42`, `null`), or `None` for an unchanged TOAST datum.
#[derive(Debug, Clone, PartialEq)]
pub struct Column {
    pub name: String,
    pub type_name: String,
    pub value: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RowChange {
    pub schema: String,
    pub table: String,
    pub kind: EventKind,
    pub columns: Vec<Column>,
    pub old_key: Vec<Column>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DecodedChange {
    Begin { xid: u64 },
    Commit { xid: u64, timestamp: Option<DateTime<Utc>> },
    Row(RowChange),
    /// `pg_logical_emit_message` output; carries no row data.
    Message,
}

/// Parses lines produced by the `test_decoding` output plugin.
pub struct TestDecodingParser {
    table_re: Regex,
    commit_re: Regex,
}

fn compile(pattern: &str) -> Result<Regex> {
    Regex::new(pattern).map_err(|e| BackupError::Parse(format!("invalid decoding pattern: {e}")))
}

impl TestDecodingParser {
    pub fn new() -> Result<Self> {
        Ok(Self {
            table_re: compile(r"^table (.+?): (INSERT|UPDATE|DELETE|TRUNCATE):\s?(.*)$")?,
            commit_re: compile(r"^COMMIT (\d+)(?: \(at (.+)\))?$")?,
        })
    }

    pub fn parse(&self, data: &str) -> Result<DecodedChange> {
        if data.starts_with("message: ") {
            return Ok(DecodedChange::Message);
        }
        if let Some(xid) = data.strip_prefix("BEGIN ") {
            return Ok(DecodedChange::Begin {
                xid: parse_xid(xid)?,
            });
        }
        if let Some(c) = self.commit_re.captures(data) {
            let timestamp = c.get(2).and_then(|t| {
                DateTime::parse_from_str(t.as_str(), "%Y-%m-%d %H:%M:%S%.f%#z")
                    .ok()
                    .map(|t| t.with_timezone(&Utc))
            });
            return Ok(DecodedChange::Commit {
                xid: parse_xid(&c[1])?,
                timestamp,
            });
        }
        let c = self
            .table_re
            .captures(data)
            .ok_or_else(|| BackupError::Parse(format!("unrecognised decoding output: {}", data)))?;
        let (schema, table) = split_relation(&c[1])?;
        let body = c[3].trim();
        let (kind, columns, old_key) = match &c[2] {
            "INSERT" => (EventKind::Insert, parse_columns(body)?, Vec::new()),
            "UPDATE" => match body.strip_prefix("old-key: ") {
                Some(rest) => {
                    let (old, new) = rest.split_once(" new-tuple: ").ok_or_else(|| {
                        BackupError::Parse(format!("UPDATE without new tuple: {}", data))
                    })?;
                    (EventKind::Update, parse_columns(new)?, parse_columns(old)?)
                }
                None => (EventKind::Update, parse_columns(body)?, Vec::new()),
            },
            "DELETE" if body == "(no-tuple-data)" => (EventKind::Delete, Vec::new(), Vec::new()),
            "DELETE" => (EventKind::Delete, parse_columns(body)?, Vec::new()),
            _ => (EventKind::Ddl, Vec::new(), Vec::new()),
        };
        Ok(DecodedChange::Row(RowChange {
            schema,
            table,
            kind,
            columns,
            old_key,
        }))
    }
}

fn parse_xid(raw: &str) -> Result<u64> {
    raw.trim()
        .parse::<u64>()
        .map_err(|e| BackupError::Parse(format!("invalid xid {:?}: {}", raw, e)))
}

/// Reads an identifier that is either bare or double-quoted, returning it and the rest.
fn read_ident<'a>(input: &'a str, stop: &[char]) -> Result<(String, &'a str)> {
    if let Some(rest) = input.strip_prefix('"') {
        let mut name = String::new();
        let mut chars = rest.char_indices().peekable();
        while let Some((i, ch)) = chars.next() {
            if ch == '"' {
                if let Some((_, '"')) = chars.peek() {
                    name.push('"');
                    chars.next();
                    continue;
                }
                return Ok((name, &rest[i + 1..]));
            }
            name.push(ch);
        }
        Err(BackupError::Parse(format!("unterminated identifier: {}", input)))
    } else {
        let end = input.find(stop).unwrap_or(input.len());
        Ok((input[..end].to_string(), &input[end..]))
    }
}

fn split_relation(raw: &str) -> Result<(String, String)> {
    let (schema, rest) = read_ident(raw, &['.'])?;
    match rest.strip_prefix('.') {
        Some(rest) => {
            let (table, _) = read_ident(rest, &[])?;
            Ok((schema, table))
        }
        None => Ok(("public".to_string(), schema)),
    }
}

/// Parses `id[integer]:1 name[text]:'a b' tags[text[]]:'{x}'`.
pub fn parse_columns(body: &str) -> Result<Vec<Column>> {
    let mut columns = Vec::new();
    let mut rest = body.trim_start();
    while !rest.is_empty() {
        let (name, after_name) = read_ident(rest, &['['])?;
        let after_bracket = after_name
            .strip_prefix('[')
            .ok_or_else(|| BackupError::Parse(format!("column without type: {}", rest)))?;
        let type_end = after_bracket
            .find("]:")
            .ok_or_else(|| BackupError::Parse(format!("column without value: {}", rest)))?;
        let type_name = after_bracket[..type_end].to_string();
        let value_part = &after_bracket[type_end + 2..];

        let (literal, remaining) = if value_part.starts_with('\'') {
            let bytes = value_part.as_bytes();
            let mut i = 1;
            loop {
                if i >= bytes.len() {
                    return Err(BackupError::Parse(format!("unterminated literal: {}", value_part)));
                }
                if bytes[i] == b'\'' {
                    if bytes.get(i + 1) == Some(&b'\'') {
                        i += 2;
                        continue;
                    }
                    break;
                }
                i += 1;
            }
            (&value_part[..=i], &value_part[i + 1..])
        } else {
            let end = value_part.find(' ').unwrap_or(value_part.len());
            (&value_part[..end], &value_part[end..])
        };

        columns.push(Column {
            name,
            type_name,
            value: match literal {
                "unchanged-toast-datum" => None,
                "null" => Some("NULL".to_string()),
                other => Some(other.to_string()),
            },
        });
        rest = remaining.trim_start();
    }
    Ok(columns)
}

fn predicate(columns: &[&Column]) -> Option<String> {
    let parts: Vec<String> = columns
        .iter()
        .filter_map(|c| {
            let name = quote_ident("postgres", &c.name);
            match c.value.as_deref() {
                Some("NULL") => Some(format!("{} IS NULL", name)),
                Some(v) => Some(format!("{} = {}", name, v)),
                None => None,
            }
        })
        .collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join(" AND "))
    }
}

impl RowChange {
    pub fn qualified_name(&self) -> String {
        format!(
            "{}.{}",
            quote_ident("postgres", &self.schema),
            quote_ident("postgres", &self.table)
        )
    }

    /// Replayable SQL for the change. Updates are keyed by the decoded old key when
    /// present, else by `key_columns`, else by the first column.
    pub fn to_sql(&self, key_columns: &[String]) -> Option<String> {
        let target = self.qualified_name();
        match self.kind {
            EventKind::Insert => {
                let (names, values): (Vec<String>, Vec<String>) = self
                    .columns
                    .iter()
                    .filter_map(|c| {
                        c.value
                            .as_ref()
                            .map(|v| (quote_ident("postgres", &c.name), v.clone()))
                    })
                    .unzip();
                Some(format!(
                    "INSERT INTO {} ({}) VALUES ({});",
                    target,
                    names.join(", "),
                    values.join(", ")
                ))
            }
            EventKind::Update => {
                let assignments: Vec<String> = self
                    .columns
                    .iter()
                    .filter_map(|c| {
                        c.value
                            .as_ref()
                            .map(|v| format!("{} = {}", quote_ident("postgres", &c.name), v))
                    })
                    .collect();
                let key: Vec<&Column> = if !self.old_key.is_empty() {
                    self.old_key.iter().collect()
                } else {
                    let by_key: Vec<&Column> = self
                        .columns
                        .iter()
                        .filter(|c| key_columns.contains(&c.name))
                        .collect();
                    if by_key.is_empty() {
                        self.columns.iter().take(1).collect()
                    } else {
                        by_key
                    }
                };
                if assignments.is_empty() {
                    return None;
                }
                Some(format!(
                    "UPDATE {} SET {} WHERE {};",
                    target,
                    assignments.join(", "),
                    predicate(&key)?
                ))
            }
            EventKind::Delete => {
                let key: Vec<&Column> = self.columns.iter().collect();
                Some(format!("DELETE FROM {} WHERE {};", target, predicate(&key)?))
            }
            EventKind::Ddl => Some(format!("TRUNCATE TABLE {};", target)),
            EventKind::Query => None,
        }
    }
}

/// Logical-decoding reader over a `test_decoding` replication slot. Changes are peeked,
/// never consumed; the slot is only moved by [`WalReader::advance_slot`].
pub struct WalReader {
    slot: String,
    poll_interval: Duration,
}

struct PollState {
    parser: TestDecodingParser,
    start: u64,
    last_commit: Option<u64>,
    database: String,
    key_cache: HashMap<String, Vec<String>>,
}

async fn connect(conn: &ConnectionInfo) -> Result<PgConnection> {
    Ok(PgConnection::connect(&conn.to_url()?).await?)
}

fn parse_lsn(raw: &str) -> Result<u64> {
    match raw.parse::<LogPosition>()? {
        LogPosition::Lsn(lsn) => Ok(lsn),
        other => Err(BackupError::Parse(format!("expected an LSN, got {}", other))),
    }
}

impl WalReader {
    pub fn new(slot: impl Into<String>) -> Self {
        Self {
            slot: slot.into(),
            poll_interval: Duration::from_millis(500),
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn slot_name(&self) -> &str {
        &self.slot
    }

    /// Creates the replication slot when missing. Returns whether it was created.
    pub async fn ensure_slot(&self, conn: &ConnectionInfo) -> Result<bool> {
        let mut c = connect(conn).await?;
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM pg_replication_slots WHERE slot_name = $1)",
        )
        .bind(&self.slot)
        .fetch_one(&mut c)
        .await?;
        if !exists {
            sqlx::query("SELECT pg_create_logical_replication_slot($1, 'test_decoding')")
                .bind(&self.slot)
                .execute(&mut c)
                .await?;
            info!(slot = %self.slot, "Created logical replication slot");
        }
        let _ = c.close().await;
        Ok(!exists)
    }

    /// Marks everything before `position` as consumed. A slot already at or past
    /// `position` is left alone. Returns whether the slot moved.
    pub async fn advance_slot(&self, conn: &ConnectionInfo, position: &LogPosition) -> Result<bool> {
        let LogPosition::Lsn(_) = position else {
            return Err(BackupError::InvalidState(format!("not an LSN: {}", position)));
        };
        let mut c = connect(conn).await?;
        let moved = sqlx::query(
            "SELECT pg_replication_slot_advance(slot_name, $2::pg_lsn) FROM pg_replication_slots \
             WHERE slot_name = $1 AND confirmed_flush_lsn < $2::pg_lsn",
        )
        .bind(&self.slot)
        .bind(position.to_string())
        .fetch_optional(&mut c)
        .await?
        .is_some();
        let _ = c.close().await;
        debug!(slot = %self.slot, %position, moved, "Advanced replication slot");
        Ok(moved)
    }

    async fn primary_key(&self, c: &mut PgConnection, state: &mut PollState, change: &RowChange) -> Vec<String> {
        let relation = change.qualified_name();
        if let Some(keys) = state.key_cache.get(&relation) {
            return keys.clone();
        }
        let keys: Vec<String> = sqlx::query_scalar(
            "SELECT a.attname::text FROM pg_index i \
             JOIN pg_attribute a ON a.attrelid = i.indrelid AND a.attnum = ANY(i.indkey) \
             WHERE i.indrelid = $1::regclass AND i.indisprimary",
        )
        .bind(&relation)
        .fetch_all(&mut *c)
        .await
        .unwrap_or_else(|e| {
            warn!(relation = %relation, error = %e, "Could not look up primary key");
            Vec::new()
        });
        state.key_cache.insert(relation, keys.clone());
        keys
    }

    /// One peek up to the current WAL position. Returns events of transactions
    /// committed since the previous poll, the position everything was read up to and
    /// any lines that were skipped.
    async fn poll(&self, c: &mut PgConnection, state: &mut PollState) -> Result<Polled> {
        let upto: String = sqlx::query_scalar("SELECT pg_current_wal_lsn()::text")
            .fetch_one(&mut *c)
            .await?;
        let rows = sqlx::query(
            "SELECT lsn::text AS lsn, data FROM pg_logical_slot_peek_changes($1, $2::pg_lsn, NULL, 'include-timestamp', 'on')",
        )
        .bind(&self.slot)
        .bind(&upto)
        .fetch_all(&mut *c)
        .await?;
        let mut lines = Vec::with_capacity(rows.len());
        for row in rows {
            lines.push((row.try_get::<String, _>("lsn")?, row.try_get::<String, _>("data")?));
        }

        let collected = collect_committed(&state.parser, &lines, state.start, state.last_commit)?;
        let mut events = Vec::with_capacity(collected.changes.len());
        for committed in collected.changes {
            let keys = self.primary_key(c, state, &committed.change).await;
            events.push(ChangeEvent {
                kind: committed.change.kind,
                database: Some(state.database.clone()),
                table: Some(format!("{}.{}", committed.change.schema, committed.change.table)),
                timestamp: committed.timestamp,
                position: LogPosition::Lsn(committed.commit),
                statement: committed.change.to_sql(&keys),
            });
        }
        state.last_commit = collected.last_commit;
        Ok(Polled {
            events,
            upto: LogPosition::Lsn(parse_lsn(&upto)?),
            skipped: collected.skipped,
        })
    }
}

struct Polled {
    events: Vec<ChangeEvent>,
    upto: LogPosition,
    skipped: Vec<BackupError>,
}

#[derive(Debug)]
struct Committed {
    change: RowChange,
    commit: u64,
    timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug)]
struct Collected {
    changes: Vec<Committed>,
    last_commit: Option<u64>,
    skipped: Vec<BackupError>,
}

/// Groups peeked `(lsn, data)` lines into committed transactions at or after `start`
/// and newer than `last_commit`. Undecodable lines outside a transaction are skipped
/// and reported; one inside a transaction that is due fails with `ChainIntegrity`.
fn collect_committed(
    parser: &TestDecodingParser,
    lines: &[(String, String)],
    start: u64,
    last_commit: Option<u64>,
) -> Result<Collected> {
    let mut collected = Collected {
        changes: Vec::new(),
        last_commit,
        skipped: Vec::new(),
    };
    let mut pending: Vec<RowChange> = Vec::new();
    let mut undecodable: Option<BackupError> = None;
    let mut in_transaction = false;
    for (lsn, data) in lines {
        match parser.parse(data) {
            Ok(DecodedChange::Begin { .. }) => {
                pending.clear();
                undecodable = None;
                in_transaction = true;
            }
            Ok(DecodedChange::Message) => {}
            Ok(DecodedChange::Row(change)) => pending.push(change),
            Ok(DecodedChange::Commit { timestamp, .. }) => {
                in_transaction = false;
                let commit = parse_lsn(lsn)?;
                let changes = std::mem::take(&mut pending);
                let problem = undecodable.take();
                let due = commit >= start && collected.last_commit.is_none_or(|last| commit > last);
                if !due {
                    continue;
                }
                if let Some(e) = problem {
                    return Err(BackupError::ChainIntegrity(format!(
                        "transaction committed at {} has an undecodable change: {}",
                        LogPosition::Lsn(commit),
                        e
                    )));
                }
                collected.last_commit = Some(commit);
                collected.changes.extend(changes.into_iter().map(|change| Committed {
                    change,
                    commit,
                    timestamp,
                }));
            }
            Err(e) if in_transaction => {
                if undecodable.is_none() {
                    undecodable = Some(e);
                }
            }
            Err(e) => collected.skipped.push(e),
        }
    }
    Ok(collected)
}

#[async_trait]
impl ChangeLogReader for WalReader {
    fn datasource_type(&self) -> &'static str {
        "postgres"
    }

    async fn current_position(&self, conn: &ConnectionInfo) -> Result<LogPosition> {
        let mut c = connect(conn).await?;
        let lsn: String = sqlx::query_scalar("SELECT pg_current_wal_lsn()::text")
            .fetch_one(&mut c)
            .await?;
        let _ = c.close().await;
        lsn.parse()
    }

    async fn stream_from(
        &self,
        conn: &ConnectionInfo,
        position: LogPosition,
        handler: Arc<dyn ChangeHandler>,
    ) -> Result<StreamSession> {
        let start = match position {
            LogPosition::Start => 0,
            LogPosition::Lsn(lsn) => lsn,
            other => {
                return Err(BackupError::InvalidState(format!("not an LSN: {}", other)));
            }
        };
        self.ensure_slot(conn).await?;

        let token = CancellationToken::new();
        let connected = Arc::new(AtomicBool::new(false));
        let task_token = token.clone();
        let task_connected = connected.clone();
        let conn = conn.clone();
        let reader = WalReader::new(self.slot.clone()).with_poll_interval(self.poll_interval);
        let mut state = PollState {
            parser: TestDecodingParser::new()?,
            start,
            last_commit: None,
            database: conn.database.clone(),
            key_cache: HashMap::new(),
        };

        let task = tokio::spawn(async move {
            let mut pg: Option<PgConnection> = None;
            while !task_token.is_cancelled() {
                if pg.is_none() {
                    match connect(&conn).await {
                        Ok(c) => {
                            pg = Some(c);
                            task_connected.store(true, Ordering::SeqCst);
                        }
                        Err(e) => handler.on_error(e),
                    }
                }
                if let Some(c) = pg.as_mut() {
                    match reader.poll(c, &mut state).await {
                        Ok(polled) => {
                            for problem in polled.skipped {
                                handler.on_error(problem);
                            }
                            for event in polled.events {
                                handler.on_event(event);
                            }
                            handler.on_progress(&polled.upto);
                        }
                        Err(e) => {
                            handler.on_error(e);
                            pg = None;
                            task_connected.store(false, Ordering::SeqCst);
                        }
                    }
                }
                tokio::select! {
                    _ = task_token.cancelled() => break,
                    _ = tokio::time::sleep(reader.poll_interval) => {}
                }
            }
            if let Some(c) = pg {
                let _ = c.close().await;
            }
            task_connected.store(false, Ordering::SeqCst);
        });

        Ok(StreamSession::new(token, connected, task))
    }
}
