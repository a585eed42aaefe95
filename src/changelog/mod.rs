//! Change-log readers: MySQL binary logs and PostgreSQL logical decoding.
//!
//! Readers consume the textual output of the engines' own tooling and turn it into
//! [`ChangeEvent`]s. A live [`StreamSession`] keeps its own cancellation token and
//! connected flag; sessions never share state.

pub mod binlog;
pub mod statement;
pub mod wal;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::errors::{BackupError, Result};
use crate::model::{ConnectionInfo, LogPosition};

pub use binlog::BinlogReader;
pub use wal::WalReader;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    Insert,
    Update,
    Delete,
    Ddl,
    Query,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EventKind::Insert => "INSERT",
            EventKind::Update => "UPDATE",
            EventKind::Delete => "DELETE",
            EventKind::Ddl => "DDL",
            EventKind::Query => "QUERY",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub kind: EventKind,
    pub database: Option<String>,
    pub table: Option<String>,
    pub timestamp: Option<DateTime<Utc>>,
    pub position: LogPosition,
    /// Replayable SQL for the change, when the source provides or allows rendering it.
    pub statement: Option<String>,
}

/// Selects events by database and table. Empty lists match everything. Table
/// entries are either `table` or `database.table`.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    databases: Vec<String>,
    tables: Vec<String>,
}

impl EventFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn with_databases<I, S>(mut self, databases: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.databases.extend(databases.into_iter().map(Into::into));
        self
    }

    pub fn with_tables<I, S>(mut self, tables: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tables.extend(tables.into_iter().map(Into::into));
        self
    }

    pub fn matches(&self, event: &ChangeEvent) -> bool {
        let database = event.database.as_deref().unwrap_or_default();
        if !self.databases.is_empty()
            && !self.databases.iter().any(|d| d.eq_ignore_ascii_case(database))
        {
            return false;
        }
        if self.tables.is_empty() {
            return true;
        }
        let Some(table) = event.table.as_deref() else {
            return false;
        };
        self.tables.iter().any(|wanted| match wanted.split_once('.') {
            Some((db, t)) => db.eq_ignore_ascii_case(database) && t.eq_ignore_ascii_case(table),
            None => wanted.eq_ignore_ascii_case(table),
        })
    }
}

/// Receives what a stream session observes. Called from the session's own task.
pub trait ChangeHandler: Send + Sync {
    fn on_event(&self, event: ChangeEvent);

    fn on_error(&self, error: BackupError);

    /// Everything before `position` has been delivered.
    fn on_progress(&self, _position: &LogPosition) {}
}

/// A live subscription to a change log. Dropping the session cancels it; `close`
/// additionally waits for the reader task to finish.
pub struct StreamSession {
    token: CancellationToken,
    connected: Arc<AtomicBool>,
    task: Option<JoinHandle<()>>,
}

impl StreamSession {
    pub(crate) fn new(token: CancellationToken, connected: Arc<AtomicBool>, task: JoinHandle<()>) -> Self {
        Self {
            token,
            connected,
            task: Some(task),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.token.is_cancelled()
    }

    pub async fn close(mut self) {
        self.token.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!(error = %e, "Change stream task ended abnormally");
            }
        }
        self.connected.store(false, Ordering::SeqCst);
        debug!("Change stream session closed");
    }
}

impl Drop for StreamSession {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

#[async_trait]
pub trait ChangeLogReader: Send + Sync {
    fn datasource_type(&self) -> &'static str;

    async fn current_position(&self, conn: &ConnectionInfo) -> Result<LogPosition>;

    async fn stream_from(
        &self,
        conn: &ConnectionInfo,
        position: LogPosition,
        handler: Arc<dyn ChangeHandler>,
    ) -> Result<StreamSession>;

    /// Events in `[start, end)` accepted by `filter`. Stops once an event or progress
    /// marker at or beyond `end` is observed; fails with `Timeout` when the deadline
    /// passes first, or with the reader's `ChainIntegrity` error when a change in the
    /// range cannot be decoded. The session is closed on every path.
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
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handler = Arc::new(ChannelHandler { tx });
        let session = self.stream_from(conn, start.clone(), handler).await?;
        let deadline = tokio::time::Instant::now() + timeout;

        let mut events = Vec::new();
        let outcome = loop {
            match tokio::time::timeout_at(deadline, rx.recv()).await {
                Err(_) => {
                    break Err(BackupError::Timeout {
                        operation: format!("read {} change log {}..{}", self.datasource_type(), start, end),
                        timeout,
                    });
                }
                Ok(None) => {
                    break Err(BackupError::InvalidState(format!(
                        "change stream ended before reaching {}",
                        end
                    )));
                }
                Ok(Some(StreamMessage::Event(event))) => {
                    if event.position.reached(end) {
                        break Ok(());
                    }
                    if filter.matches(&event) {
                        events.push(event);
                    }
                }
                Ok(Some(StreamMessage::Progress(position))) => {
                    if position.reached(end) {
                        break Ok(());
                    }
                }
                Ok(Some(StreamMessage::Error(e @ BackupError::ChainIntegrity(_)))) => {
                    break Err(e);
                }
                Ok(Some(StreamMessage::Error(e))) => {
                    warn!(error = %e, "Change stream reported an error");
                }
            }
        };
        session.close().await;
        outcome.map(|_| events)
    }
}

enum StreamMessage {
    Event(ChangeEvent),
    Progress(LogPosition),
    Error(BackupError),
}

struct ChannelHandler {
    tx: mpsc::UnboundedSender<StreamMessage>,
}

impl ChangeHandler for ChannelHandler {
    fn on_event(&self, event: ChangeEvent) {
        let _ = self.tx.send(StreamMessage::Event(event));
    }

    fn on_error(&self, error: BackupError) {
        let _ = self.tx.send(StreamMessage::Error(error));
    }

    fn on_progress(&self, position: &LogPosition) {
        let _ = self.tx.send(StreamMessage::Progress(position.clone()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn event(db: &str, table: &str, position: LogPosition) -> ChangeEvent {
        ChangeEvent {
            kind: EventKind::Insert,
            database: Some(db.to_string()),
            table: Some(table.to_string()),
            timestamp: None,
            position,
            statement: None,
        }
    }

    #[test]
    fn test_filter_by_database_and_table() {
        let e = event("shop", "orders", LogPosition::Lsn(1));
        assert!(EventFilter::all().matches(&e));
        assert!(EventFilter::all().with_databases(["SHOP"]).matches(&e));
        assert!(!EventFilter::all().with_databases(["crm"]).matches(&e));
        assert!(EventFilter::all().with_tables(["orders"]).matches(&e));
        assert!(EventFilter::all().with_tables(["shop.orders"]).matches(&e));
        assert!(!EventFilter::all().with_tables(["crm.orders"]).matches(&e));
        let mut no_table = e.clone();
        no_table.table = None;
        assert!(!EventFilter::all().with_tables(["orders"]).matches(&no_table));
    }

    /// Replays a fixed script of messages, then idles until cancelled.
    struct ScriptedReader {
        script: Vec<StreamMessage>,
        sessions_closed: Arc<Mutex<u32>>,
    }

    impl ScriptedReader {
        fn new(script: Vec<StreamMessage>) -> Self {
            Self {
                script,
                sessions_closed: Arc::new(Mutex::new(0)),
            }
        }
    }

    fn clone_message(m: &StreamMessage) -> StreamMessage {
        match m {
            StreamMessage::Event(e) => StreamMessage::Event(e.clone()),
            StreamMessage::Progress(p) => StreamMessage::Progress(p.clone()),
            StreamMessage::Error(BackupError::ChainIntegrity(m)) => {
                StreamMessage::Error(BackupError::ChainIntegrity(m.clone()))
            }
            StreamMessage::Error(e) => StreamMessage::Error(BackupError::Transient(e.to_string())),
        }
    }

    #[async_trait]
    impl ChangeLogReader for ScriptedReader {
        fn datasource_type(&self) -> &'static str {
            "postgres"
        }

        async fn current_position(&self, _conn: &ConnectionInfo) -> Result<LogPosition> {
            Ok(LogPosition::Lsn(100))
        }

        async fn stream_from(
            &self,
            _conn: &ConnectionInfo,
            _position: LogPosition,
            handler: Arc<dyn ChangeHandler>,
        ) -> Result<StreamSession> {
            let token = CancellationToken::new();
            let connected = Arc::new(AtomicBool::new(true));
            let script: Vec<StreamMessage> = self.script.iter().map(clone_message).collect();
            let closed = self.sessions_closed.clone();
            let child = token.clone();
            let task = tokio::spawn(async move {
                for message in script {
                    match message {
                        StreamMessage::Event(e) => handler.on_event(e),
                        StreamMessage::Progress(p) => handler.on_progress(&p),
                        StreamMessage::Error(e) => handler.on_error(e),
                    }
                }
                child.cancelled().await;
                *closed.lock().unwrap() += 1;
            });
            Ok(StreamSession::new(token, connected, task))
        }
    }

    fn conn() -> ConnectionInfo {
        ConnectionInfo::from_url("postgres://u:p@localhost/app").unwrap()
    }

    #[tokio::test]
    async fn test_read_range_stops_at_end_and_filters() {
        let reader = ScriptedReader::new(vec![
            StreamMessage::Event(event("public", "orders", LogPosition::Lsn(10))),
            StreamMessage::Error(BackupError::Transient("hiccup".into())),
            StreamMessage::Event(event("public", "audit", LogPosition::Lsn(20))),
            StreamMessage::Event(event("public", "orders", LogPosition::Lsn(30))),
            StreamMessage::Event(event("public", "orders", LogPosition::Lsn(40))),
        ]);
        let filter = EventFilter::all().with_tables(["orders"]);
        let events = reader
            .read_range(&conn(), &LogPosition::Lsn(10), &LogPosition::Lsn(30), &filter, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].position, LogPosition::Lsn(10));
        assert_eq!(*reader.sessions_closed.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_read_range_completes_on_progress() {
        let reader = ScriptedReader::new(vec![
            StreamMessage::Event(event("public", "orders", LogPosition::Lsn(10))),
            StreamMessage::Progress(LogPosition::Lsn(50)),
        ]);
        let events = reader
            .read_range(&conn(), &LogPosition::Lsn(5), &LogPosition::Lsn(50), &EventFilter::all(), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(events.len(), 1);
    }

    #[tokio::test]
    async fn test_read_range_times_out_and_closes_session() {
        let reader = ScriptedReader::new(vec![StreamMessage::Event(event(
            "public",
            "orders",
            LogPosition::Lsn(10),
        ))]);
        let err = reader
            .read_range(&conn(), &LogPosition::Lsn(5), &LogPosition::Lsn(99), &EventFilter::all(), Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, BackupError::Timeout { .. }));
        assert_eq!(*reader.sessions_closed.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_read_range_fails_on_undecodable_change() {
        let reader = ScriptedReader::new(vec![
            StreamMessage::Event(event("public", "orders", LogPosition::Lsn(10))),
            StreamMessage::Error(BackupError::ChainIntegrity("cannot decode change at 0/14".into())),
            StreamMessage::Progress(LogPosition::Lsn(50)),
        ]);
        let err = reader
            .read_range(&conn(), &LogPosition::Lsn(5), &LogPosition::Lsn(50), &EventFilter::all(), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, BackupError::ChainIntegrity(ref m) if m.contains("0/14")));
        assert_eq!(*reader.sessions_closed.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_empty_range_does_not_open_a_session() {
        let reader = ScriptedReader::new(Vec::new());
        let events = reader
            .read_range(&conn(), &LogPosition::Lsn(7), &LogPosition::Lsn(7), &EventFilter::all(), Duration::from_millis(10))
            .await
            .unwrap();
        assert!(events.is_empty());
        assert_eq!(*reader.sessions_closed.lock().unwrap(), 0);
    }
}
