use regex::Regex;

use super::EventKind;
use crate::errors::{BackupError, Result};

const NAME: &str = r#"((?:[`"]?[\w$]+[`"]?\.)?[`"]?[\w$]+[`"]?)"#;

/// What a SQL statement does and which table it names, if any.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatementInfo {
    pub kind: EventKind,
    pub database: Option<String>,
    pub table: Option<String>,
}

/// Recognises the statement kind and target table of SQL text found in change logs.
pub struct StatementClassifier {
    insert: Regex,
    update: Regex,
    delete: Regex,
    ddl: Regex,
    ddl_table: Regex,
}

fn compile(pattern: &str) -> Result<Regex> {
    Regex::new(pattern).map_err(|e| BackupError::Parse(format!("invalid statement pattern: {e}")))
}

impl StatementClassifier {
    pub fn new() -> Result<Self> {
        Ok(Self {
            insert: compile(&format!(
                r"(?is)^\s*(?:insert|replace)\s+(?:ignore\s+)?(?:into\s+)?{}",
                NAME
            ))?,
            update: compile(&format!(r"(?is)^\s*update\s+(?:ignore\s+)?{}", NAME))?,
            delete: compile(&format!(r"(?is)^\s*delete\s+from\s+{}", NAME))?,
            ddl: compile(r"(?is)^\s*(create|alter|drop|truncate|rename)\b")?,
            ddl_table: compile(&format!(
                r"(?is)^\s*(?:create|alter|drop|truncate|rename)\s+(?:temporary\s+)?table\s+(?:if\s+(?:not\s+)?exists\s+)?{}",
                NAME
            ))?,
        })
    }

    pub fn classify(&self, sql: &str) -> StatementInfo {
        let (kind, name) = if let Some(c) = self.insert.captures(sql) {
            (EventKind::Insert, c.get(1))
        } else if let Some(c) = self.update.captures(sql) {
            (EventKind::Update, c.get(1))
        } else if let Some(c) = self.delete.captures(sql) {
            (EventKind::Delete, c.get(1))
        } else if self.ddl.is_match(sql) {
            (EventKind::Ddl, self.ddl_table.captures(sql).and_then(|c| c.get(1)))
        } else {
            (EventKind::Query, None)
        };
        let (database, table) = match name {
            Some(m) => split_qualified(m.as_str()),
            None => (None, None),
        };
        StatementInfo { kind, database, table }
    }
}

/// Splits `` `db`.`t` `` or `"schema"."t"` into unquoted parts.
pub fn split_qualified(name: &str) -> (Option<String>, Option<String>) {
    let unquote = |s: &str| s.trim_matches(|c| c == '`' || c == '"').to_string();
    match name.split_once('.') {
        Some((db, table)) => (Some(unquote(db)), Some(unquote(table))),
        None => (None, Some(unquote(name))),
    }
}
