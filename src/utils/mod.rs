pub mod process;
pub mod setting;

use std::path::PathBuf;
use which::which;

use crate::errors::{BackupError, Result};

/// Finds a client tool (`mysqldump`, `pg_dump`, `psql`, ...) in the system PATH.
pub fn find_executable(tool: &str) -> Result<PathBuf> {
    which(tool).map_err(|_| {
        BackupError::tool_failure(
            tool,
            None,
            format!(
                "{} executable not found in PATH. Please ensure the database client tools are installed and in your PATH.",
                tool
            ),
        )
    })
}

/// Quotes an identifier for interpolation into SQL text.
pub fn quote_ident(datasource_type: &str, name: &str) -> String {
    match datasource_type {
        "mysql" => format!("`{}`", name.replace('`', "``")),
        _ => format!("\"{}\"", name.replace('"', "\"\"")),
    }
}
