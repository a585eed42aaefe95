use std::fmt;
use std::str::FromStr;

use crate::errors::BackupError;

/// A point in a database's replication or write-ahead log.
///
/// Positions are totally ordered: `Start` sorts before everything, binlog positions
/// order by file name then offset, LSNs numerically. The canonical text form
/// round-trips through [`FromStr`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum LogPosition {
    Start,
    Binlog { file: String, offset: u64 },
    Lsn(u64),
}

const START_TOKEN: &str = "start";

impl LogPosition {
    pub fn binlog(file: impl Into<String>, offset: u64) -> Self {
        LogPosition::Binlog {
            file: file.into(),
            offset,
        }
    }

    pub fn is_start(&self) -> bool {
        matches!(self, LogPosition::Start)
    }

    /// True when `self` is at or beyond `target` within the same log family.
    pub fn reached(&self, target: &LogPosition) -> bool {
        match (self, target) {
            (_, LogPosition::Start) => true,
            (LogPosition::Binlog { .. }, LogPosition::Binlog { .. })
            | (LogPosition::Lsn(_), LogPosition::Lsn(_)) => self >= target,
            _ => false,
        }
    }
}

impl fmt::Display for LogPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogPosition::Start => f.write_str(START_TOKEN),
            LogPosition::Binlog { file, offset } => write!(f, "{}:{}", file, offset),
            LogPosition::Lsn(lsn) => write!(f, "{:X}/{:X}", lsn >> 32, lsn & 0xFFFF_FFFF),
        }
    }
}

impl FromStr for LogPosition {
    type Err = BackupError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let token = s.trim();
        if token == START_TOKEN {
            return Ok(LogPosition::Start);
        }
        if let Some((file, offset)) = token.rsplit_once(':') {
            if file.is_empty() {
                return Err(BackupError::Parse(format!("binlog position without file: {}", s)));
            }
            let offset = offset
                .parse::<u64>()
                .map_err(|e| BackupError::Parse(format!("invalid binlog offset in {}: {}", s, e)))?;
            return Ok(LogPosition::binlog(file, offset));
        }
        if let Some((hi, lo)) = token.split_once('/') {
            let hi = u64::from_str_radix(hi, 16)
                .map_err(|e| BackupError::Parse(format!("invalid LSN {}: {}", s, e)))?;
            let lo = u64::from_str_radix(lo, 16)
                .map_err(|e| BackupError::Parse(format!("invalid LSN {}: {}", s, e)))?;
            if hi > 0xFFFF_FFFF || lo > 0xFFFF_FFFF {
                return Err(BackupError::Parse(format!("LSN out of range: {}", s)));
            }
            return Ok(LogPosition::Lsn((hi << 32) | lo));
        }
        Err(BackupError::Parse(format!("unrecognised log position: {:?}", s)))
    }
}
