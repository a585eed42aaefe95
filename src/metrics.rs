//! In-process counters for backup and restore runs.

use serde::Serialize;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

#[derive(Debug, Default)]
pub struct OperationMetrics {
    backup_total: AtomicU64,
    backup_success: AtomicU64,
    backup_failure: AtomicU64,
    backup_duration_ms: AtomicU64,
    restore_total: AtomicU64,
    restore_success: AtomicU64,
    restore_failure: AtomicU64,
    restore_duration_ms: AtomicU64,
    active_backups: AtomicI64,
    active_restores: AtomicI64,
    retries: AtomicU64,
    bytes_uploaded: AtomicU64,
}

/// A point-in-time copy of [`OperationMetrics`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub backup_total: u64,
    pub backup_success: u64,
    pub backup_failure: u64,
    pub backup_duration_ms: u64,
    pub restore_total: u64,
    pub restore_success: u64,
    pub restore_failure: u64,
    pub restore_duration_ms: u64,
    pub active_backups: i64,
    pub active_restores: i64,
    pub retries: u64,
    pub bytes_uploaded: u64,
    /// Fraction of started backups that succeeded, 0 when none started.
    pub backup_success_rate: f64,
    pub restore_success_rate: f64,
}

impl OperationMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn backup_started(&self) {
        self.backup_total.fetch_add(1, Ordering::Relaxed);
        self.active_backups.fetch_add(1, Ordering::Relaxed);
    }

    pub fn backup_finished(&self, success: bool, elapsed: Duration) {
        self.active_backups.fetch_sub(1, Ordering::Relaxed);
        let counter = if success { &self.backup_success } else { &self.backup_failure };
        counter.fetch_add(1, Ordering::Relaxed);
        self.backup_duration_ms.fetch_add(millis(elapsed), Ordering::Relaxed);
    }

    pub fn restore_started(&self) {
        self.restore_total.fetch_add(1, Ordering::Relaxed);
        self.active_restores.fetch_add(1, Ordering::Relaxed);
    }

    pub fn restore_finished(&self, success: bool, elapsed: Duration) {
        self.active_restores.fetch_sub(1, Ordering::Relaxed);
        let counter = if success { &self.restore_success } else { &self.restore_failure };
        counter.fetch_add(1, Ordering::Relaxed);
        self.restore_duration_ms.fetch_add(millis(elapsed), Ordering::Relaxed);
    }

    pub fn retried(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn uploaded(&self, bytes: u64) {
        self.bytes_uploaded.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let backup_total = self.backup_total.load(Ordering::Relaxed);
        let backup_success = self.backup_success.load(Ordering::Relaxed);
        let restore_total = self.restore_total.load(Ordering::Relaxed);
        let restore_success = self.restore_success.load(Ordering::Relaxed);
        MetricsSnapshot {
            backup_total,
            backup_success,
            backup_failure: self.backup_failure.load(Ordering::Relaxed),
            backup_duration_ms: self.backup_duration_ms.load(Ordering::Relaxed),
            restore_total,
            restore_success,
            restore_failure: self.restore_failure.load(Ordering::Relaxed),
            restore_duration_ms: self.restore_duration_ms.load(Ordering::Relaxed),
            active_backups: self.active_backups.load(Ordering::Relaxed),
            active_restores: self.active_restores.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            bytes_uploaded: self.bytes_uploaded.load(Ordering::Relaxed),
            backup_success_rate: rate(backup_success, backup_total),
            restore_success_rate: rate(restore_success, restore_total),
        }
    }
}

fn millis(elapsed: Duration) -> u64 {
    u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX)
}

fn rate(part: u64, total: u64) -> f64 {
    if total == 0 { 0.0 } else { part as f64 / total as f64 }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_and_gauges() {
        let metrics = OperationMetrics::new();
        metrics.backup_started();
        metrics.backup_started();
        assert_eq!(metrics.snapshot().active_backups, 2);
        metrics.backup_finished(true, Duration::from_millis(40));
        metrics.backup_finished(false, Duration::from_millis(2));
        metrics.retried();
        metrics.uploaded(512);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.backup_total, 2);
        assert_eq!((snapshot.backup_success, snapshot.backup_failure), (1, 1));
        assert_eq!(snapshot.backup_duration_ms, 42);
        assert_eq!(snapshot.active_backups, 0);
        assert_eq!(snapshot.retries, 1);
        assert_eq!(snapshot.bytes_uploaded, 512);
        assert!((snapshot.backup_success_rate - 0.5).abs() < f64::EPSILON);
        assert_eq!(snapshot.restore_success_rate, 0.0);
    }

    #[test]
    fn test_snapshot_serializes() {
        let metrics = OperationMetrics::new();
        metrics.restore_started();
        metrics.restore_finished(true, Duration::from_secs(1));
        let json = serde_json::to_value(metrics.snapshot()).unwrap();
        assert_eq!(json["restore_success"], 1);
        assert_eq!(json["restore_duration_ms"], 1000);
    }
}
