use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Mutex;

use super::AuditStore;
use crate::errors::{BackupError, Result};
use crate::model::{BackupKind, BackupRecord, RestoreRecord, RunStatus};

#[derive(Default)]
struct State {
    next_backup_id: i64,
    next_restore_id: i64,
    backups: BTreeMap<i64, BackupRecord>,
    restores: BTreeMap<i64, RestoreRecord>,
}

/// Audit store kept in process memory. Used by tests and by single-shot CLI runs
/// that do not configure a database.
#[derive(Default)]
pub struct MemoryAuditStore {
    state: Mutex<State>,
}

impl MemoryAuditStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a record with a caller-chosen id, keeping future ids above it.
    pub fn seed_backup(&self, record: BackupRecord) {
        let mut state = self.lock();
        state.next_backup_id = state.next_backup_id.max(record.id);
        state.backups.insert(record.id, record);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn sorted(mut records: Vec<BackupRecord>) -> Vec<BackupRecord> {
    records.sort_by(|a, b| a.started_at.cmp(&b.started_at).then(a.id.cmp(&b.id)));
    records
}

#[async_trait]
impl AuditStore for MemoryAuditStore {
    async fn insert_backup(&self, record: &BackupRecord) -> Result<i64> {
        let mut state = self.lock();
        state.next_backup_id += 1;
        let id = state.next_backup_id;
        let mut stored = record.clone();
        stored.id = id;
        state.backups.insert(id, stored);
        Ok(id)
    }

    async fn update_backup(&self, record: &BackupRecord) -> Result<()> {
        let mut state = self.lock();
        match state.backups.get_mut(&record.id) {
            Some(existing) => {
                *existing = record.clone();
                Ok(())
            }
            None => Err(BackupError::NotFound(format!("backup record {}", record.id))),
        }
    }

    async fn get_backup(&self, id: i64) -> Result<Option<BackupRecord>> {
        Ok(self.lock().backups.get(&id).cloned())
    }

    async fn backups_by_task(&self, task_id: i64) -> Result<Vec<BackupRecord>> {
        let state = self.lock();
        Ok(sorted(
            state.backups.values().filter(|r| r.task_id == task_id).cloned().collect(),
        ))
    }

    async fn backups_in_range(
        &self,
        task_id: i64,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<BackupRecord>> {
        let state = self.lock();
        Ok(sorted(
            state
                .backups
                .values()
                .filter(|r| r.task_id == task_id && r.started_at >= from && r.started_at <= to)
                .cloned()
                .collect(),
        ))
    }

    async fn latest_full_backup(&self, task_id: i64) -> Result<Option<BackupRecord>> {
        let successes = self.success_backups(task_id).await?;
        Ok(successes.into_iter().filter(|r| r.kind == BackupKind::Full).last())
    }

    async fn success_backups(&self, task_id: i64) -> Result<Vec<BackupRecord>> {
        let state = self.lock();
        Ok(sorted(
            state
                .backups
                .values()
                .filter(|r| r.task_id == task_id && r.is_success() && r.retired_at.is_none())
                .cloned()
                .collect(),
        ))
    }

    async fn mark_retired(&self, ids: &[i64], at: DateTime<Utc>) -> Result<u64> {
        let mut state = self.lock();
        let mut changed = 0;
        for id in ids {
            if let Some(record) = state.backups.get_mut(id) {
                if record.retired_at.is_none() {
                    record.retired_at = Some(at);
                    changed += 1;
                }
            }
        }
        Ok(changed)
    }

    async fn insert_restore(&self, record: &RestoreRecord) -> Result<i64> {
        let mut state = self.lock();
        state.next_restore_id += 1;
        let id = state.next_restore_id;
        let mut stored = record.clone();
        stored.id = id;
        state.restores.insert(id, stored);
        Ok(id)
    }

    async fn update_restore(&self, record: &RestoreRecord) -> Result<()> {
        let mut state = self.lock();
        match state.restores.get_mut(&record.id) {
            Some(existing) => {
                *existing = record.clone();
                Ok(())
            }
            None => Err(BackupError::NotFound(format!("restore record {}", record.id))),
        }
    }

    async fn get_restore(&self, id: i64) -> Result<Option<RestoreRecord>> {
        Ok(self.lock().restores.get(&id).cloned())
    }

    async fn latest_pitr(&self, task_id: i64) -> Result<Option<RestoreRecord>> {
        let state = self.lock();
        Ok(state
            .restores
            .values()
            .filter(|r| r.task_id == task_id && r.is_pitr())
            .max_by(|a, b| a.started_at.cmp(&b.started_at).then(a.id.cmp(&b.id)))
            .cloned())
    }

    async fn count_restores(
        &self,
        task_id: i64,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        status: Option<RunStatus>,
    ) -> Result<i64> {
        let state = self.lock();
        Ok(state
            .restores
            .values()
            .filter(|r| r.task_id == task_id && r.started_at >= from && r.started_at <= to)
            .filter(|r| status.is_none_or(|s| r.status == s))
            .count() as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, hour, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn test_insert_assigns_ids_and_update_persists() {
        let store = MemoryAuditStore::new();
        let mut record = BackupRecord::running(42, "mysql", BackupKind::Full, None, at(0));
        record.id = store.insert_backup(&record).await.unwrap();
        assert_eq!(record.id, 1);

        record.mark_failed("exit 2", at(1)).unwrap();
        store.update_backup(&record).await.unwrap();
        let loaded = store.get_backup(1).await.unwrap().unwrap();
        assert_eq!(loaded.status, RunStatus::Failed);
        assert!(store.success_backups(42).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_update_of_unknown_record_fails() {
        let store = MemoryAuditStore::new();
        let mut record = BackupRecord::running(1, "mysql", BackupKind::Full, None, at(0));
        record.id = 99;
        assert!(matches!(store.update_backup(&record).await, Err(BackupError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_success_queries_skip_retired_records() {
        let store = MemoryAuditStore::new();
        for (id, hour) in [(1, 0), (2, 5)] {
            let mut record = BackupRecord::running(7, "postgres", BackupKind::Full, None, at(hour));
            record.id = id;
            record.status = RunStatus::Success;
            store.seed_backup(record);
        }
        assert_eq!(store.latest_full_backup(7).await.unwrap().unwrap().id, 2);
        assert_eq!(store.mark_retired(&[2, 2, 3], at(6)).await.unwrap(), 1);
        assert_eq!(store.latest_full_backup(7).await.unwrap().unwrap().id, 1);
        assert_eq!(store.backups_by_task(7).await.unwrap().len(), 2);
        assert_eq!(store.backups_in_range(7, at(1), at(6)).await.unwrap().len(), 1);

        let next = BackupRecord::running(7, "postgres", BackupKind::Full, None, at(7));
        assert_eq!(store.insert_backup(&next).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_restore_counts_and_latest_pitr() {
        let store = MemoryAuditStore::new();
        let mut pitr = RestoreRecord::running(7, None, Some(at(3)), "ops", None, at(4));
        pitr.id = store.insert_restore(&pitr).await.unwrap();
        pitr.finish(true, None, at(4) + Duration::seconds(30)).unwrap();
        store.update_restore(&pitr).await.unwrap();

        let mut direct = RestoreRecord::running(7, Some(1), None, "ops", None, at(5));
        direct.id = store.insert_restore(&direct).await.unwrap();
        direct.finish(false, Some("exit 1".into()), at(5)).unwrap();
        store.update_restore(&direct).await.unwrap();

        assert_eq!(store.latest_pitr(7).await.unwrap().unwrap().id, pitr.id);
        assert_eq!(store.count_restores(7, at(0), at(6), None).await.unwrap(), 2);
        assert_eq!(store.count_restores(7, at(0), at(6), Some(RunStatus::Failed)).await.unwrap(), 1);
        assert_eq!(store.count_restores(8, at(0), at(6), None).await.unwrap(), 0);
    }
}
