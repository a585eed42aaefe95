//! Incremental chains: one full backup plus the incrementals captured on top of it.
//!
//! Chains are derived from the audit history on every call and never persisted.

use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tracing::{info, warn};

use crate::audit::AuditStore;
use crate::errors::Result;
use crate::model::{BackupKind, BackupRecord, LogPosition, RunStatus};
use crate::storage::StorageProvider;

#[derive(Debug, Clone, PartialEq)]
pub struct IncrementalChain {
    pub chain_id: String,
    pub full_backup: BackupRecord,
    /// Ascending by `started_at`, ties broken by id.
    pub incrementals: Vec<BackupRecord>,
    pub total_size_bytes: i64,
    pub integrity_broken: bool,
}

impl IncrementalChain {
    pub fn new(full_backup: BackupRecord, mut incrementals: Vec<BackupRecord>) -> Self {
        incrementals.sort_by(|a, b| a.started_at.cmp(&b.started_at).then(a.id.cmp(&b.id)));
        let total_size_bytes = full_backup.file_size_bytes.unwrap_or(0)
            + incrementals
                .iter()
                .map(|r| r.file_size_bytes.unwrap_or(0))
                .sum::<i64>();
        let mut chain = Self {
            chain_id: chain_id(full_backup.task_id, full_backup.id),
            full_backup,
            incrementals,
            total_size_bytes,
            integrity_broken: false,
        };
        chain.integrity_broken = !link_issues(&chain).errors.is_empty();
        chain
    }

    /// Full backup first, then incrementals in order.
    pub fn members(&self) -> impl Iterator<Item = &BackupRecord> {
        std::iter::once(&self.full_backup).chain(self.incrementals.iter())
    }

    pub fn newest_member(&self) -> &BackupRecord {
        self.incrementals.last().unwrap_or(&self.full_backup)
    }

    /// Newest member that started at or before `t`.
    fn newest_member_before(&self, t: DateTime<Utc>) -> Option<&BackupRecord> {
        self.members().filter(|r| r.started_at <= t).last()
    }
}

pub fn chain_id(task_id: i64, full_id: i64) -> String {
    format!("chain-{}-{}", task_id, full_id)
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChainValidation {
    pub valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CleanupReport {
    pub expired_chains: Vec<String>,
    pub retired_ids: Vec<i64>,
    pub deleted_locations: Vec<String>,
    /// `(location, error)` for artifacts storage refused to delete.
    pub failed_deletions: Vec<(String, String)>,
}

#[derive(Default)]
struct Issues {
    errors: Vec<String>,
    warnings: Vec<String>,
}

fn parse_position(record: &BackupRecord, token: &Option<String>, which: &str, issues: &mut Issues) -> Option<LogPosition> {
    match token {
        None => {
            issues.errors.push(format!("backup {} has no {} position", record.id, which));
            None
        }
        Some(raw) => match raw.parse() {
            Ok(position) => Some(position),
            Err(e) => {
                issues
                    .errors
                    .push(format!("backup {} has an unreadable {} position: {}", record.id, which, e));
                None
            }
        },
    }
}

/// Adjacency of log ranges: every predecessor's end must equal its successor's start.
fn link_issues(chain: &IncrementalChain) -> Issues {
    let mut issues = Issues::default();
    let full = &chain.full_backup;
    let mut previous_end: Option<LogPosition> = match &full.log_range_end {
        None => {
            if !chain.incrementals.is_empty() {
                issues.warnings.push(format!(
                    "full backup {} has no recorded end position; its link to the first incremental is unchecked",
                    full.id
                ));
            }
            None
        }
        Some(_) => parse_position(full, &full.log_range_end, "end", &mut issues),
    };
    let mut previous_id = full.id;
    let mut check_link = full.log_range_end.is_some();

    for inc in &chain.incrementals {
        let start = parse_position(inc, &inc.log_range_start, "start", &mut issues);
        let end = parse_position(inc, &inc.log_range_end, "end", &mut issues);
        if check_link {
            if let (Some(prev), Some(start)) = (&previous_end, &start) {
                if prev != start {
                    issues.errors.push(format!(
                        "gap between backup {} (ends at {}) and backup {} (starts at {})",
                        previous_id, prev, inc.id, start
                    ));
                }
            }
        }
        previous_end = end;
        previous_id = inc.id;
        check_link = true;
    }
    issues
}

/// `t` is restorable from a chain once its full backup had started.
pub fn can_restore_to(chain: &IncrementalChain, t: DateTime<Utc>) -> bool {
    t >= chain.full_backup.started_at
}

/// The full backup plus every incremental started at or before `t`, in apply order.
pub fn get_backups_to_restore(chain: &IncrementalChain, t: DateTime<Utc>) -> Vec<BackupRecord> {
    chain.members().filter(|r| r.started_at <= t).cloned().collect()
}

pub fn validate_chain(chain: &IncrementalChain) -> ChainValidation {
    let mut errors = Vec::new();
    let mut warnings = Vec::new();
    let full = &chain.full_backup;
    if full.kind != BackupKind::Full {
        errors.push(format!("backup {} heading the chain is not a full backup", full.id));
    }
    if full.status != RunStatus::Success {
        errors.push(format!("full backup {} is {}", full.id, full.status));
    }
    if chain.incrementals.is_empty() {
        warnings.push("chain has no incremental backups".to_string());
    }
    for inc in &chain.incrementals {
        if inc.status != RunStatus::Success {
            errors.push(format!("incremental backup {} is {}", inc.id, inc.status));
        }
        if inc.base_full_id != Some(full.id) {
            errors.push(format!(
                "incremental backup {} is based on {:?}, not full backup {}",
                inc.id, inc.base_full_id, full.id
            ));
        }
    }
    let links = link_issues(chain);
    warnings.extend(links.warnings);
    if chain.integrity_broken || !links.errors.is_empty() {
        errors.push("chain integrity is broken".to_string());
        errors.extend(links.errors);
    }
    ChainValidation {
        valid: errors.is_empty(),
        errors,
        warnings,
    }
}

pub struct IncrementalChainManager {
    audit: Arc<dyn AuditStore>,
    storage: Arc<dyn StorageProvider>,
}

impl IncrementalChainManager {
    pub fn new(audit: Arc<dyn AuditStore>, storage: Arc<dyn StorageProvider>) -> Self {
        Self { audit, storage }
    }

    /// Every chain of a task, oldest full first.
    pub async fn build_all_chains(&self, task_id: i64) -> Result<Vec<IncrementalChain>> {
        let records = self.audit.success_backups(task_id).await?;
        let (fulls, incrementals): (Vec<_>, Vec<_>) = records.into_iter().partition(|r| r.is_full());
        let mut chains = Vec::with_capacity(fulls.len());
        for full in fulls {
            let members = incrementals
                .iter()
                .filter(|r| r.base_full_id == Some(full.id))
                .cloned()
                .collect();
            chains.push(IncrementalChain::new(full, members));
        }
        let orphans = incrementals
            .iter()
            .filter(|r| !chains.iter().any(|c| Some(c.full_backup.id) == r.base_full_id))
            .count();
        if orphans > 0 {
            warn!(task_id, orphans, "Incremental backups without a live full backup");
        }
        Ok(chains)
    }

    /// The chain headed by the earliest live successful full backup.
    pub async fn build_chain(&self, task_id: i64) -> Result<Option<IncrementalChain>> {
        Ok(self.build_all_chains(task_id).await?.into_iter().next())
    }

    /// The chain that reaches furthest towards `t` without passing it. Falls back to
    /// [`Self::build_chain`] when no full backup started by `t`.
    pub async fn build_chain_to_time(&self, task_id: i64, t: DateTime<Utc>) -> Result<Option<IncrementalChain>> {
        let chains = self.build_all_chains(task_id).await?;
        let best = chains
            .iter()
            .filter_map(|chain| chain.newest_member_before(t).map(|m| (m.started_at, chain)))
            .max_by(|(a, x), (b, y)| a.cmp(b).then(x.full_backup.started_at.cmp(&y.full_backup.started_at)))
            .map(|(_, chain)| chain.clone());
        match best {
            Some(chain) => Ok(Some(chain)),
            None => Ok(chains.into_iter().next()),
        }
    }

    /// Retires chains whose newest member is older than the retention window, never the
    /// newest chain, and deletes their artifacts. Storage failures are reported, not fatal.
    pub async fn cleanup_expired_chains(&self, task_id: i64, retention_days: i64) -> Result<CleanupReport> {
        let now = Utc::now();
        let cutoff = now - Duration::days(retention_days);
        let chains = self.build_all_chains(task_id).await?;
        let newest = chains
            .iter()
            .max_by(|a, b| {
                a.full_backup
                    .started_at
                    .cmp(&b.full_backup.started_at)
                    .then(a.full_backup.id.cmp(&b.full_backup.id))
            })
            .map(|c| c.chain_id.clone());

        let mut report = CleanupReport::default();
        for chain in chains.iter().filter(|c| Some(&c.chain_id) != newest.as_ref()) {
            if chain.newest_member().started_at >= cutoff {
                continue;
            }
            let ids: Vec<i64> = chain.members().map(|r| r.id).collect();
            self.audit.mark_retired(&ids, now).await?;
            info!(task_id, chain = %chain.chain_id, members = ids.len(), "Retired expired chain");
            report.expired_chains.push(chain.chain_id.clone());
            report.retired_ids.extend(ids);

            for location in chain.members().filter_map(|r| r.storage_location.clone()) {
                match self.storage.delete(&location).await {
                    Ok(()) => report.deleted_locations.push(location),
                    Err(e) => {
                        warn!(%location, error = %e, "Failed to delete expired artifact");
                        report.failed_deletions.push((location, e.to_string()));
                    }
                }
            }
        }
        Ok(report)
    }
}
