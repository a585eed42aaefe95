//! Fan-out storage across several named replicas.
//!
//! An upload goes to every replica in parallel and succeeds when at least one copy
//! lands. The recorded location lists each copy as `replicated:name=location&...`
//! (form-encoded), so reads fall back replica by replica.

use async_trait::async_trait;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::task::JoinSet;
use tracing::{info, warn};
use url::form_urlencoded;

use super::StorageProvider;
use crate::errors::{BackupError, Result};

const SCHEME: &str = "replicated:";

/// Share of replicas that must hold a copy for an upload to count as fully replicated.
pub const REPLICA_QUORUM: f64 = 0.5;

pub struct Replica {
    pub name: String,
    pub provider: Arc<dyn StorageProvider>,
}

impl Replica {
    pub fn new(name: impl Into<String>, provider: Arc<dyn StorageProvider>) -> Self {
        Self {
            name: name.into(),
            provider,
        }
    }
}

/// Replica outcomes, either of one upload or accumulated over the process lifetime.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReplicaStats {
    pub total: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub bytes: u64,
    pub success_rate: f64,
}

impl ReplicaStats {
    fn new(total: u64, succeeded: u64, bytes: u64) -> Self {
        Self {
            total,
            succeeded,
            failed: total - succeeded,
            bytes,
            success_rate: if total == 0 { 0.0 } else { succeeded as f64 / total as f64 },
        }
    }

    /// At least half of the replicas hold a copy. An empty result never does.
    pub fn meets_quorum(&self) -> bool {
        self.total > 0 && self.success_rate >= REPLICA_QUORUM
    }
}

#[derive(Default)]
struct Counters {
    total: AtomicU64,
    succeeded: AtomicU64,
    bytes: AtomicU64,
}

pub struct ReplicatedStorage {
    replicas: Vec<Replica>,
    counters: Counters,
}

impl ReplicatedStorage {
    pub fn new(replicas: Vec<Replica>) -> Result<Self> {
        if replicas.is_empty() {
            return Err(BackupError::Config("replicated storage needs at least one replica".into()));
        }
        for (i, replica) in replicas.iter().enumerate() {
            if replica.name.is_empty() || replicas[..i].iter().any(|r| r.name == replica.name) {
                return Err(BackupError::Config(format!(
                    "replica names must be unique and non-empty: {:?}",
                    replica.name
                )));
            }
        }
        Ok(Self {
            replicas,
            counters: Counters::default(),
        })
    }

    pub fn replica_names(&self) -> impl Iterator<Item = &str> {
        self.replicas.iter().map(|r| r.name.as_str())
    }

    /// Totals over every replica upload made by this instance.
    pub fn stats(&self) -> ReplicaStats {
        ReplicaStats::new(
            self.counters.total.load(Ordering::Relaxed),
            self.counters.succeeded.load(Ordering::Relaxed),
            self.counters.bytes.load(Ordering::Relaxed),
        )
    }

    fn replica(&self, name: &str) -> Result<&Replica> {
        self.replicas
            .iter()
            .find(|r| r.name == name)
            .ok_or_else(|| BackupError::Storage(format!("unknown storage replica {}", name)))
    }

    /// Copies listed in `location`, in upload order. A plain location (written before
    /// replication was enabled) is offered to every replica.
    fn copies(&self, location: &str) -> Vec<(String, String)> {
        match location.strip_prefix(SCHEME) {
            Some(encoded) => form_urlencoded::parse(encoded.as_bytes())
                .map(|(name, copy)| (name.into_owned(), copy.into_owned()))
                .collect(),
            None => self
                .replicas
                .iter()
                .map(|r| (r.name.clone(), location.to_string()))
                .collect(),
        }
    }
}

pub fn encode_location<'a>(copies: impl IntoIterator<Item = (&'a str, &'a str)>) -> String {
    let mut serializer = form_urlencoded::Serializer::new(String::new());
    for (name, location) in copies {
        serializer.append_pair(name, location);
    }
    format!("{}{}", SCHEME, serializer.finish())
}

#[async_trait]
impl StorageProvider for ReplicatedStorage {
    async fn upload(&self, local_path: &Path, key: &str) -> Result<String> {
        let bytes = tokio::fs::metadata(local_path).await.map(|m| m.len()).unwrap_or(0);
        let mut set = JoinSet::new();
        for (index, replica) in self.replicas.iter().enumerate() {
            let provider = Arc::clone(&replica.provider);
            let local_path = local_path.to_path_buf();
            let key = key.to_string();
            set.spawn(async move { (index, provider.upload(&local_path, &key).await) });
        }

        let mut results: Vec<(usize, Result<String>)> = Vec::with_capacity(self.replicas.len());
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(result) => results.push(result),
                Err(e) => warn!(key, error = %e, "Replica upload task did not complete"),
            }
        }
        results.sort_by_key(|(index, _)| *index);

        let mut copies = Vec::new();
        let mut failures = Vec::new();
        for (index, result) in results {
            let name = self.replicas[index].name.as_str();
            match result {
                Ok(location) => copies.push((name, location)),
                Err(e) => {
                    warn!(replica = name, key, error = %e, "Replica upload failed");
                    failures.push(format!("{}: {}", name, e));
                }
            }
        }

        let outcome = ReplicaStats::new(
            self.replicas.len() as u64,
            copies.len() as u64,
            bytes * copies.len() as u64,
        );
        self.counters.total.fetch_add(outcome.total, Ordering::Relaxed);
        self.counters.succeeded.fetch_add(outcome.succeeded, Ordering::Relaxed);
        self.counters.bytes.fetch_add(outcome.bytes, Ordering::Relaxed);

        if copies.is_empty() {
            return Err(BackupError::Storage(format!(
                "upload of {} failed on every replica: {}",
                key,
                failures.join("; ")
            )));
        }
        if outcome.meets_quorum() {
            info!(key, stored = outcome.succeeded, replicas = outcome.total, "Stored artifact on replicas");
        } else {
            warn!(
                key,
                stored = outcome.succeeded,
                replicas = outcome.total,
                "Artifact is stored on fewer than half of the replicas"
            );
        }
        Ok(encode_location(copies.iter().map(|(name, location)| (*name, location.as_str()))))
    }

    async fn download(&self, location: &str, destination: &Path) -> Result<PathBuf> {
        let mut failures = Vec::new();
        for (name, copy) in self.copies(location) {
            let attempt = match self.replica(&name) {
                Ok(replica) => replica.provider.download(&copy, destination).await,
                Err(e) => Err(e),
            };
            match attempt {
                Ok(path) => return Ok(path),
                Err(e) => {
                    warn!(replica = %name, error = %e, "Replica download failed, trying the next copy");
                    failures.push(format!("{}: {}", name, e));
                }
            }
        }
        if failures.is_empty() {
            return Err(BackupError::NotFound(format!("no replica copies listed in {}", location)));
        }
        Err(BackupError::Storage(format!(
            "no replica could serve {}: {}",
            location,
            failures.join("; ")
        )))
    }

    /// Deletes every listed copy, then reports the copies that could not be removed.
    async fn delete(&self, location: &str) -> Result<()> {
        let plain = !location.starts_with(SCHEME);
        let mut failures = Vec::new();
        for (name, copy) in self.copies(location) {
            let outcome = match self.replica(&name) {
                Ok(replica) => replica.provider.delete(&copy).await,
                Err(e) => Err(e),
            };
            if let Err(e) = outcome {
                // a plain location belongs to exactly one backend; the others reject it
                if !plain {
                    failures.push(format!("{}: {}", name, e));
                }
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(BackupError::Storage(format!(
                "could not delete every copy of {}: {}",
                location,
                failures.join("; ")
            )))
        }
    }
}
