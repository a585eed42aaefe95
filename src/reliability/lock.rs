use async_trait::async_trait;
use sha2::{Digest, Sha256};
use sqlx::{Connection, PgConnection};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::OwnedMutexGuard;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::errors::{BackupError, Result};

/// Lock key shared by backups and restores of the same task.
pub fn task_lock_key(datasource_type: &str, task_id: i64) -> String {
    format!("backup:{}:{}", datasource_type, task_id)
}

/// Proof of holding a named lock. Dropping a lease without calling
/// [`LockManager::release`] still frees the lock: the local guard unlocks on drop and
/// the advisory lock dies with its session.
pub struct LockLease {
    key: String,
    inner: LeaseInner,
}

enum LeaseInner {
    Local(#[allow(dead_code)] OwnedMutexGuard<()>),
    Advisory { lock_id: i64, conn: PgConnection },
}

impl LockLease {
    pub fn key(&self) -> &str {
        &self.key
    }
}

#[async_trait]
pub trait LockManager: Send + Sync {
    /// Waits at most the manager's configured bound, then fails with
    /// `LockUnavailable`.
    async fn acquire(&self, key: &str) -> Result<LockLease>;

    async fn release(&self, lease: LockLease) -> Result<()>;
}

/// Runs `body` while holding `key`, releasing the lock on every exit path.
pub async fn with_lock<T, F, Fut>(locks: &dyn LockManager, key: &str, body: F) -> Result<T>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let lease = locks.acquire(key).await?;
    debug!(key, "Lock acquired");
    let result = body().await;
    if let Err(e) = locks.release(lease).await {
        warn!(key, error = %e, "Failed to release lock");
    }
    result
}

/// In-process keyed mutex. Sufficient for a single instance; use
/// [`PgAdvisoryLockManager`] when several instances share the same tasks.
pub struct LocalLockManager {
    wait: Duration,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl LocalLockManager {
    pub fn new(wait: Duration) -> Self {
        Self {
            wait,
            locks: Mutex::new(HashMap::new()),
        }
    }

    fn slot(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Forgets `key` once no lease or waiter references its mutex.
    fn prune(&self, key: &str) {
        let mut locks = self.locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if locks.get(key).is_some_and(|slot| Arc::strong_count(slot) == 1) {
            locks.remove(key);
        }
    }

    #[cfg(test)]
    fn tracked_keys(&self) -> usize {
        self.locks.lock().map(|locks| locks.len()).unwrap_or(0)
    }
}

#[async_trait]
impl LockManager for LocalLockManager {
    async fn acquire(&self, key: &str) -> Result<LockLease> {
        let slot = self.slot(key);
        match tokio::time::timeout(self.wait, slot.lock_owned()).await {
            Ok(guard) => Ok(LockLease {
                key: key.to_string(),
                inner: LeaseInner::Local(guard),
            }),
            Err(_) => {
                self.prune(key);
                Err(BackupError::LockUnavailable {
                    key: key.to_string(),
                    waited: self.wait,
                })
            }
        }
    }

    async fn release(&self, lease: LockLease) -> Result<()> {
        let key = lease.key;
        drop(lease.inner);
        self.prune(&key);
        Ok(())
    }
}

/// Session-level PostgreSQL advisory lock, held on a dedicated connection so the lock
/// is released by the server if this process dies.
pub struct PgAdvisoryLockManager {
    database_url: String,
    wait: Duration,
    poll_interval: Duration,
}

impl PgAdvisoryLockManager {
    pub fn new(database_url: impl Into<String>, wait: Duration) -> Self {
        Self {
            database_url: database_url.into(),
            wait,
            poll_interval: Duration::from_millis(250),
        }
    }
}

/// Stable 64-bit advisory lock id for a textual key.
pub fn advisory_lock_id(key: &str) -> i64 {
    let digest = Sha256::digest(key.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    i64::from_be_bytes(bytes)
}

#[async_trait]
impl LockManager for PgAdvisoryLockManager {
    async fn acquire(&self, key: &str) -> Result<LockLease> {
        let lock_id = advisory_lock_id(key);
        let deadline = Instant::now() + self.wait;
        let mut conn = match tokio::time::timeout_at(deadline, PgConnection::connect(&self.database_url)).await {
            Ok(conn) => conn?,
            Err(_) => {
                return Err(BackupError::LockUnavailable {
                    key: key.to_string(),
                    waited: self.wait,
                });
            }
        };
        loop {
            let acquired: bool = sqlx::query_scalar("SELECT pg_try_advisory_lock($1)")
                .bind(lock_id)
                .fetch_one(&mut conn)
                .await?;
            if acquired {
                return Ok(LockLease {
                    key: key.to_string(),
                    inner: LeaseInner::Advisory { lock_id, conn },
                });
            }
            if Instant::now() + self.poll_interval > deadline {
                let _ = conn.close().await;
                return Err(BackupError::LockUnavailable {
                    key: key.to_string(),
                    waited: self.wait,
                });
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    async fn release(&self, lease: LockLease) -> Result<()> {
        match lease.inner {
            LeaseInner::Advisory { lock_id, mut conn } => {
                let released: bool = sqlx::query_scalar("SELECT pg_advisory_unlock($1)")
                    .bind(lock_id)
                    .fetch_one(&mut conn)
                    .await?;
                if !released {
                    warn!(key = %lease.key, "Advisory lock was not held at release");
                }
                conn.close().await?;
                Ok(())
            }
            LeaseInner::Local(_) => Err(BackupError::InvalidState(format!(
                "lease {} was not issued by the advisory lock manager",
                lease.key
            ))),
        }
    }
}
