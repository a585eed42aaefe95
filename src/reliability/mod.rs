//! Locking, retry and checksum collaborators used by the backup pipeline and the
//! restore orchestrator.

pub mod checksum;
pub mod lock;
pub mod retry;

pub use checksum::ChecksumService;
pub use lock::{LocalLockManager, LockManager, PgAdvisoryLockManager, task_lock_key, with_lock};
pub use retry::RetryPolicy;
