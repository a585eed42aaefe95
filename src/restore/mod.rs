pub mod orchestrator;
pub mod verification;

pub use orchestrator::{BackupRestoreRequest, PointRestoreRequest, RestoreOrchestrator};
