pub mod compress;
pub mod executor;
pub mod mysql;
pub mod pipeline;
pub mod postgres;

pub use executor::{Artifact, BackupExecutor, BackupRequest, ExecutorRegistry};
pub use mysql::MySqlBackupExecutor;
pub use pipeline::BackupPipeline;
pub use postgres::PostgresBackupExecutor;
