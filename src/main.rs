//! Point-in-time backup and restore tool
//!
//! Provides a CLI over the backup pipeline, the incremental chain manager and the
//! restore orchestrator.

mod audit;
mod backup;
mod chain;
mod changelog;
mod config;
mod errors;
mod metrics;
mod model;
mod reliability;
mod restore;
mod storage;
mod utils;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::env;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use audit::{AuditStore, MemoryAuditStore, PgAuditStore};
use backup::{BackupPipeline, BackupRequest, ExecutorRegistry, MySqlBackupExecutor, PostgresBackupExecutor};
use chain::{IncrementalChainManager, validate_chain};
use changelog::{BinlogReader, WalReader};
use config::{AppConfig, AuditBackend, LockBackend};
use metrics::OperationMetrics;
use model::{BackupKind, RunStatus};
use reliability::{LocalLockManager, LockManager, PgAdvisoryLockManager, RetryPolicy};
use restore::{BackupRestoreRequest, PointRestoreRequest, RestoreOrchestrator};
use storage::{ReplicatedStorage, StorageProvider, build_replicated, build_storage};
use utils::setting::check_db_connection;

const DEFAULT_CONFIG: &str = "config.json";
const DEFAULT_OPERATOR: &str = "cli";

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    dotenv::dotenv().ok();

    match run_app().await {
        Ok(()) => {
            info!("Operation completed successfully.");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("Error: {:?}", e);
            ExitCode::FAILURE
        }
    }
}

/// Everything the commands share, built once from the configuration.
struct Services {
    config: AppConfig,
    audit: Arc<dyn AuditStore>,
    storage: Arc<dyn StorageProvider>,
    replicas: Option<Arc<ReplicatedStorage>>,
    locks: Arc<dyn LockManager>,
    registry: ExecutorRegistry,
    metrics: Arc<OperationMetrics>,
}

impl Services {
    async fn build(config: AppConfig) -> Result<Self> {
        let audit: Arc<dyn AuditStore> = match &config.audit {
            AuditBackend::Memory => {
                warn!(
                    "Audit records are kept in memory and disappear when this process exits; \
                     incremental backups, chains and restores need audit.backend = postgres"
                );
                Arc::new(MemoryAuditStore::new())
            }
            AuditBackend::Postgres { database_url } => {
                let store = PgAuditStore::connect(database_url)
                    .await
                    .context("Failed to connect to the audit database")?;
                store.ensure_schema().await.context("Failed to prepare the audit schema")?;
                Arc::new(store)
            }
        };
        let wait = Duration::from_secs(config.lock.wait_timeout_secs);
        let locks: Arc<dyn LockManager> = match &config.lock.backend {
            LockBackend::Local => Arc::new(LocalLockManager::new(wait)),
            LockBackend::Postgres { database_url } => Arc::new(PgAdvisoryLockManager::new(database_url.clone(), wait)),
        };
        let replicas = build_replicated(&config.storage)
            .await
            .context("Failed to set up storage replicas")?;
        let storage: Arc<dyn StorageProvider> = match &replicas {
            Some(replicated) => replicated.clone(),
            None => build_storage(&config.storage)
                .await
                .context("Failed to set up backup storage")?,
        };

        let mut registry = ExecutorRegistry::new();
        registry.register(Arc::new(MySqlBackupExecutor::new(
            BinlogReader::new(config.log_dir.clone()),
            config.tools.clone(),
        )));
        registry.register(Arc::new(PostgresBackupExecutor::new(
            WalReader::new(config.postgres_slot.clone()),
            config.tools.clone(),
        )));

        Ok(Self {
            config,
            audit,
            storage,
            replicas,
            locks,
            registry,
            metrics: Arc::new(OperationMetrics::new()),
        })
    }

    fn pipeline(&self) -> BackupPipeline {
        BackupPipeline::new(
            self.registry.clone(),
            self.locks.clone(),
            RetryPolicy::from_config(&self.config.retry),
            self.storage.clone(),
            self.audit.clone(),
        )
        .with_compression(self.config.compress_artifacts)
        .with_metrics(self.metrics.clone())
    }

    fn orchestrator(&self) -> RestoreOrchestrator {
        RestoreOrchestrator::new(
            self.registry.clone(),
            self.audit.clone(),
            self.storage.clone(),
            self.locks.clone(),
            self.config.staging_dir.clone(),
            self.config.datasource.clone(),
        )
        .with_metrics(self.metrics.clone())
    }

    fn chains(&self) -> IncrementalChainManager {
        IncrementalChainManager::new(self.audit.clone(), self.storage.clone())
    }
}

async fn run_app() -> Result<()> {
    let mut args: Vec<String> = env::args().skip(1).collect();
    let config_path = take_config_flag(&mut args)?.unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG));
    let config = AppConfig::load_from_json(&config_path)
        .with_context(|| format!("Failed to load application configuration from {}", config_path.display()))?;

    if args.is_empty() {
        args = prompt_command()?;
    }
    let services = Services::build(config).await?;
    let outcome = dispatch(&services, &args).await;
    info!(
        metrics = %serde_json::to_string(&services.metrics.snapshot()).unwrap_or_default(),
        "Run metrics"
    );
    if let Some(replicated) = &services.replicas {
        info!(
            replicas = %serde_json::to_string(&replicated.stats()).unwrap_or_default(),
            "Replica upload statistics"
        );
    }
    outcome
}

async fn dispatch(services: &Services, args: &[String]) -> Result<()> {
    let words: Vec<&str> = args.iter().map(String::as_str).collect();

    match words.as_slice() {
        ["backup", kind, task] => {
            let kind: BackupKind = kind.parse()?;
            let task_id = parse_task(task)?;
            let datasource = &services.config.datasource;
            if !check_db_connection(datasource).await {
                anyhow::bail!("Cannot reach the datasource at {}:{}", datasource.host, datasource.port);
            }
            let staging = services.config.staging_dir.clone();
            let request = match kind {
                BackupKind::Full => BackupRequest::full(task_id, datasource.clone(), staging),
                BackupKind::Incremental => BackupRequest::incremental(task_id, datasource.clone(), staging),
            };
            let record = services.pipeline().run(request).await.context("Backup process failed")?;
            println!(
                "Backup {} {} for task {}: {} bytes at {}",
                record.id,
                record.status,
                record.task_id,
                record.file_size_bytes.unwrap_or(0),
                record.storage_location.as_deref().unwrap_or("-")
            );
        }
        ["restore", "point", task, time, rest @ ..] => {
            let target_time: DateTime<Utc> = DateTime::parse_from_rfc3339(time)
                .with_context(|| format!("Invalid RFC 3339 time: {}", time))?
                .with_timezone(&Utc);
            let request = PointRestoreRequest {
                task_id: parse_task(task)?,
                datasource_type: services.config.datasource.datasource_type.clone(),
                target_time,
                target_database: None,
                operator: operator(rest),
                remark: None,
            };
            let restored = services
                .orchestrator()
                .restore_to_point(request)
                .await
                .context("Point-in-time restore failed")?;
            if !restored {
                anyhow::bail!("Point-in-time restore did not complete; see the restore record");
            }
        }
        ["restore", "backup", task, id, rest @ ..] => {
            let request = BackupRestoreRequest {
                task_id: parse_task(task)?,
                datasource_type: services.config.datasource.datasource_type.clone(),
                history_id: id.parse().with_context(|| format!("Invalid backup id: {}", id))?,
                target_database: None,
                operator: operator(rest),
                remark: None,
            };
            let restored = services
                .orchestrator()
                .restore_to_backup(request)
                .await
                .context("Backup restore failed")?;
            if !restored {
                anyhow::bail!("Backup restore did not complete; see the restore record");
            }
        }
        ["restore", "stats", task, days] => {
            let task_id = parse_task(task)?;
            let days: i64 = days.parse().with_context(|| format!("Invalid day count: {}", days))?;
            let orchestrator = services.orchestrator();
            let stats = orchestrator.restore_statistics(task_id, days).await?;
            println!(
                "Restores of task {} in the last {} days: {} total, {} succeeded, {} failed ({:.1}% success)",
                task_id, days, stats.total, stats.success, stats.failed, stats.success_rate
            );
            if let Some(latest) = orchestrator.latest_pitr(task_id).await? {
                println!(
                    "Latest point-in-time restore: #{} to {} by {} ({})",
                    latest.id,
                    latest.target_point.map(|t| t.to_rfc3339()).unwrap_or_default(),
                    latest.operator,
                    latest.status
                );
            }
        }
        ["stats", task, days] => {
            let task_id = parse_task(task)?;
            let days: i64 = days.parse().with_context(|| format!("Invalid day count: {}", days))?;
            let to = Utc::now();
            let backups = services
                .audit
                .backups_in_range(task_id, to - chrono::Duration::days(days), to)
                .await?;
            let succeeded = backups.iter().filter(|b| b.status == RunStatus::Success).count();
            let failed = backups.iter().filter(|b| b.status == RunStatus::Failed).count();
            let bytes: i64 = backups.iter().filter_map(|b| b.file_size_bytes).sum();
            println!(
                "Backups of task {} in the last {} days: {} total, {} succeeded, {} failed, {} bytes",
                task_id,
                days,
                backups.len(),
                succeeded,
                failed,
                bytes
            );
            let restores = services.orchestrator().restore_statistics(task_id, days).await?;
            println!(
                "Restores: {} total, {} succeeded, {} failed",
                restores.total, restores.success, restores.failed
            );
        }
        ["chain", task] => {
            let task_id = parse_task(task)?;
            let chains = services.chains().build_all_chains(task_id).await?;
            if chains.is_empty() {
                println!("Task {} has no backup chains.", task_id);
            }
            for chain in chains {
                let validation = validate_chain(&chain);
                println!(
                    "{}: full #{} at {}, {} incrementals, {} bytes, {}",
                    chain.chain_id,
                    chain.full_backup.id,
                    chain.full_backup.started_at.to_rfc3339(),
                    chain.incrementals.len(),
                    chain.total_size_bytes,
                    if validation.valid { "valid" } else { "INVALID" }
                );
                for message in validation.errors.iter().chain(validation.warnings.iter()) {
                    println!("  - {}", message);
                }
            }
        }
        ["cleanup", task, days] => {
            let task_id = parse_task(task)?;
            let days: i64 = days.parse().with_context(|| format!("Invalid retention days: {}", days))?;
            let report = services.chains().cleanup_expired_chains(task_id, days).await?;
            println!(
                "Retired {} chains ({} backups), deleted {} artifacts, {} deletions failed",
                report.expired_chains.len(),
                report.retired_ids.len(),
                report.deleted_locations.len(),
                report.failed_deletions.len()
            );
        }
        _ => {
            println!("{}", USAGE);
            anyhow::bail!("Invalid command: {}", args.join(" "));
        }
    }
    Ok(())
}

const USAGE: &str = "Usage: pitrtool [--config <path>] <command>
  backup full <task>
  backup incremental <task>
  restore point <task> <rfc3339-time> [operator]
  restore backup <task> <history-id> [operator]
  restore stats <task> <days>
  stats <task> <days>
  chain <task>
  cleanup <task> <retention-days>";

fn take_config_flag(args: &mut Vec<String>) -> Result<Option<PathBuf>> {
    let Some(index) = args.iter().position(|a| a == "--config") else {
        return Ok(None);
    };
    if index + 1 >= args.len() {
        anyhow::bail!("--config requires a path");
    }
    let path = args.remove(index + 1);
    args.remove(index);
    Ok(Some(PathBuf::from(path)))
}

fn parse_task(raw: &str) -> Result<i64> {
    raw.parse().with_context(|| format!("Invalid task id: {}", raw))
}

fn operator(rest: &[&str]) -> String {
    rest.first().map(|s| s.to_string()).unwrap_or_else(|| DEFAULT_OPERATOR.to_string())
}

/// Prompts for a command when none was given on the command line.
fn prompt_command() -> Result<Vec<String>> {
    use std::io::{Write, stdin, stdout};

    println!("Select an operation:");
    println!("{}", USAGE);
    print!("Enter a command: ");
    stdout().flush().context("Failed to flush stdout")?;

    let mut input = String::new();
    stdin().read_line(&mut input).context("Failed to read user input")?;
    Ok(input.split_whitespace().map(str::to_string).collect())
}
