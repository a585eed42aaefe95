// pitrtool/src/config/mod.rs
use anyhow::{Context, Result};
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::model::ConnectionInfo;
use crate::model::connection::default_port;

const DEFAULT_STAGING_DIR: &str = "./staging";
const DEFAULT_LOCAL_STORAGE_DIR: &str = "./backups";
const DEFAULT_BUCKET: &str = "backup";
const DEFAULT_SLOT: &str = "pitrtool_slot";

// Structs for deserializing config.json
#[derive(Debug, Clone, Default, Deserialize)]
pub struct JsonDatasourceConfig {
    #[serde(rename = "type")]
    pub datasource_type: Option<String>,
    pub url: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub database: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct JsonS3StorageConfig {
    pub bucket_name: Option<String>,
    pub region: Option<String>,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub endpoint_url: Option<String>,
    pub folder_prefix: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct JsonStorageConfig {
    pub bucket: Option<String>,
    pub local_base_path: Option<PathBuf>,
    pub s3_storage: Option<JsonS3StorageConfig>,
    pub replicas: Option<Vec<JsonReplicaConfig>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct JsonReplicaConfig {
    pub name: Option<String>,
    #[serde(rename = "type")]
    pub replica_type: Option<String>,
    pub enabled: Option<bool>,
    pub local_base_path: Option<PathBuf>,
    pub s3_storage: Option<JsonS3StorageConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct JsonRetryConfig {
    pub max_attempts: Option<u32>,
    pub initial_backoff_ms: Option<u64>,
    pub multiplier: Option<f64>,
    pub max_backoff_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct JsonBackendConfig {
    pub backend: Option<String>,
    pub database_url: Option<String>,
    pub wait_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct JsonToolConfig {
    pub dump_timeout_secs: Option<u64>,
    pub restore_timeout_secs: Option<u64>,
    pub change_read_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawJsonConfig {
    pub datasource: Option<JsonDatasourceConfig>,
    pub staging_dir: Option<PathBuf>,
    pub log_dir: Option<PathBuf>,
    pub compress_artifacts: Option<bool>,
    pub postgres_slot: Option<String>,
    pub retry: Option<JsonRetryConfig>,
    pub lock: Option<JsonBackendConfig>,
    pub storage: Option<JsonStorageConfig>,
    pub audit: Option<JsonBackendConfig>,
    pub tools: Option<JsonToolConfig>,
}

// Application's internal configuration structs
#[derive(Debug, Clone)]
pub struct SpacesConfig {
    pub endpoint_url: String,
    pub region: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    pub bucket_name: String,
    pub folder_prefix: Option<String>,
}

#[derive(Debug, Clone)]
pub enum StorageBackend {
    Local { base_path: PathBuf },
    S3(SpacesConfig),
}

#[derive(Debug, Clone)]
pub struct ReplicaConfig {
    pub name: String,
    pub backend: StorageBackend,
}

#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub bucket: String,
    pub backend: StorageBackend,
    /// Enabled replicas. When non-empty they replace `backend`.
    pub replicas: Vec<ReplicaConfig>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub multiplier: f64,
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 1_000,
            multiplier: 2.0,
            max_backoff_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum LockBackend {
    Local,
    Postgres { database_url: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct LockConfig {
    pub backend: LockBackend,
    pub wait_timeout_secs: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AuditBackend {
    Memory,
    Postgres { database_url: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToolConfig {
    pub dump_timeout_secs: u64,
    pub restore_timeout_secs: u64,
    pub change_read_timeout_secs: u64,
}

impl Default for ToolConfig {
    fn default() -> Self {
        Self {
            dump_timeout_secs: 3_600,
            restore_timeout_secs: 3_600,
            change_read_timeout_secs: 300,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub datasource: ConnectionInfo,
    pub staging_dir: PathBuf,
    pub log_dir: Option<PathBuf>,
    pub compress_artifacts: bool,
    pub postgres_slot: String,
    pub retry: RetryConfig,
    pub lock: LockConfig,
    pub storage: StorageConfig,
    pub audit: AuditBackend,
    pub tools: ToolConfig,
}

impl AppConfig {
    pub fn load_from_json(config_path: &Path) -> Result<Self> {
        let config_content = fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file at {}", config_path.display()))?;
        let mut config = Self::from_json_str(&config_content).with_context(|| {
            format!("Failed to parse config file at {}", config_path.display())
        })?;
        config.apply_env_overrides();
        Ok(config)
    }

    pub fn from_json_str(content: &str) -> Result<Self> {
        let raw: RawJsonConfig =
            serde_json::from_str(content).context("Failed to parse JSON configuration")?;
        Self::from_raw(raw)
    }

    pub fn from_raw(raw: RawJsonConfig) -> Result<Self> {
        let datasource = parse_datasource(
            raw.datasource
                .as_ref()
                .context("datasource must be set in config.json")?,
        )?;

        let retry_raw = raw.retry.unwrap_or_default();
        let defaults = RetryConfig::default();
        let retry = RetryConfig {
            max_attempts: retry_raw.max_attempts.unwrap_or(defaults.max_attempts),
            initial_backoff_ms: retry_raw.initial_backoff_ms.unwrap_or(defaults.initial_backoff_ms),
            multiplier: retry_raw.multiplier.unwrap_or(defaults.multiplier),
            max_backoff_ms: retry_raw.max_backoff_ms.unwrap_or(defaults.max_backoff_ms),
        };
        if retry.max_attempts == 0 {
            anyhow::bail!("retry.max_attempts must be at least 1");
        }

        let lock_raw = raw.lock.unwrap_or_default();
        let lock = LockConfig {
            backend: match lock_raw.backend.as_deref().unwrap_or("local") {
                "local" => LockBackend::Local,
                "postgres" => LockBackend::Postgres {
                    database_url: lock_raw
                        .database_url
                        .clone()
                        .context("lock.database_url must be set for the postgres lock backend")?,
                },
                other => anyhow::bail!("Unknown lock backend: {}", other),
            },
            wait_timeout_secs: lock_raw.wait_timeout_secs.unwrap_or(30),
        };

        let audit_raw = raw.audit.unwrap_or_default();
        let audit = match audit_raw.backend.as_deref().unwrap_or("memory") {
            "memory" => AuditBackend::Memory,
            "postgres" => AuditBackend::Postgres {
                database_url: audit_raw
                    .database_url
                    .context("audit.database_url must be set for the postgres audit backend")?,
            },
            other => anyhow::bail!("Unknown audit backend: {}", other),
        };

        let tools_raw = raw.tools.unwrap_or_default();
        let tool_defaults = ToolConfig::default();
        let tools = ToolConfig {
            dump_timeout_secs: tools_raw.dump_timeout_secs.unwrap_or(tool_defaults.dump_timeout_secs),
            restore_timeout_secs: tools_raw
                .restore_timeout_secs
                .unwrap_or(tool_defaults.restore_timeout_secs),
            change_read_timeout_secs: tools_raw
                .change_read_timeout_secs
                .unwrap_or(tool_defaults.change_read_timeout_secs),
        };

        Ok(AppConfig {
            datasource,
            staging_dir: raw
                .staging_dir
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or_else(|| PathBuf::from(DEFAULT_STAGING_DIR)),
            log_dir: raw.log_dir,
            compress_artifacts: raw.compress_artifacts.unwrap_or(false),
            postgres_slot: raw.postgres_slot.unwrap_or_else(|| DEFAULT_SLOT.to_string()),
            retry,
            lock,
            storage: parse_storage(raw.storage.unwrap_or_default())?,
            audit,
            tools,
        })
    }

    /// `DATASOURCE_PASSWORD` and `AUDIT_DATABASE_URL` take precedence over the file.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(password) = env::var("DATASOURCE_PASSWORD") {
            if !password.is_empty() {
                self.datasource.password = Some(password);
            }
        }
        if let Ok(url) = env::var("AUDIT_DATABASE_URL") {
            if !url.is_empty() {
                self.audit = AuditBackend::Postgres { database_url: url };
            }
        }
    }
}

fn parse_datasource(raw: &JsonDatasourceConfig) -> Result<ConnectionInfo> {
    if let Some(url) = raw.url.as_ref().filter(|u| !u.is_empty()) {
        let mut conn = ConnectionInfo::from_url(url).context("Invalid datasource.url")?;
        if let Some(password) = raw.password.as_ref().filter(|p| !p.is_empty()) {
            conn.password = Some(password.clone());
        }
        return Ok(conn);
    }

    let datasource_type = raw
        .datasource_type
        .as_ref()
        .context("datasource.type must be set when datasource.url is absent")?
        .to_ascii_lowercase();
    if datasource_type != "mysql" && datasource_type != "postgres" {
        anyhow::bail!("Unsupported datasource.type: {}", datasource_type);
    }
    let database = raw
        .database
        .as_ref()
        .filter(|d| !d.trim().is_empty())
        .context("datasource.database must be set")?
        .clone();
    if database.contains(|c: char| !c.is_alphanumeric() && c != '_' && c != '-') {
        anyhow::bail!("Invalid character in datasource.database: {:?}", database);
    }

    Ok(ConnectionInfo {
        port: raw.port.unwrap_or_else(|| default_port(&datasource_type)),
        datasource_type,
        host: raw.host.clone().unwrap_or_else(|| "localhost".to_string()),
        username: raw
            .username
            .clone()
            .context("datasource.username must be set")?,
        password: raw.password.clone().filter(|p| !p.is_empty()),
        database,
    })
}

fn parse_spaces(s3_raw: &JsonS3StorageConfig) -> Option<SpacesConfig> {
    if let (Some(bucket), Some(region), Some(key_id), Some(secret), Some(endpoint)) = (
        s3_raw.bucket_name.as_ref().filter(|s| !s.is_empty()),
        s3_raw.region.as_ref().filter(|s| !s.is_empty()),
        s3_raw.access_key_id.as_ref().filter(|s| !s.is_empty()),
        s3_raw.secret_access_key.as_ref().filter(|s| !s.is_empty()),
        s3_raw.endpoint_url.as_ref().filter(|s| !s.is_empty()),
    ) {
        Some(SpacesConfig {
            bucket_name: bucket.clone(),
            region: region.clone(),
            access_key_id: key_id.clone(),
            secret_access_key: secret.clone(),
            endpoint_url: endpoint.clone(),
            folder_prefix: s3_raw.folder_prefix.clone().filter(|s| !s.is_empty()),
        })
    } else {
        None
    }
}

fn parse_storage(raw: JsonStorageConfig) -> Result<StorageConfig> {
    let bucket = raw
        .bucket
        .filter(|b| !b.is_empty())
        .unwrap_or_else(|| DEFAULT_BUCKET.to_string());

    let spaces_config = raw.s3_storage.as_ref().and_then(|s3_raw| {
        let parsed = parse_spaces(s3_raw);
        if parsed.is_none() {
            warn!(
                "S3 configuration is present in config.json but some required fields \
                 (bucket_name, region, access_key_id, secret_access_key, endpoint_url) are \
                 missing or empty. Falling back to local storage."
            );
        }
        parsed
    });

    let backend = match spaces_config {
        Some(spaces) => StorageBackend::S3(spaces),
        None => StorageBackend::Local {
            base_path: raw
                .local_base_path
                .unwrap_or_else(|| PathBuf::from(DEFAULT_LOCAL_STORAGE_DIR)),
        },
    };

    let mut replicas: Vec<ReplicaConfig> = Vec::new();
    for replica in raw.replicas.unwrap_or_default() {
        let name = replica
            .name
            .filter(|n| !n.trim().is_empty())
            .context("storage.replicas[].name must be set")?;
        if replicas.iter().any(|r| r.name == name) {
            anyhow::bail!("Duplicate storage replica name: {}", name);
        }
        if !replica.enabled.unwrap_or(true) {
            warn!(replica = %name, "Storage replica is disabled");
            continue;
        }
        let backend = match replica.replica_type.as_deref().unwrap_or("local") {
            "local" => StorageBackend::Local {
                base_path: replica
                    .local_base_path
                    .with_context(|| format!("storage replica {} needs local_base_path", name))?,
            },
            "s3" => StorageBackend::S3(
                replica
                    .s3_storage
                    .as_ref()
                    .and_then(parse_spaces)
                    .with_context(|| format!("storage replica {} has an incomplete s3_storage section", name))?,
            ),
            other => anyhow::bail!("Unknown type {} for storage replica {}", other, name),
        };
        replicas.push(ReplicaConfig { name, backend });
    }

    Ok(StorageConfig {
        bucket,
        backend,
        replicas,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_minimal_config_uses_defaults() -> anyhow::Result<()> {
        let config = AppConfig::from_json_str(
            &json!({
                "datasource": { "url": "mysql://backup:pw@db1:3307/shop" }
            })
            .to_string(),
        )?;

        assert_eq!(config.datasource.datasource_type, "mysql");
        assert_eq!(config.datasource.port, 3307);
        assert_eq!(config.retry, RetryConfig::default());
        assert_eq!(config.lock.backend, LockBackend::Local);
        assert_eq!(config.audit, AuditBackend::Memory);
        assert_eq!(config.storage.bucket, "backup");
        assert!(matches!(config.storage.backend, StorageBackend::Local { .. }));
        assert_eq!(config.staging_dir, PathBuf::from("./staging"));
        assert!(!config.compress_artifacts);
        Ok(())
    }

    #[test]
    fn test_full_config() -> anyhow::Result<()> {
        let config = AppConfig::from_json_str(
            &json!({
                "datasource": {
                    "type": "postgres",
                    "host": "pg.internal",
                    "username": "replicator",
                    "password": "pw",
                    "database": "orders"
                },
                "staging_dir": "/var/tmp/pitr",
                "compress_artifacts": true,
                "retry": { "max_attempts": 5, "initial_backoff_ms": 10 },
                "lock": { "backend": "postgres", "database_url": "postgres://l@x/locks", "wait_timeout_secs": 5 },
                "audit": { "backend": "postgres", "database_url": "postgres://a@x/audit" },
                "tools": { "dump_timeout_secs": 60 },
                "storage": {
                    "bucket": "nightly",
                    "s3_storage": {
                        "bucket_name": "b",
                        "region": "nyc3",
                        "access_key_id": "k",
                        "secret_access_key": "s",
                        "endpoint_url": "https://nyc3.digitaloceanspaces.com"
                    }
                }
            })
            .to_string(),
        )?;

        assert_eq!(config.datasource.port, 5432);
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.multiplier, 2.0);
        assert_eq!(
            config.lock.backend,
            LockBackend::Postgres { database_url: "postgres://l@x/locks".into() }
        );
        assert_eq!(config.lock.wait_timeout_secs, 5);
        assert_eq!(config.tools.dump_timeout_secs, 60);
        assert_eq!(config.tools.restore_timeout_secs, 3_600);
        assert_eq!(config.storage.bucket, "nightly");
        assert!(matches!(config.storage.backend, StorageBackend::S3(_)));
        Ok(())
    }

    #[test]
    fn test_incomplete_s3_falls_back_to_local() -> anyhow::Result<()> {
        let config = AppConfig::from_json_str(
            &json!({
                "datasource": { "url": "postgres://u:p@h/db" },
                "storage": { "local_base_path": "/srv/backups", "s3_storage": { "bucket_name": "b" } }
            })
            .to_string(),
        )?;
        match config.storage.backend {
            StorageBackend::Local { base_path } => assert_eq!(base_path, PathBuf::from("/srv/backups")),
            other => panic!("unexpected backend {:?}", other),
        }
        Ok(())
    }

    #[test]
    fn test_storage_replicas() -> anyhow::Result<()> {
        let config = AppConfig::from_json_str(
            &json!({
                "datasource": { "url": "mysql://u:p@h/db" },
                "storage": {
                    "replicas": [
                        { "name": "primary", "type": "local", "local_base_path": "/srv/a" },
                        { "name": "spare", "local_base_path": "/srv/b", "enabled": false },
                        { "name": "offsite", "type": "s3", "s3_storage": {
                            "bucket_name": "b", "region": "r", "access_key_id": "k",
                            "secret_access_key": "s", "endpoint_url": "https://e"
                        } }
                    ]
                }
            })
            .to_string(),
        )?;
        let names: Vec<&str> = config.storage.replicas.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["primary", "offsite"]);
        assert!(matches!(config.storage.replicas[1].backend, StorageBackend::S3(_)));

        let incomplete = json!({
            "datasource": { "url": "mysql://u:p@h/db" },
            "storage": { "replicas": [ { "name": "offsite", "type": "s3", "s3_storage": { "bucket_name": "b" } } ] }
        });
        assert!(AppConfig::from_json_str(&incomplete.to_string()).is_err());
        let duplicate = json!({
            "datasource": { "url": "mysql://u:p@h/db" },
            "storage": { "replicas": [
                { "name": "a", "local_base_path": "/x" },
                { "name": "a", "local_base_path": "/y" }
            ] }
        });
        assert!(AppConfig::from_json_str(&duplicate.to_string()).is_err());
        Ok(())
    }

    #[test]
    fn test_invalid_configs_are_rejected() {
        assert!(AppConfig::from_json_str("{}").is_err());
        assert!(AppConfig::from_json_str(
            &json!({ "datasource": { "type": "oracle", "username": "u", "database": "d" } }).to_string()
        )
        .is_err());
        assert!(AppConfig::from_json_str(
            &json!({ "datasource": { "type": "mysql", "username": "u", "database": "d; drop" } }).to_string()
        )
        .is_err());
        assert!(AppConfig::from_json_str(
            &json!({ "datasource": { "url": "mysql://u@h/d" }, "lock": { "backend": "postgres" } }).to_string()
        )
        .is_err());
        assert!(AppConfig::from_json_str(
            &json!({ "datasource": { "url": "mysql://u@h/d" }, "retry": { "max_attempts": 0 } }).to_string()
        )
        .is_err());
    }
}
