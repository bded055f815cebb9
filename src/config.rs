//! Configuration management for the vault.
//!
//! Loads configuration from a TOML file with environment variable overrides,
//! and derives the on-disk layout of the data tree from it.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Environment variable overriding `storage.data_dir`.
pub const DATA_DIR_ENV: &str = "RECORDS_VAULT_DATA";

/// File name of the SQLite store inside the data tree.
pub const DB_FILE: &str = "records.db";

/// Directory inside the data tree reserved for vault bookkeeping.
/// Never archived, never cleared by a restore.
pub const SYSTEM_DIR: &str = "system";

/// Scratch directory inside the data tree. Same guarantees as [`SYSTEM_DIR`].
pub const TMP_DIR: &str = "tmp";

/// Subdirectory of [`SYSTEM_DIR`] holding pre-restore rollback snapshots.
pub const ROLLBACK_DIR: &str = "rollback";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VaultConfig {
    pub storage: StorageConfig,
    #[serde(default)]
    pub email: EmailConfig,
    #[serde(default)]
    pub backup: BackupConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Root of the data tree (store, attachments, system dir)
    pub data_dir: PathBuf,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EmailConfig {
    /// Root of the filed-email tree. Lives outside the data tree so a
    /// restore that does not carry emails never touches it.
    #[serde(default)]
    pub store_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BackupConfig {
    /// Default destination for backup archives. Falls back to a `backups`
    /// directory next to the data tree.
    #[serde(default)]
    pub output_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Attempts before a locked file is reported as a failure
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// First backoff delay in milliseconds; doubles per attempt
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,

    /// Ceiling for the backoff delay in milliseconds
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default values
fn default_max_attempts() -> u32 {
    5
}

fn default_initial_delay_ms() -> u64 {
    100
}

fn default_max_delay_ms() -> u64 {
    2_000
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            level: default_log_level(),
        }
    }
}

impl VaultConfig {
    /// Load configuration from a TOML file, then apply environment overrides.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let mut config: VaultConfig = toml::from_str(&content)?;
        config.apply_env();
        Ok(config)
    }

    /// Create a default configuration rooted in the working directory.
    pub fn default_config() -> Self {
        let mut config = VaultConfig {
            storage: StorageConfig {
                data_dir: PathBuf::from("./records-data"),
            },
            email: EmailConfig::default(),
            backup: BackupConfig::default(),
            retry: RetryConfig::default(),
            log: LogConfig::default(),
        };
        config.apply_env();
        config
    }

    fn apply_env(&mut self) {
        if let Ok(dir) = std::env::var(DATA_DIR_ENV) {
            if !dir.is_empty() {
                self.storage.data_dir = PathBuf::from(dir);
            }
        }
    }
}

/// Resolved on-disk layout derived from [`VaultConfig`].
///
/// Everything under `data_dir` except `system/` and `tmp/` belongs to the
/// records themselves and is what backups capture and restores replace.
#[derive(Debug, Clone)]
pub struct VaultPaths {
    pub data_dir: PathBuf,
    pub db_path: PathBuf,
    pub system_dir: PathBuf,
    pub tmp_dir: PathBuf,
    pub rollback_dir: PathBuf,
    pub status_path: PathBuf,
    pub backups_dir: PathBuf,
    pub email_dir: Option<PathBuf>,
}

impl VaultPaths {
    pub fn from_config(config: &VaultConfig) -> Self {
        let data_dir = config.storage.data_dir.clone();
        let system_dir = data_dir.join(SYSTEM_DIR);
        let backups_dir = config
            .backup
            .output_dir
            .clone()
            .unwrap_or_else(|| data_dir_sibling(&data_dir, "backups"));
        VaultPaths {
            db_path: data_dir.join(DB_FILE),
            tmp_dir: data_dir.join(TMP_DIR),
            rollback_dir: system_dir.join(ROLLBACK_DIR),
            status_path: system_dir.join(crate::model::status::STATUS_FILE),
            email_dir: config.email.store_dir.clone(),
            backups_dir,
            system_dir,
            data_dir,
        }
    }

    /// Create the directories the vault expects to exist.
    pub fn ensure_layout(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.data_dir)?;
        std::fs::create_dir_all(&self.system_dir)?;
        std::fs::create_dir_all(&self.tmp_dir)?;
        std::fs::create_dir_all(&self.rollback_dir)?;
        if let Some(dir) = &self.email_dir {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }
}

fn data_dir_sibling(data_dir: &Path, name: &str) -> PathBuf {
    match data_dir.parent() {
        Some(parent) if parent.as_os_str().is_empty() => PathBuf::from(name),
        Some(parent) => parent.join(name),
        None => PathBuf::from(name),
    }
}
