//! The last-successful-backup status record.
//!
//! A small JSON file in the system directory, overwritten after every
//! successful backup. It exists so "how stale is our last backup?" can be
//! answered without opening the store or listing archive directories.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::Result;

pub const STATUS_FILE: &str = "backup-status.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupStatusRecord {
    pub last_backup_timestamp: DateTime<Utc>,
    pub last_backup_user: String,
    pub last_backup_file_path: PathBuf,
    pub last_backup_size_bytes: u64,
}

impl BackupStatusRecord {
    /// Whole days elapsed since the recorded backup.
    pub fn days_since(&self, now: DateTime<Utc>) -> i64 {
        (now - self.last_backup_timestamp).num_days()
    }
}

/// Read the status record. A missing file means no backup has succeeded
/// yet; an unreadable one is treated the same after a warning, because the
/// record is advisory and must never block a backup or restore.
pub fn load(path: &Path) -> Result<Option<BackupStatusRecord>> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    match serde_json::from_str(&content) {
        Ok(record) => Ok(Some(record)),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Ignoring unreadable backup status record");
            Ok(None)
        }
    }
}

/// Overwrite the status record after a successful backup.
pub fn store(path: &Path, record: &BackupStatusRecord) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(record)?;
    std::fs::write(path, json)?;
    Ok(())
}
