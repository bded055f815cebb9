//! Comparison of an archive against the live system.
//!
//! Answers "what would restoring this change?" per module, from manifests
//! alone. Nothing here mutates either side, so a comparison is always safe
//! to run, even while the operator is deciding whether to restore.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::model::Manifest;

#[derive(Debug, Clone, Serialize)]
pub struct ModuleDelta {
    pub module: String,
    pub archived_count: u64,
    pub current_count: u64,
    /// archived minus current: positive means the archive holds more rows
    /// than the live system, negative means restoring would lose rows.
    pub delta: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct BackupComparison {
    pub archive_backup_date: DateTime<Utc>,
    pub compared_at: DateTime<Utc>,
    /// Advisory only: an older archive is usually what a disaster recovery
    /// wants, but the operator should know they are going back in time.
    pub archive_predates_current: bool,
    pub modules: Vec<ModuleDelta>,
}

/// Pure diff of two manifests. The union of module keys is covered, so a
/// module absent from one side is reported with a zero count rather than
/// silently dropped.
pub fn compare_manifests(archived: &Manifest, current: &Manifest) -> BackupComparison {
    let mut keys: Vec<&String> = archived
        .module_counts
        .keys()
        .chain(current.module_counts.keys())
        .collect();
    keys.sort();
    keys.dedup();

    let modules = keys
        .into_iter()
        .map(|key| {
            let archived_count = archived.module_counts.get(key).copied().unwrap_or(0);
            let current_count = current.module_counts.get(key).copied().unwrap_or(0);
            ModuleDelta {
                module: key.clone(),
                archived_count,
                current_count,
                delta: archived_count as i64 - current_count as i64,
            }
        })
        .collect();

    BackupComparison {
        archive_backup_date: archived.backup_date,
        compared_at: current.backup_date,
        archive_predates_current: archived.backup_date < current.backup_date,
        modules,
    }
}
