//! Snapshot creation.
//!
//! A backup checkpoints the write-ahead log, records the live module counts
//! in a fresh manifest, closes the store so the files are quiescent, streams
//! the data tree into an archive, and reopens the store. Reopening happens
//! on every exit path; a backup that fails must never leave the application
//! without a usable store.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::{error, info, warn};

use crate::archive::SnapshotBuilder;
use crate::audit;
use crate::config::VaultPaths;
use crate::db::{MaintenanceGuard, MaintenanceKind, StorageCoordinator};
use crate::error::Result;
use crate::model::status::{self, BackupStatusRecord};
use crate::model::{modules, Manifest, Operator};
use crate::progress::{ProgressPhase, ProgressSpan, ProgressTracker};

pub struct BackupRequest {
    pub operator: Operator,
    /// Also archive the filed-email tree. Off by default because that tree
    /// can dwarf the data tree.
    pub include_emails: bool,
    /// Destination override. Defaults to the configured backups directory.
    pub output: Option<PathBuf>,
}

#[derive(Debug)]
pub struct BackupReport {
    pub archive_path: PathBuf,
    pub manifest: Manifest,
    pub size_bytes: u64,
}

/// File streaming owns the middle of the progress bar; the checkpoint,
/// close and reopen phases around it get the remainder.
const STREAM_SPAN: ProgressSpan = ProgressSpan {
    phase: ProgressPhase::Streaming,
    floor: 15,
    span: 80,
    cap: 95,
};

pub fn run(
    coordinator: &StorageCoordinator,
    paths: &VaultPaths,
    progress: &ProgressTracker,
    request: &BackupRequest,
) -> Result<BackupReport> {
    let guard = coordinator.begin_maintenance(MaintenanceKind::Backup)?;

    progress.report(ProgressPhase::Preparing, 2, "Preparing backup");
    paths.ensure_layout()?;

    let result = run_inner(coordinator, paths, progress, request, &guard);

    // The store comes back no matter how the snapshot went
    progress.report(ProgressPhase::ReopeningStorage, 96, "Reopening storage");
    if let Err(reopen_err) = coordinator.reopen() {
        error!(error = %reopen_err, "[backup] Storage did not reopen after snapshot");
        progress.error("Storage did not reopen after snapshot");
        return Err(result.err().unwrap_or(reopen_err));
    }

    match result {
        Ok((archive_path, manifest, size_bytes)) => {
            let record = BackupStatusRecord {
                last_backup_timestamp: manifest.backup_date,
                last_backup_user: request.operator.username.clone(),
                last_backup_file_path: archive_path.clone(),
                last_backup_size_bytes: size_bytes,
            };
            status::store(&paths.status_path, &record)?;

            let conn = coordinator.connection_during_maintenance(&guard)?;
            audit::append(
                &conn,
                audit::actions::BACKUP_CREATED,
                &request.operator,
                "backup",
                &file_name(&archive_path),
                &json!({
                    "path": archive_path.display().to_string(),
                    "size_bytes": size_bytes,
                    "file_count": manifest.file_count,
                    "includes_emails": manifest.includes_emails,
                }),
            )?;

            progress.report(ProgressPhase::Complete, 100, "Backup complete");
            info!(
                path = %archive_path.display(),
                size_bytes,
                "[backup] Backup completed successfully"
            );
            Ok(BackupReport {
                archive_path,
                manifest,
                size_bytes,
            })
        }
        Err(e) => {
            if let Ok(conn) = coordinator.connection_during_maintenance(&guard) {
                if let Err(audit_err) = audit::append(
                    &conn,
                    audit::actions::BACKUP_FAILED,
                    &request.operator,
                    "backup",
                    "",
                    &json!({ "error": e.to_string() }),
                ) {
                    warn!(error = %audit_err, "[backup] Could not record backup failure");
                }
            }
            progress.error(format!("Backup failed: {e}"));
            Err(e)
        }
    }
}

fn run_inner(
    coordinator: &StorageCoordinator,
    paths: &VaultPaths,
    progress: &ProgressTracker,
    request: &BackupRequest,
    guard: &MaintenanceGuard<'_>,
) -> Result<(PathBuf, Manifest, u64)> {
    progress.report(
        ProgressPhase::Checkpointing,
        5,
        "Checkpointing write-ahead log",
    );
    coordinator.checkpoint()?;

    // Counts and schema version come from the live store, before it closes
    let (counts, schema_version) = {
        let conn = coordinator.connection_during_maintenance(guard)?;
        let schema: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
        (modules::module_counts(&conn)?, schema)
    };

    let include_emails = request.include_emails && paths.email_dir.is_some();
    let mut manifest = Manifest::new(&request.operator, schema_version, counts, include_emails);

    progress.report(
        ProgressPhase::ClosingStorage,
        10,
        "Closing storage for snapshot",
    );
    coordinator.close();

    let dest = request
        .output
        .clone()
        .unwrap_or_else(|| paths.backups_dir.join(archive_name(manifest.backup_date)));

    let builder = SnapshotBuilder::new(paths, progress);
    let entries = builder.collect_entries(include_emails)?;
    match builder.write_archive(&dest, &mut manifest, &entries, STREAM_SPAN) {
        Ok(size) => Ok((dest, manifest, size)),
        Err(e) => {
            // An incomplete archive must not be mistaken for a backup later
            if let Err(cleanup) = std::fs::remove_file(&dest) {
                warn!(
                    path = %dest.display(),
                    error = %cleanup,
                    "[backup] Could not remove partial archive"
                );
            }
            Err(e)
        }
    }
}

/// Timestamp-derived, second resolution, filesystem-safe.
fn archive_name(at: DateTime<Utc>) -> String {
    format!("records-backup-{}.zip", at.format("%Y%m%d-%H%M%S"))
}

fn file_name(path: &std::path::Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn archive_names_are_filesystem_safe() {
        let at = DateTime::parse_from_rfc3339("2025-06-01T10:15:30Z")
            .unwrap()
            .with_timezone(&Utc);
        let name = archive_name(at);
        assert_eq!(name, "records-backup-20250601-101530.zip");
        assert!(!name.contains(':'));
        assert!(!name.contains(' '));
    }
}
