//! The restore state machine.
//!
//! Phases run strictly in order: prepare, validate, checkpoint, close,
//! rollback snapshot, clear, extract, reopen and migrate, verify, repair,
//! invalidate sessions. Validation failures abort before anything is
//! touched; once the data tree has been mutated, any failure funnels
//! through [`auto_rollback`], which replays the pre-restore snapshot.
//! Storage is reopened and the maintenance reservation released on every
//! exit path, so the application always gets a usable store back.

pub mod repair;
pub mod rollback;

pub use repair::{DanglingReference, RepairReport};
pub use rollback::{RollbackManager, ROLLBACK_PREFIX};

use std::path::{Path, PathBuf};

use serde::Serialize;
use serde_json::json;
use tracing::{error, info, warn};

use crate::archive::{ArchiveReader, EntryRoutes};
use crate::audit;
use crate::config::{VaultPaths, SYSTEM_DIR, TMP_DIR};
use crate::db::{migrate, sessions, MaintenanceGuard, MaintenanceKind, StorageCoordinator};
use crate::error::{ArchiveError, Result, VaultError};
use crate::model::{modules, Manifest, Operator};
use crate::progress::{ProgressPhase, ProgressSpan, ProgressTracker};
use crate::retry::{remove_dir_all_retrying, remove_file_retrying, BackoffPolicy};

pub struct RestoreRequest {
    pub archive_path: PathBuf,
    pub operator: Operator,
}

#[derive(Debug, Serialize)]
pub struct RestoreReport {
    pub archive_path: PathBuf,
    pub manifest: Manifest,
    pub extracted_files: usize,
    pub repair: RepairReport,
    pub sessions_revoked: usize,
}

/// Uniform result the orchestrator boundary converts every outcome into.
/// Nothing escapes `run` as an error; callers branch on `success` and
/// `rolled_back` and surface `error` verbatim.
#[derive(Debug, Serialize)]
pub struct RestoreOutcome {
    pub success: bool,
    pub rolled_back: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub report: Option<RestoreReport>,
}

impl RestoreOutcome {
    fn failed(error: String, rolled_back: bool) -> Self {
        RestoreOutcome {
            success: false,
            rolled_back,
            error: Some(error),
            report: None,
        }
    }
}

// Each phase owns a disjoint slice of the bar; interleaved events can
// therefore never regress the displayed percentage.
const ROLLBACK_SPAN: ProgressSpan = ProgressSpan {
    phase: ProgressPhase::CreatingRollback,
    floor: 12,
    span: 13,
    cap: 25,
};
const EXTRACT_SPAN: ProgressSpan = ProgressSpan {
    phase: ProgressPhase::Extracting,
    floor: 40,
    span: 35,
    cap: 75,
};

/// What the failure handler needs to know about how far the phases got.
struct Context {
    mutation_started: bool,
    rollback_snapshot: Option<PathBuf>,
}

pub fn run(
    coordinator: &StorageCoordinator,
    paths: &VaultPaths,
    policy: &BackoffPolicy,
    progress: &ProgressTracker,
    request: &RestoreRequest,
) -> RestoreOutcome {
    let guard = match coordinator.begin_maintenance(MaintenanceKind::Restore) {
        Ok(guard) => guard,
        Err(e) => {
            progress.error(format!("Restore refused: {e}"));
            return RestoreOutcome::failed(e.to_string(), false);
        }
    };

    let mut ctx = Context {
        mutation_started: false,
        rollback_snapshot: None,
    };
    let result = run_phases(coordinator, paths, policy, progress, request, &guard, &mut ctx);

    // The store comes back before the outcome is judged, on every path
    if let Err(reopen_err) = coordinator.reopen() {
        error!(error = %reopen_err, "[restore] Storage did not reopen after restore");
    }

    match result {
        Ok(report) => {
            progress.report(ProgressPhase::Complete, 100, "Restore complete");
            info!(
                archive = %report.archive_path.display(),
                files = report.extracted_files,
                "[restore] Restore completed successfully"
            );
            RestoreOutcome {
                success: true,
                rolled_back: false,
                error: None,
                report: Some(report),
            }
        }
        Err(e) => handle_failure(coordinator, paths, policy, progress, request, &guard, &ctx, e),
    }
}

#[allow(clippy::too_many_arguments)]
fn run_phases(
    coordinator: &StorageCoordinator,
    paths: &VaultPaths,
    policy: &BackoffPolicy,
    progress: &ProgressTracker,
    request: &RestoreRequest,
    guard: &MaintenanceGuard<'_>,
    ctx: &mut Context,
) -> Result<RestoreReport> {
    progress.report(ProgressPhase::Preparing, 1, "Preparing restore");
    paths.ensure_layout()?;

    progress.report(
        ProgressPhase::Validating,
        3,
        format!("Validating {}", request.archive_path.display()),
    );
    let mut reader = ArchiveReader::open(&request.archive_path).map_err(VaultError::Validation)?;
    let manifest = reader.read_manifest().map_err(VaultError::Validation)?;
    if manifest.schema_version > migrate::SCHEMA_VERSION {
        return Err(VaultError::Validation(ArchiveError::ManifestInvalid(
            format!(
                "archive schema version {} is newer than this build supports ({})",
                manifest.schema_version,
                migrate::SCHEMA_VERSION
            ),
        )));
    }

    progress.report(
        ProgressPhase::Checkpointing,
        6,
        "Checkpointing write-ahead log",
    );
    coordinator.checkpoint()?;
    // The rollback snapshot's manifest records what the store holds now
    let (current_counts, current_schema) = {
        let conn = coordinator.connection_during_maintenance(guard)?;
        let schema: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
        (modules::module_counts(&conn)?, schema)
    };

    progress.report(ProgressPhase::ClosingStorage, 9, "Closing storage");
    coordinator.close();

    progress.report(
        ProgressPhase::CreatingRollback,
        12,
        "Creating rollback snapshot",
    );
    let manager = RollbackManager::new(paths);
    let mut rollback_manifest =
        Manifest::new(&request.operator, current_schema, current_counts, false);
    let snapshot = manager.create(&mut rollback_manifest, progress, ROLLBACK_SPAN)?;
    ctx.rollback_snapshot = Some(snapshot.clone());

    progress.report(ProgressPhase::ClearingData, 28, "Clearing data directory");
    ctx.mutation_started = true;
    clear_data_tree(&paths.data_dir, policy)?;

    progress.report(ProgressPhase::Extracting, 40, "Extracting archive");
    let routes = EntryRoutes::for_paths(paths);
    let extracted_files = reader.extract_entries(&routes, EXTRACT_SPAN, progress)?;

    progress.report(
        ProgressPhase::ReopeningStorage,
        78,
        "Reopening storage and migrating",
    );
    coordinator.reopen()?;
    let migrated_from = coordinator.run_migrations()?;
    if migrated_from < migrate::SCHEMA_VERSION {
        info!(
            from = migrated_from,
            to = migrate::SCHEMA_VERSION,
            "[restore] Restored store migrated forward"
        );
    }

    {
        let conn = coordinator.connection_during_maintenance(guard)?;
        if let Err(e) = audit::append(
            &conn,
            audit::actions::ROLLBACK_CREATED,
            &request.operator,
            "rollback",
            &file_name(&snapshot),
            &json!({ "path": snapshot.display().to_string() }),
        ) {
            warn!(error = %e, "[restore] Could not record rollback snapshot creation");
        }
    }

    progress.report(ProgressPhase::Verifying, 84, "Verifying restored store");
    let conn = coordinator.connection_during_maintenance(guard)?;
    verify_counts(&conn, &manifest)?;

    progress.report(
        ProgressPhase::RepairingReferences,
        90,
        "Checking referential integrity",
    );
    let repair = repair::run(&conn, &request.operator)?;

    progress.report(
        ProgressPhase::InvalidatingSessions,
        95,
        "Invalidating login sessions",
    );
    let sessions_revoked = sessions::revoke_all(&conn)?;

    audit::append(
        &conn,
        audit::actions::RESTORE_COMPLETED,
        &request.operator,
        "backup",
        &file_name(&request.archive_path),
        &json!({
            "archive": request.archive_path.display().to_string(),
            "extracted_files": extracted_files,
            "operator_recreated": repair.operator_recreated,
            "dangling_references": repair.dangling.len(),
            "sessions_revoked": sessions_revoked,
        }),
    )?;

    Ok(RestoreReport {
        archive_path: request.archive_path.clone(),
        manifest,
        extracted_files,
        repair,
        sessions_revoked,
    })
}

/// Read-back check: the restored store must hold exactly the rows the
/// manifest recorded. A missing table or a count drift both mean the
/// extraction did not reproduce the snapshot.
fn verify_counts(conn: &rusqlite::Connection, manifest: &Manifest) -> Result<()> {
    let counts = modules::module_counts(conn)
        .map_err(|e| VaultError::Verification(format!("count read-back failed: {e}")))?;
    for (module, expected) in &manifest.module_counts {
        let actual = counts.get(module).copied().unwrap_or(0);
        if actual != *expected {
            return Err(VaultError::Verification(format!(
                "module {module} has {actual} rows, manifest recorded {expected}"
            )));
        }
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn handle_failure(
    coordinator: &StorageCoordinator,
    paths: &VaultPaths,
    policy: &BackoffPolicy,
    progress: &ProgressTracker,
    request: &RestoreRequest,
    guard: &MaintenanceGuard<'_>,
    ctx: &Context,
    err: VaultError,
) -> RestoreOutcome {
    error!(error = %err, "[restore] Restore failed");

    // Nothing was mutated: reject cleanly, no rollback needed
    if !ctx.mutation_started || err.is_pre_mutation() {
        record_failure(coordinator, guard, request, &err, false);
        progress.error(format!("Restore failed: {err}"));
        return RestoreOutcome::failed(err.to_string(), false);
    }

    let reason = match &err {
        VaultError::Verification(_) => "verification failure",
        _ => "unhandled error",
    };

    let Some(snapshot) = ctx.rollback_snapshot.as_deref() else {
        // Mutation without a snapshot cannot happen in the phase order,
        // but if it ever does, the honest report is manual recovery
        progress.error(format!(
            "Restore failed with no rollback snapshot, manual intervention required: {err}"
        ));
        return RestoreOutcome::failed(err.to_string(), false);
    };

    match auto_rollback(
        coordinator,
        paths,
        policy,
        &request.operator,
        snapshot,
        reason,
        &err,
        guard,
    ) {
        Ok(()) => {
            record_failure(coordinator, guard, request, &err, true);
            progress.error(format!("Restore failed and was rolled back: {err}"));
            RestoreOutcome::failed(err.to_string(), true)
        }
        Err(rollback_err) => {
            let fatal = VaultError::RollbackFailed {
                reason: err.to_string(),
                source: Box::new(rollback_err),
            };
            error!(error = %fatal, "[restore] Automatic rollback failed");
            progress.error(fatal.to_string());
            RestoreOutcome::failed(fatal.to_string(), false)
        }
    }
}

/// Shared exit for both failure points: replay the pre-restore snapshot,
/// then record why in the audit chain.
#[allow(clippy::too_many_arguments)]
fn auto_rollback(
    coordinator: &StorageCoordinator,
    paths: &VaultPaths,
    policy: &BackoffPolicy,
    operator: &Operator,
    snapshot: &Path,
    reason: &str,
    original: &VaultError,
    guard: &MaintenanceGuard<'_>,
) -> Result<()> {
    warn!(
        snapshot = %snapshot.display(),
        reason,
        "[restore] Rolling back to pre-restore snapshot"
    );

    let manager = RollbackManager::new(paths);
    manager.execute(coordinator, policy, snapshot)?;

    let conn = coordinator.connection_during_maintenance(guard)?;
    audit::append(
        &conn,
        audit::actions::ROLLBACK_PERFORMED,
        operator,
        "rollback",
        &file_name(snapshot),
        &json!({
            "reason": reason,
            "error": original.to_string(),
            "snapshot": snapshot.display().to_string(),
        }),
    )?;
    info!("[restore] Rollback complete");
    Ok(())
}

/// Best-effort restore-failed audit entry. The store may be in any state
/// here, so a failure to record is logged and swallowed.
fn record_failure(
    coordinator: &StorageCoordinator,
    guard: &MaintenanceGuard<'_>,
    request: &RestoreRequest,
    err: &VaultError,
    rolled_back: bool,
) {
    let Ok(conn) = coordinator.connection_during_maintenance(guard) else {
        warn!("[restore] Store unavailable, restore failure not recorded in audit chain");
        return;
    };
    if let Err(audit_err) = audit::append(
        &conn,
        audit::actions::RESTORE_FAILED,
        &request.operator,
        "backup",
        &file_name(&request.archive_path),
        &json!({ "error": err.to_string(), "rolled_back": rolled_back }),
    ) {
        warn!(error = %audit_err, "[restore] Could not record restore failure");
    }
}

/// Delete everything directly under the data root except the guarded
/// `system/` and `tmp/` directories, retrying each deletion against
/// transient locks.
pub(crate) fn clear_data_tree(data_dir: &Path, policy: &BackoffPolicy) -> Result<()> {
    for entry in std::fs::read_dir(data_dir)? {
        let entry = entry?;
        let name = entry.file_name();
        if name == SYSTEM_DIR || name == TMP_DIR {
            continue;
        }
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            remove_dir_all_retrying(&path, policy)?;
        } else {
            remove_file_retrying(&path, policy)?;
        }
    }
    Ok(())
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}
