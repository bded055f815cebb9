//! Async facade over the blocking engine.
//!
//! The engine is synchronous file and SQLite work, so every operation runs
//! on `spawn_blocking`. Mutual exclusion between operations is the storage
//! coordinator's maintenance reservation; a second backup or restore is
//! rejected there, not queued here. Progress events fan out through a
//! broadcast channel any number of UI surfaces can subscribe to.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::broadcast;

use crate::archive::ArchiveReader;
use crate::audit::{self, ChainVerification};
use crate::backup::{self, BackupReport, BackupRequest};
use crate::compare::{self, BackupComparison};
use crate::config::{VaultConfig, VaultPaths};
use crate::db::StorageCoordinator;
use crate::error::{Result, VaultError};
use crate::model::status::{self, BackupStatusRecord};
use crate::model::{modules, Manifest, Operator};
use crate::progress::{BroadcastSink, ProgressEvent, ProgressSink, ProgressTracker};
use crate::restore::{self, RestoreOutcome, RestoreRequest};
use crate::retry::BackoffPolicy;

pub struct VaultService {
    coordinator: Arc<StorageCoordinator>,
    paths: VaultPaths,
    policy: BackoffPolicy,
    progress: Arc<BroadcastSink>,
}

impl VaultService {
    /// Open the store, run startup migrations, and get the vault ready to
    /// serve operations.
    pub fn open(config: &VaultConfig) -> Result<Self> {
        let paths = VaultPaths::from_config(config);
        paths.ensure_layout()?;

        let coordinator = Arc::new(StorageCoordinator::open(paths.db_path.clone())?);
        coordinator.run_migrations()?;

        Ok(VaultService {
            coordinator,
            paths,
            policy: BackoffPolicy::from_config(&config.retry),
            progress: Arc::new(BroadcastSink::new(64)),
        })
    }

    pub fn subscribe_progress(&self) -> broadcast::Receiver<ProgressEvent> {
        self.progress.subscribe()
    }

    pub async fn backup(&self, request: BackupRequest) -> Result<BackupReport> {
        let coordinator = self.coordinator.clone();
        let paths = self.paths.clone();
        let sink: Arc<dyn ProgressSink> = self.progress.clone();
        tokio::task::spawn_blocking(move || {
            let tracker = ProgressTracker::new(sink);
            backup::run(&coordinator, &paths, &tracker, &request)
        })
        .await
        .map_err(|e| VaultError::Task(e.to_string()))?
    }

    /// Run a restore to completion. Failures come back inside the outcome,
    /// never as an error; the only way to learn what happened is to look.
    pub async fn restore(&self, request: RestoreRequest) -> RestoreOutcome {
        let coordinator = self.coordinator.clone();
        let paths = self.paths.clone();
        let policy = self.policy.clone();
        let sink: Arc<dyn ProgressSink> = self.progress.clone();
        let task = tokio::task::spawn_blocking(move || {
            let tracker = ProgressTracker::new(sink);
            restore::run(&coordinator, &paths, &policy, &tracker, &request)
        })
        .await;
        match task {
            Ok(outcome) => outcome,
            Err(e) => RestoreOutcome {
                success: false,
                rolled_back: false,
                error: Some(format!("restore task failed: {e}")),
                report: None,
            },
        }
    }

    /// Diff an archive's manifest against the live system.
    pub async fn compare(&self, archive_path: PathBuf) -> Result<BackupComparison> {
        let coordinator = self.coordinator.clone();
        tokio::task::spawn_blocking(move || {
            let mut reader = ArchiveReader::open(&archive_path).map_err(VaultError::Validation)?;
            let archived = reader.read_manifest().map_err(VaultError::Validation)?;
            let current = current_manifest(&coordinator)?;
            Ok(compare::compare_manifests(&archived, &current))
        })
        .await
        .map_err(|e| VaultError::Task(e.to_string()))?
    }

    /// The persisted last-successful-backup record, if any backup has ever
    /// succeeded.
    pub async fn backup_status(&self) -> Result<Option<BackupStatusRecord>> {
        let path = self.paths.status_path.clone();
        tokio::task::spawn_blocking(move || status::load(&path))
            .await
            .map_err(|e| VaultError::Task(e.to_string()))?
    }

    /// Recompute the whole audit chain.
    pub async fn verify_audit(&self) -> Result<ChainVerification> {
        let coordinator = self.coordinator.clone();
        tokio::task::spawn_blocking(move || {
            let conn = coordinator.connection()?;
            audit::verify(&conn)
        })
        .await
        .map_err(|e| VaultError::Task(e.to_string()))?
    }
}

/// Manifest describing the live system right now. What comparisons diff
/// archives against.
pub fn current_manifest(coordinator: &StorageCoordinator) -> Result<Manifest> {
    let conn = coordinator.connection()?;
    let schema: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
    let counts = modules::module_counts(&conn)?;
    Ok(Manifest::new(&Operator::system(), schema, counts, false))
}
