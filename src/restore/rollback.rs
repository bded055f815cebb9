//! Pre-restore rollback snapshots.
//!
//! Before a restore mutates anything, the current data tree is archived
//! into the rollback directory. Exactly one snapshot is retained: writing a
//! new one purges every older rollback file, because the only snapshot that
//! can undo the restore in flight is the most recent one.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::archive::{ArchiveReader, EntryRoutes, SnapshotBuilder};
use crate::config::VaultPaths;
use crate::db::StorageCoordinator;
use crate::error::{Result, VaultError};
use crate::model::Manifest;
use crate::progress::{NullSink, ProgressPhase, ProgressSpan, ProgressTracker};
use crate::retry::BackoffPolicy;

/// File-name prefix identifying rollback snapshots, the only files the
/// retention purge is allowed to delete.
pub const ROLLBACK_PREFIX: &str = "pre-restore-";

pub struct RollbackManager<'a> {
    paths: &'a VaultPaths,
}

impl<'a> RollbackManager<'a> {
    pub fn new(paths: &'a VaultPaths) -> Self {
        RollbackManager { paths }
    }

    /// Snapshot the current data tree into the rollback directory, then
    /// purge older snapshots so exactly one remains. The data tree walk
    /// excludes the rollback directory itself, so a snapshot never nests
    /// its predecessors.
    pub fn create(
        &self,
        manifest: &mut Manifest,
        progress: &ProgressTracker,
        span: ProgressSpan,
    ) -> Result<PathBuf> {
        std::fs::create_dir_all(&self.paths.rollback_dir)?;
        let dest = self
            .paths
            .rollback_dir
            .join(snapshot_name(manifest.backup_date));

        let builder = SnapshotBuilder::new(self.paths, progress);
        let entries = builder.collect_entries(false)?;
        builder.write_archive(&dest, manifest, &entries, span)?;

        self.purge_older(&dest);
        info!(path = %dest.display(), "[rollback] Pre-restore snapshot written");
        Ok(dest)
    }

    /// Most recent retained snapshot. The timestamp in the name sorts
    /// lexicographically, so the newest file is the greatest name.
    pub fn latest(&self) -> Option<PathBuf> {
        let mut snapshots: Vec<PathBuf> = std::fs::read_dir(&self.paths.rollback_dir)
            .ok()?
            .flatten()
            .map(|entry| entry.path())
            .filter(|path| {
                path.file_name()
                    .map(|name| name.to_string_lossy().starts_with(ROLLBACK_PREFIX))
                    .unwrap_or(false)
            })
            .collect();
        snapshots.sort();
        snapshots.pop()
    }

    /// Replace the data tree with the snapshot's contents: close the store,
    /// clear the tree, extract, reopen and migrate. Used only by the
    /// restore flow when verification fails or a phase errors out.
    pub fn execute(
        &self,
        coordinator: &StorageCoordinator,
        policy: &BackoffPolicy,
        snapshot: &Path,
    ) -> Result<()> {
        let mut reader = ArchiveReader::open(snapshot).map_err(VaultError::Validation)?;

        coordinator.close();
        super::clear_data_tree(&self.paths.data_dir, policy)?;

        // Rollback snapshots never carry emails, and this run's progress
        // bar must not jump around while the restore is being undone.
        let routes = EntryRoutes {
            data_root: self.paths.data_dir.clone(),
            email_root: None,
        };
        let quiet = ProgressTracker::new(Arc::new(NullSink));
        let extracted = reader.extract_entries(&routes, EXECUTE_SPAN, &quiet)?;

        coordinator.reopen()?;
        coordinator.run_migrations()?;
        info!(
            snapshot = %snapshot.display(),
            files = extracted,
            "[rollback] Data tree restored from pre-restore snapshot"
        );
        Ok(())
    }

    /// Delete every rollback file except `keep`. Failures are logged and
    /// ignored; a stale extra snapshot wastes disk, it does not block the
    /// restore that is about to run.
    fn purge_older(&self, keep: &Path) {
        let entries = match std::fs::read_dir(&self.paths.rollback_dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(error = %e, "[rollback] Could not list rollback directory for purge");
                return;
            }
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path == keep {
                continue;
            }
            if !entry
                .file_name()
                .to_string_lossy()
                .starts_with(ROLLBACK_PREFIX)
            {
                continue;
            }
            match std::fs::remove_file(&path) {
                Ok(()) => info!(path = %path.display(), "[rollback] Purged old snapshot"),
                Err(e) => warn!(
                    path = %path.display(),
                    error = %e,
                    "[rollback] Could not purge old snapshot"
                ),
            }
        }
    }
}

const EXECUTE_SPAN: ProgressSpan = ProgressSpan {
    phase: ProgressPhase::Extracting,
    floor: 0,
    span: 80,
    cap: 95,
};

fn snapshot_name(at: DateTime<Utc>) -> String {
    format!("{ROLLBACK_PREFIX}{}.zip", at.format("%Y%m%d-%H%M%S"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Operator;
    use chrono::Duration;
    use std::collections::BTreeMap;

    fn temp_paths(dir: &Path) -> VaultPaths {
        let config: crate::config::VaultConfig = toml::from_str(&format!(
            "[storage]\ndata_dir = {:?}",
            dir.join("data").to_string_lossy()
        ))
        .unwrap();
        let paths = VaultPaths::from_config(&config);
        paths.ensure_layout().unwrap();
        std::fs::write(paths.data_dir.join("records.db"), b"db").unwrap();
        paths
    }

    fn manifest_at(age: Duration) -> Manifest {
        let mut counts = BTreeMap::new();
        counts.insert("letters".to_string(), 0u64);
        let mut manifest = Manifest::new(&Operator::system(), 3, counts, false);
        manifest.backup_date = Utc::now() - age;
        manifest
    }

    fn tracker() -> ProgressTracker {
        ProgressTracker::new(Arc::new(NullSink))
    }

    fn rollback_files(paths: &VaultPaths) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(&paths.rollback_dir)
            .unwrap()
            .flatten()
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn creates_timestamp_named_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let paths = temp_paths(dir.path());
        let manager = RollbackManager::new(&paths);

        let mut manifest = manifest_at(Duration::zero());
        let snapshot = manager
            .create(&mut manifest, &tracker(), EXECUTE_SPAN)
            .unwrap();

        let name = snapshot.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with(ROLLBACK_PREFIX));
        assert!(name.ends_with(".zip"));
        assert!(!name.contains(':'));
        assert!(snapshot.exists());
    }

    #[test]
    fn retains_exactly_one_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let paths = temp_paths(dir.path());
        let manager = RollbackManager::new(&paths);

        for age_secs in [120, 60, 0] {
            let mut manifest = manifest_at(Duration::seconds(age_secs));
            manager
                .create(&mut manifest, &tracker(), EXECUTE_SPAN)
                .unwrap();
        }

        let files = rollback_files(&paths);
        assert_eq!(files.len(), 1);
        assert!(files[0].starts_with(ROLLBACK_PREFIX));
    }

    #[test]
    fn purge_leaves_foreign_files_alone() {
        let dir = tempfile::tempdir().unwrap();
        let paths = temp_paths(dir.path());
        std::fs::write(paths.rollback_dir.join("keep-me.txt"), b"x").unwrap();

        let manager = RollbackManager::new(&paths);
        let mut manifest = manifest_at(Duration::zero());
        manager
            .create(&mut manifest, &tracker(), EXECUTE_SPAN)
            .unwrap();

        let files = rollback_files(&paths);
        assert!(files.contains(&"keep-me.txt".to_string()));
        assert_eq!(files.len(), 2);
    }

    #[test]
    fn latest_picks_newest_by_name() {
        let dir = tempfile::tempdir().unwrap();
        let paths = temp_paths(dir.path());
        std::fs::write(
            paths.rollback_dir.join("pre-restore-20250101-000000.zip"),
            b"old",
        )
        .unwrap();
        std::fs::write(
            paths.rollback_dir.join("pre-restore-20250601-101500.zip"),
            b"new",
        )
        .unwrap();

        let manager = RollbackManager::new(&paths);
        let latest = manager.latest().unwrap();
        assert_eq!(
            latest.file_name().unwrap().to_string_lossy(),
            "pre-restore-20250601-101500.zip"
        );
    }

    #[test]
    fn latest_is_none_without_snapshots() {
        let dir = tempfile::tempdir().unwrap();
        let paths = temp_paths(dir.path());
        let manager = RollbackManager::new(&paths);
        assert!(manager.latest().is_none());
    }
}
