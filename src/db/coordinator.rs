//! Storage engine lifecycle.
//!
//! The coordinator owns the connection pool and is the single authority for
//! checkpoint, close and reopen. Backup and restore reserve the store
//! through [`StorageCoordinator::begin_maintenance`]; while the returned
//! guard lives, ordinary [`StorageCoordinator::connection`] calls are
//! refused, which is what keeps a second operation (or the UI) from touching
//! files that are about to be replaced.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use tracing::{debug, info};

use super::{migrate, DbConn, DbPool};
use crate::error::{Result, VaultError};

const MAINT_NONE: u8 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaintenanceKind {
    Backup,
    Restore,
}

impl MaintenanceKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MaintenanceKind::Backup => "backup",
            MaintenanceKind::Restore => "restore",
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            MaintenanceKind::Backup => 1,
            MaintenanceKind::Restore => 2,
        }
    }

    fn from_u8(value: u8) -> Option<MaintenanceKind> {
        match value {
            1 => Some(MaintenanceKind::Backup),
            2 => Some(MaintenanceKind::Restore),
            _ => None,
        }
    }
}

pub struct StorageCoordinator {
    db_path: PathBuf,
    pool: Mutex<Option<DbPool>>,
    maintenance: AtomicU8,
}

impl StorageCoordinator {
    /// Open the store, creating the file on first run.
    pub fn open(db_path: PathBuf) -> Result<Self> {
        let pool = build_pool(&db_path)?;
        info!(path = %db_path.display(), "[storage] Store opened");
        Ok(StorageCoordinator {
            db_path,
            pool: Mutex::new(Some(pool)),
            maintenance: AtomicU8::new(MAINT_NONE),
        })
    }

    /// Get a connection for ordinary application work. Refused while a
    /// backup or restore owns the store.
    pub fn connection(&self) -> Result<DbConn> {
        if let Some(kind) = self.maintenance_kind() {
            return Err(VaultError::OperationInProgress(kind.as_str()));
        }
        self.raw_connection()
    }

    /// Connection for the operation that holds the maintenance token.
    /// Fails with [`VaultError::StorageClosed`] while the store is closed.
    pub fn connection_during_maintenance(&self, _guard: &MaintenanceGuard<'_>) -> Result<DbConn> {
        self.raw_connection()
    }

    /// Reserve the store for a backup or restore. Exactly one reservation
    /// can exist; a second request is rejected outright rather than queued,
    /// because the caller is an interactive user who should see "busy", not
    /// a hang. Dropping the guard releases the reservation on every exit
    /// path, including panics in the owning operation.
    pub fn begin_maintenance(&self, kind: MaintenanceKind) -> Result<MaintenanceGuard<'_>> {
        self.maintenance
            .compare_exchange(
                MAINT_NONE,
                kind.as_u8(),
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .map_err(|current| {
                let holder = MaintenanceKind::from_u8(current)
                    .map(MaintenanceKind::as_str)
                    .unwrap_or("maintenance");
                VaultError::OperationInProgress(holder)
            })?;
        info!(kind = kind.as_str(), "[storage] Maintenance reservation taken");
        Ok(MaintenanceGuard {
            coordinator: self,
            kind,
        })
    }

    pub fn maintenance_kind(&self) -> Option<MaintenanceKind> {
        MaintenanceKind::from_u8(self.maintenance.load(Ordering::SeqCst))
    }

    /// Flush the write-ahead log into the main store file so a filesystem
    /// copy of the file alone is self-consistent.
    pub fn checkpoint(&self) -> Result<()> {
        let conn = self.raw_connection()?;
        conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE)")?;
        debug!("[storage] WAL checkpoint complete");
        Ok(())
    }

    /// Close the store, releasing every file handle. Idempotent.
    pub fn close(&self) {
        let pool = self.pool_slot().take();
        match pool {
            Some(pool) => {
                // Best-effort final checkpoint; the pool drop closes handles
                if let Ok(conn) = pool.get() {
                    let _ = conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE)");
                }
                drop(pool);
                info!("[storage] Store closed");
            }
            None => debug!("[storage] Close requested but store already closed"),
        }
    }

    /// Reopen the store. A reopen on an already-open store is a no-op, so
    /// cleanup paths can call this unconditionally.
    pub fn reopen(&self) -> Result<()> {
        let mut slot = self.pool_slot();
        if slot.is_some() {
            debug!("[storage] Reopen requested but store already open");
            return Ok(());
        }
        *slot = Some(build_pool(&self.db_path)?);
        info!("[storage] Store reopened");
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        self.pool_slot().is_some()
    }

    /// Run schema migrations. Works during maintenance because the restore
    /// flow migrates right after reopening a restored store.
    pub fn run_migrations(&self) -> Result<i64> {
        let conn = self.raw_connection()?;
        migrate::run(&conn)
    }

    fn raw_connection(&self) -> Result<DbConn> {
        let pool = self.pool_slot().clone();
        match pool {
            Some(pool) => Ok(pool.get()?),
            None => Err(VaultError::StorageClosed),
        }
    }

    fn pool_slot(&self) -> MutexGuard<'_, Option<DbPool>> {
        self.pool.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// RAII maintenance token. See [`StorageCoordinator::begin_maintenance`].
pub struct MaintenanceGuard<'a> {
    coordinator: &'a StorageCoordinator,
    kind: MaintenanceKind,
}

impl MaintenanceGuard<'_> {
    pub fn kind(&self) -> MaintenanceKind {
        self.kind
    }
}

impl Drop for MaintenanceGuard<'_> {
    fn drop(&mut self) {
        self.coordinator
            .maintenance
            .store(MAINT_NONE, Ordering::SeqCst);
        info!(kind = self.kind.as_str(), "[storage] Maintenance reservation released");
    }
}

fn build_pool(db_path: &Path) -> Result<DbPool> {
    let manager = SqliteConnectionManager::file(db_path).with_init(|conn| {
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA foreign_keys = ON;",
        )
    });
    let pool = Pool::builder().max_size(4).build(manager)?;
    Ok(pool)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_temp() -> (tempfile::TempDir, StorageCoordinator) {
        let dir = tempfile::tempdir().unwrap();
        let coordinator = StorageCoordinator::open(dir.path().join("records.db")).unwrap();
        coordinator.run_migrations().unwrap();
        (dir, coordinator)
    }

    #[test]
    fn open_and_query() {
        let (_dir, coordinator) = open_temp();
        let conn = coordinator.connection().unwrap();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM users", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn close_and_reopen_are_idempotent() {
        let (_dir, coordinator) = open_temp();

        {
            let conn = coordinator.connection().unwrap();
            conn.execute(
                "INSERT INTO topics (id, title, created_at) VALUES ('t1', 'Budget', '2025-01-01T00:00:00Z')",
                [],
            )
            .unwrap();
        }

        coordinator.close();
        coordinator.close();
        assert!(!coordinator.is_open());
        assert!(matches!(
            coordinator.connection(),
            Err(VaultError::StorageClosed)
        ));

        coordinator.reopen().unwrap();
        coordinator.reopen().unwrap();
        assert!(coordinator.is_open());

        let conn = coordinator.connection().unwrap();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM topics", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn maintenance_reservation_is_exclusive() {
        let (_dir, coordinator) = open_temp();

        let guard = coordinator
            .begin_maintenance(MaintenanceKind::Restore)
            .unwrap();
        assert_eq!(coordinator.maintenance_kind(), Some(MaintenanceKind::Restore));

        // Second reservation and ordinary connections are refused
        assert!(matches!(
            coordinator.begin_maintenance(MaintenanceKind::Backup),
            Err(VaultError::OperationInProgress("restore"))
        ));
        assert!(matches!(
            coordinator.connection(),
            Err(VaultError::OperationInProgress("restore"))
        ));

        // The holder itself still gets connections
        coordinator.connection_during_maintenance(&guard).unwrap();

        drop(guard);
        assert_eq!(coordinator.maintenance_kind(), None);
        coordinator.connection().unwrap();
        coordinator
            .begin_maintenance(MaintenanceKind::Backup)
            .unwrap();
    }

    #[test]
    fn checkpoint_flushes_wal() {
        let (dir, coordinator) = open_temp();
        {
            let conn = coordinator.connection().unwrap();
            for i in 0..50 {
                conn.execute(
                    "INSERT INTO topics (id, title, created_at) VALUES (?1, ?2, '2025-01-01T00:00:00Z')",
                    rusqlite::params![format!("t{i}"), format!("Topic {i}")],
                )
                .unwrap();
            }
        }

        coordinator.checkpoint().unwrap();

        let wal = dir.path().join("records.db-wal");
        let wal_len = std::fs::metadata(&wal).map(|m| m.len()).unwrap_or(0);
        assert_eq!(wal_len, 0, "WAL should be truncated after checkpoint");
    }

    #[test]
    fn migrations_run_during_maintenance() {
        let (_dir, coordinator) = open_temp();
        let _guard = coordinator
            .begin_maintenance(MaintenanceKind::Restore)
            .unwrap();
        // raw access path used by the restore flow
        coordinator.run_migrations().unwrap();
    }
}
