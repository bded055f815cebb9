//! SQLite storage: pool lifecycle, schema migrations, settings and
//! session bookkeeping.

pub mod coordinator;
pub mod migrate;
pub mod sessions;
pub mod settings;

pub use coordinator::{MaintenanceGuard, MaintenanceKind, StorageCoordinator};

use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;

pub type DbPool = Pool<SqliteConnectionManager>;
pub type DbConn = r2d2::PooledConnection<SqliteConnectionManager>;
