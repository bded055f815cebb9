//! The fixed enumeration of record modules.
//!
//! Manifests carry one count per module so two archives (or an archive and
//! the live system) can be compared without opening either store. Soft
//! deletion means a row only counts while `deleted_at` is null.

use std::collections::BTreeMap;

use rusqlite::Connection;

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordModule {
    Users,
    Topics,
    Letters,
    Minutes,
    Issues,
    Attendance,
    Credentials,
}

impl RecordModule {
    pub const ALL: [RecordModule; 7] = [
        RecordModule::Users,
        RecordModule::Topics,
        RecordModule::Letters,
        RecordModule::Minutes,
        RecordModule::Issues,
        RecordModule::Attendance,
        RecordModule::Credentials,
    ];

    /// Stable key used in manifests and comparison output.
    pub fn key(self) -> &'static str {
        match self {
            RecordModule::Users => "users",
            RecordModule::Topics => "topics",
            RecordModule::Letters => "letters",
            RecordModule::Minutes => "minutes",
            RecordModule::Issues => "issues",
            RecordModule::Attendance => "attendance",
            RecordModule::Credentials => "credentials",
        }
    }

    /// Table backing the module. Identical to the key today, but manifests
    /// must not silently start tracking renamed tables if that changes.
    pub fn table(self) -> &'static str {
        self.key()
    }

    pub fn from_key(key: &str) -> Option<RecordModule> {
        RecordModule::ALL.iter().copied().find(|m| m.key() == key)
    }
}

/// Count non-deleted rows per module, keyed by the manifest module key.
pub fn module_counts(conn: &Connection) -> Result<BTreeMap<String, u64>> {
    let mut counts = BTreeMap::new();
    for module in RecordModule::ALL {
        let count: i64 = conn.query_row(
            &format!(
                "SELECT COUNT(*) FROM {} WHERE deleted_at IS NULL",
                module.table()
            ),
            [],
            |row| row.get(0),
        )?;
        counts.insert(module.key().to_string(), count.max(0) as u64);
    }
    Ok(counts)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_round_trip() {
        for module in RecordModule::ALL {
            assert_eq!(RecordModule::from_key(module.key()), Some(module));
        }
        assert_eq!(RecordModule::from_key("payroll"), None);
    }

    #[test]
    fn counts_skip_soft_deleted_rows() {
        let conn = Connection::open_in_memory().unwrap();
        crate::db::migrate::run(&conn).unwrap();

        conn.execute(
            "INSERT INTO topics (id, title, created_at) VALUES ('t1', 'Budget', '2025-01-01T00:00:00Z')",
            [],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO topics (id, title, created_at, deleted_at)
             VALUES ('t2', 'Old', '2025-01-01T00:00:00Z', '2025-02-01T00:00:00Z')",
            [],
        )
        .unwrap();

        let counts = module_counts(&conn).unwrap();
        assert_eq!(counts["topics"], 1);
        assert_eq!(counts["letters"], 0);
        assert_eq!(counts.len(), RecordModule::ALL.len());
    }
}
