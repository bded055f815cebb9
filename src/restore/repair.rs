//! Post-restore referential repair.
//!
//! Two concerns after an archive has been extracted and the store reopened:
//! the operator driving the restore may not exist in the restored identity
//! set, and foreign keys may dangle in data written before enforcement was
//! turned on. The missing operator is repaired so the session can continue;
//! everything else is reported, never silently altered.

use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use tracing::{info, warn};

use crate::error::Result;
use crate::model::Operator;

#[derive(Debug, Clone, Serialize)]
pub struct DanglingReference {
    pub table: String,
    pub rowid: Option<i64>,
    pub parent_table: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RepairReport {
    /// The operator was absent from the restored data and a placeholder
    /// account was created for them, flagged for a credential reset.
    pub operator_recreated: bool,
    pub dangling: Vec<DanglingReference>,
}

pub fn run(conn: &Connection, operator: &Operator) -> Result<RepairReport> {
    let operator_recreated = ensure_operator(conn, operator)?;
    let dangling = foreign_key_scan(conn)?;
    if !dangling.is_empty() {
        warn!(
            count = dangling.len(),
            "[repair] Dangling references found in restored data"
        );
    }
    Ok(RepairReport {
        operator_recreated,
        dangling,
    })
}

/// The archive may predate the operator's account. Without a row for them
/// the session they are restoring from points at nobody, so they get a
/// placeholder that must reset its credentials at next login.
fn ensure_operator(conn: &Connection, operator: &Operator) -> Result<bool> {
    let exists: Option<String> = conn
        .query_row(
            "SELECT id FROM users WHERE id = ?1",
            [&operator.id],
            |row| row.get(0),
        )
        .optional()?;
    if exists.is_some() {
        return Ok(false);
    }

    // The restored data may already use this username for someone else
    let username_taken: Option<String> = conn
        .query_row(
            "SELECT id FROM users WHERE username = ?1",
            [&operator.username],
            |row| row.get(0),
        )
        .optional()?;
    let username = match username_taken {
        Some(_) => format!(
            "{}-{}",
            operator.username,
            operator.id.get(..8).unwrap_or(&operator.id)
        ),
        None => operator.username.clone(),
    };

    conn.execute(
        "INSERT INTO users (id, username, display_name, password_hash, role, needs_credential_reset)
         VALUES (?1, ?2, ?3, '', 'clerk', 1)",
        params![operator.id, username, operator.display_name],
    )?;
    info!(
        user_id = %operator.id,
        username = %username,
        "[repair] Recreated missing operator account"
    );
    Ok(true)
}

/// `PRAGMA foreign_key_check` walks every declared foreign key and reports
/// rows whose parent is gone. Read-only.
fn foreign_key_scan(conn: &Connection) -> Result<Vec<DanglingReference>> {
    let mut stmt = conn.prepare("PRAGMA foreign_key_check")?;
    let rows = stmt.query_map([], |row| {
        Ok(DanglingReference {
            table: row.get(0)?,
            rowid: row.get(1)?,
            parent_table: row.get(2)?,
        })
    })?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        crate::db::migrate::run(&conn).unwrap();
        conn
    }

    fn clerk() -> Operator {
        Operator {
            id: "u1".to_string(),
            username: "clerk".to_string(),
            display_name: "Records Clerk".to_string(),
        }
    }

    #[test]
    fn present_operator_is_left_alone() {
        let conn = test_conn();
        conn.execute(
            "INSERT INTO users (id, username, display_name) VALUES ('u1', 'clerk', 'Records Clerk')",
            [],
        )
        .unwrap();

        let report = run(&conn, &clerk()).unwrap();
        assert!(!report.operator_recreated);

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM users", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn absent_operator_gets_flagged_placeholder() {
        let conn = test_conn();

        let report = run(&conn, &clerk()).unwrap();
        assert!(report.operator_recreated);

        let (username, flag): (String, i64) = conn
            .query_row(
                "SELECT username, needs_credential_reset FROM users WHERE id = 'u1'",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert_eq!(username, "clerk");
        assert_eq!(flag, 1);
    }

    #[test]
    fn username_collision_gets_a_suffix() {
        let conn = test_conn();
        // Same username, different identity
        conn.execute(
            "INSERT INTO users (id, username, display_name) VALUES ('other', 'clerk', 'Someone Else')",
            [],
        )
        .unwrap();

        let report = run(&conn, &clerk()).unwrap();
        assert!(report.operator_recreated);

        let username: String = conn
            .query_row("SELECT username FROM users WHERE id = 'u1'", [], |row| {
                row.get(0)
            })
            .unwrap();
        assert_eq!(username, "clerk-u1");
    }

    #[test]
    fn dangling_references_are_reported_not_fixed() {
        let conn = test_conn();
        // Foreign keys are off on a plain connection, so a dangling row
        // can be planted the way legacy data would carry one
        conn.execute(
            "INSERT INTO letters (id, topic_id, subject, created_at)
             VALUES ('l1', 'missing-topic', 'Lost parent', '2025-01-01T00:00:00Z')",
            [],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO users (id, username, display_name) VALUES ('u1', 'clerk', 'Records Clerk')",
            [],
        )
        .unwrap();

        let report = run(&conn, &clerk()).unwrap();
        assert_eq!(report.dangling.len(), 1);
        assert_eq!(report.dangling[0].table, "letters");
        assert_eq!(report.dangling[0].parent_table, "topics");

        // The row itself is untouched
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM letters WHERE id = 'l1'", [], |row| {
                row.get(0)
            })
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn clean_store_reports_nothing() {
        let conn = test_conn();
        conn.execute(
            "INSERT INTO users (id, username, display_name) VALUES ('u1', 'clerk', 'Records Clerk')",
            [],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO topics (id, title, created_at) VALUES ('t1', 'Budget', '2025-01-01T00:00:00Z')",
            [],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO letters (id, topic_id, subject, created_at)
             VALUES ('l1', 't1', 'Budget request', '2025-01-02T00:00:00Z')",
            [],
        )
        .unwrap();

        let report = run(&conn, &clerk()).unwrap();
        assert!(!report.operator_recreated);
        assert!(report.dangling.is_empty());
    }
}
