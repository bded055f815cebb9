//! Hash-linked append-only audit log.
//!
//! Every entry's hash covers its own content plus the previous entry's
//! hash, and the first entry links to a per-store random seed kept in
//! settings. Editing, reordering or deleting an interior entry breaks the
//! chain from that entry onward, which [`verify`] reports without needing
//! anything outside the store.

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::db::settings;
use crate::error::Result;
use crate::model::Operator;

/// Settings key holding the chain seed.
pub const SEED_KEY: &str = "audit_seed";

/// Action names written by the vault. The rest of the application has its
/// own vocabulary; these are only the ones this crate emits.
pub mod actions {
    pub const BACKUP_CREATED: &str = "backup-created";
    pub const BACKUP_FAILED: &str = "backup-failed";
    pub const RESTORE_COMPLETED: &str = "restore-completed";
    pub const RESTORE_FAILED: &str = "restore-failed";
    pub const ROLLBACK_CREATED: &str = "rollback-created";
    pub const ROLLBACK_PERFORMED: &str = "rollback-performed";
}

#[derive(Debug, Clone, Serialize)]
pub struct AuditEntry {
    pub seq: i64,
    pub at: String,
    pub action: String,
    pub actor_id: String,
    pub actor_name: String,
    pub entity_type: String,
    pub entity_id: String,
    pub details: String,
    pub previous_hash: String,
    pub hash: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChainVerification {
    pub entries: usize,
    pub ok: bool,
    /// Sequence number of the first entry that fails the check. Everything
    /// from here onward is untrustworthy.
    pub first_broken: Option<i64>,
}

pub(crate) fn sha256_hex(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// Read the chain seed, generating and storing one if the store predates
/// the audit feature.
pub(crate) fn ensure_seed(conn: &Connection) -> Result<String> {
    if let Some(seed) = settings::get(conn, SEED_KEY)? {
        return Ok(seed);
    }
    let seed = sha256_hex(Uuid::new_v4().as_bytes());
    settings::set(conn, SEED_KEY, &seed)?;
    tracing::info!("[audit] Generated chain seed");
    Ok(seed)
}

/// Append an entry to the chain.
pub fn append(
    conn: &Connection,
    action: &str,
    actor: &Operator,
    entity_type: &str,
    entity_id: &str,
    details: &serde_json::Value,
) -> Result<AuditEntry> {
    let tx = conn.unchecked_transaction()?;

    let previous_hash = match last_hash(&tx)? {
        Some(hash) => hash,
        None => ensure_seed(&tx)?,
    };
    let seq: i64 = tx.query_row("SELECT COALESCE(MAX(seq), 0) + 1 FROM audit_log", [], |row| {
        row.get(0)
    })?;

    let mut entry = AuditEntry {
        seq,
        at: Utc::now().to_rfc3339(),
        action: action.to_string(),
        actor_id: actor.id.clone(),
        actor_name: actor.display_name.clone(),
        entity_type: entity_type.to_string(),
        entity_id: entity_id.to_string(),
        details: details.to_string(),
        previous_hash,
        hash: String::new(),
    };
    entry.hash = compute_hash(&entry);

    tx.execute(
        "INSERT INTO audit_log
           (seq, at, action, actor_id, actor_name, entity_type, entity_id, details, previous_hash, hash)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            entry.seq,
            entry.at,
            entry.action,
            entry.actor_id,
            entry.actor_name,
            entry.entity_type,
            entry.entity_id,
            entry.details,
            entry.previous_hash,
            entry.hash,
        ],
    )?;
    tx.commit()?;
    Ok(entry)
}

/// Walk the whole chain and recompute every link. Read-only.
pub fn verify(conn: &Connection) -> Result<ChainVerification> {
    let seed = settings::get(conn, SEED_KEY)?.unwrap_or_default();
    let entries = entries(conn)?;

    let mut expected_previous = seed;
    for entry in &entries {
        if entry.previous_hash != expected_previous || entry.hash != compute_hash(entry) {
            return Ok(ChainVerification {
                entries: entries.len(),
                ok: false,
                first_broken: Some(entry.seq),
            });
        }
        expected_previous = entry.hash.clone();
    }
    Ok(ChainVerification {
        entries: entries.len(),
        ok: true,
        first_broken: None,
    })
}

pub fn entries(conn: &Connection) -> Result<Vec<AuditEntry>> {
    let mut stmt = conn.prepare(
        "SELECT seq, at, action, actor_id, actor_name, entity_type, entity_id, details, previous_hash, hash
         FROM audit_log ORDER BY seq ASC",
    )?;
    let rows = stmt.query_map([], row_to_entry)?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

fn row_to_entry(row: &Row) -> rusqlite::Result<AuditEntry> {
    Ok(AuditEntry {
        seq: row.get(0)?,
        at: row.get(1)?,
        action: row.get(2)?,
        actor_id: row.get(3)?,
        actor_name: row.get(4)?,
        entity_type: row.get(5)?,
        entity_id: row.get(6)?,
        details: row.get(7)?,
        previous_hash: row.get(8)?,
        hash: row.get(9)?,
    })
}

fn last_hash(conn: &Connection) -> Result<Option<String>> {
    let hash = conn
        .query_row(
            "SELECT hash FROM audit_log ORDER BY seq DESC LIMIT 1",
            [],
            |row| row.get(0),
        )
        .optional()?;
    Ok(hash)
}

/// Canonical hash input: pipe-joined fields in schema order, previous hash
/// last. Changing this breaks verification of every existing store, so it
/// must stay stable across releases.
fn compute_hash(entry: &AuditEntry) -> String {
    let line = format!(
        "{}|{}|{}|{}|{}|{}|{}|{}|{}",
        entry.seq,
        entry.at,
        entry.action,
        entry.actor_id,
        entry.actor_name,
        entry.entity_type,
        entry.entity_id,
        entry.details,
        entry.previous_hash,
    );
    sha256_hex(line.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

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
    fn first_entry_links_to_seed() {
        let conn = test_conn();
        let entry = append(
            &conn,
            actions::BACKUP_CREATED,
            &clerk(),
            "backup",
            "records-backup-20250601.zip",
            &json!({"size_bytes": 1024}),
        )
        .unwrap();

        let seed = settings::get(&conn, SEED_KEY).unwrap().unwrap();
        assert_eq!(entry.previous_hash, seed);
        assert_eq!(entry.seq, 1);
    }

    #[test]
    fn entries_chain_and_verify() {
        let conn = test_conn();
        let first = append(&conn, actions::BACKUP_CREATED, &clerk(), "backup", "a.zip", &json!({}))
            .unwrap();
        let second =
            append(&conn, actions::RESTORE_COMPLETED, &clerk(), "backup", "a.zip", &json!({}))
                .unwrap();

        assert_eq!(second.previous_hash, first.hash);
        assert_eq!(second.seq, 2);

        let check = verify(&conn).unwrap();
        assert!(check.ok);
        assert_eq!(check.entries, 2);
        assert_eq!(check.first_broken, None);
    }

    #[test]
    fn tampered_field_breaks_chain_from_that_entry() {
        let conn = test_conn();
        for i in 0..3 {
            append(
                &conn,
                actions::BACKUP_CREATED,
                &clerk(),
                "backup",
                &format!("b{i}.zip"),
                &json!({"n": i}),
            )
            .unwrap();
        }

        conn.execute(
            "UPDATE audit_log SET details = '{\"n\":99}' WHERE seq = 2",
            [],
        )
        .unwrap();

        let check = verify(&conn).unwrap();
        assert!(!check.ok);
        assert_eq!(check.first_broken, Some(2));
    }

    #[test]
    fn deleted_interior_entry_is_detected() {
        let conn = test_conn();
        for i in 0..3 {
            append(&conn, actions::BACKUP_CREATED, &clerk(), "backup", &format!("b{i}.zip"), &json!({}))
                .unwrap();
        }

        conn.execute("DELETE FROM audit_log WHERE seq = 2", []).unwrap();

        let check = verify(&conn).unwrap();
        assert!(!check.ok);
        assert_eq!(check.first_broken, Some(3));
    }

    #[test]
    fn empty_chain_verifies() {
        let conn = test_conn();
        let check = verify(&conn).unwrap();
        assert!(check.ok);
        assert_eq!(check.entries, 0);
    }
}
