//! Login session bookkeeping.
//!
//! The vault itself only needs [`revoke_all`]: after a restore, every open
//! session refers to a user table that may no longer contain its user, so
//! all of them are invalidated and clients re-authenticate.

use chrono::{Duration, Utc};
use rusqlite::{params, Connection};
use uuid::Uuid;

use crate::error::Result;

pub fn create(conn: &Connection, user_id: &str, ttl_hours: i64) -> Result<String> {
    let id = Uuid::new_v4().to_string();
    let now = Utc::now();
    let expires = now + Duration::hours(ttl_hours);
    conn.execute(
        "INSERT INTO sessions (id, user_id, created_at, expires_at) VALUES (?1, ?2, ?3, ?4)",
        params![id, user_id, now.to_rfc3339(), expires.to_rfc3339()],
    )?;
    Ok(id)
}

pub fn active_count(conn: &Connection) -> Result<u64> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sessions WHERE revoked_at IS NULL AND expires_at > ?1",
        [Utc::now().to_rfc3339()],
        |row| row.get(0),
    )?;
    Ok(count.max(0) as u64)
}

/// Revoke every live session. Returns how many were revoked.
pub fn revoke_all(conn: &Connection) -> Result<usize> {
    let revoked = conn.execute(
        "UPDATE sessions SET revoked_at = ?1 WHERE revoked_at IS NULL",
        [Utc::now().to_rfc3339()],
    )?;
    Ok(revoked)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conn_with_user() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        crate::db::migrate::run(&conn).unwrap();
        conn.execute(
            "INSERT INTO users (id, username, display_name) VALUES ('u1', 'clerk', 'Clerk')",
            [],
        )
        .unwrap();
        conn
    }

    #[test]
    fn create_then_revoke_all() {
        let conn = conn_with_user();

        create(&conn, "u1", 8).unwrap();
        create(&conn, "u1", 8).unwrap();
        assert_eq!(active_count(&conn).unwrap(), 2);

        assert_eq!(revoke_all(&conn).unwrap(), 2);
        assert_eq!(active_count(&conn).unwrap(), 0);

        // Nothing left to revoke on a second pass
        assert_eq!(revoke_all(&conn).unwrap(), 0);
    }

    #[test]
    fn expired_sessions_are_not_active() {
        let conn = conn_with_user();
        create(&conn, "u1", -1).unwrap();
        assert_eq!(active_count(&conn).unwrap(), 0);
        // but they still count as revocable until marked
        assert_eq!(revoke_all(&conn).unwrap(), 1);
    }
}
