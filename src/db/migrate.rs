//! Schema creation and forward migrations.
//!
//! Runs at startup and again after every restore, because a restored
//! archive may carry a store written by an older build. `PRAGMA
//! user_version` records the shape of the store; column probes keep each
//! step idempotent so re-running on a current store is a no-op.

use rusqlite::{Connection, OptionalExtension};
use uuid::Uuid;

use crate::error::Result;

/// Version written by this build. Archives recording a higher number were
/// produced by a newer app and are rejected before restore.
pub const SCHEMA_VERSION: i64 = 3;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS users (
  id TEXT PRIMARY KEY,
  username TEXT NOT NULL UNIQUE,
  display_name TEXT NOT NULL DEFAULT '',
  password_hash TEXT NOT NULL DEFAULT '',
  role TEXT NOT NULL DEFAULT 'clerk' CHECK(role IN ('clerk','manager','admin')),
  created_at TEXT NOT NULL DEFAULT (datetime('now')),
  deleted_at TEXT
);

CREATE TABLE IF NOT EXISTS topics (
  id TEXT PRIMARY KEY,
  title TEXT NOT NULL,
  description TEXT NOT NULL DEFAULT '',
  created_at TEXT NOT NULL DEFAULT (datetime('now')),
  deleted_at TEXT
);

CREATE TABLE IF NOT EXISTS letters (
  id TEXT PRIMARY KEY,
  topic_id TEXT REFERENCES topics(id),
  subject TEXT NOT NULL,
  sender TEXT NOT NULL DEFAULT '',
  recipient TEXT NOT NULL DEFAULT '',
  received_date TEXT,
  attachment_path TEXT,
  created_at TEXT NOT NULL DEFAULT (datetime('now')),
  deleted_at TEXT
);

CREATE TABLE IF NOT EXISTS minutes (
  id TEXT PRIMARY KEY,
  topic_id TEXT REFERENCES topics(id),
  meeting_date TEXT NOT NULL,
  content TEXT NOT NULL DEFAULT '',
  created_at TEXT NOT NULL DEFAULT (datetime('now')),
  deleted_at TEXT
);

CREATE TABLE IF NOT EXISTS issues (
  id TEXT PRIMARY KEY,
  topic_id TEXT REFERENCES topics(id),
  title TEXT NOT NULL,
  status TEXT NOT NULL DEFAULT 'open' CHECK(status IN ('open','in_progress','closed')),
  created_at TEXT NOT NULL DEFAULT (datetime('now')),
  deleted_at TEXT
);

CREATE TABLE IF NOT EXISTS attendance (
  id TEXT PRIMARY KEY,
  minute_id TEXT NOT NULL REFERENCES minutes(id),
  attendee TEXT NOT NULL,
  present INTEGER NOT NULL DEFAULT 1,
  created_at TEXT NOT NULL DEFAULT (datetime('now')),
  deleted_at TEXT
);

CREATE TABLE IF NOT EXISTS credentials (
  id TEXT PRIMARY KEY,
  user_id TEXT NOT NULL REFERENCES users(id),
  label TEXT NOT NULL DEFAULT '',
  secret_hash TEXT NOT NULL DEFAULT '',
  rotated_at TEXT,
  created_at TEXT NOT NULL DEFAULT (datetime('now')),
  deleted_at TEXT
);

CREATE TABLE IF NOT EXISTS sessions (
  id TEXT PRIMARY KEY,
  user_id TEXT NOT NULL REFERENCES users(id),
  created_at TEXT NOT NULL DEFAULT (datetime('now')),
  expires_at TEXT NOT NULL,
  revoked_at TEXT
);

CREATE TABLE IF NOT EXISTS settings (
  key TEXT PRIMARY KEY,
  value TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS audit_log (
  seq INTEGER PRIMARY KEY,
  at TEXT NOT NULL,
  action TEXT NOT NULL,
  actor_id TEXT NOT NULL,
  actor_name TEXT NOT NULL,
  entity_type TEXT NOT NULL,
  entity_id TEXT NOT NULL,
  details TEXT NOT NULL DEFAULT '{}',
  previous_hash TEXT NOT NULL,
  hash TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_letters_topic_id ON letters(topic_id);
CREATE INDEX IF NOT EXISTS idx_minutes_topic_id ON minutes(topic_id);
CREATE INDEX IF NOT EXISTS idx_issues_topic_id ON issues(topic_id);
CREATE INDEX IF NOT EXISTS idx_attendance_minute_id ON attendance(minute_id);
CREATE INDEX IF NOT EXISTS idx_sessions_user_id ON sessions(user_id);
"#;

/// Bring the store up to [`SCHEMA_VERSION`]. Returns the version found
/// before migrating so callers can log whether anything happened.
pub fn run(conn: &Connection) -> Result<i64> {
    let from: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;

    if from >= SCHEMA_VERSION {
        ensure_audit_seed(conn)?;
        return Ok(from);
    }

    tracing::info!(from, to = SCHEMA_VERSION, "[DB] Migrating store schema");

    conn.execute_batch(SCHEMA)?;

    // v2: operators restored into a store they do not exist in get a
    // placeholder account that must reset its credentials
    if !has_column(conn, "users", "needs_credential_reset")? {
        conn.execute_batch(
            "ALTER TABLE users ADD COLUMN needs_credential_reset INTEGER NOT NULL DEFAULT 0",
        )?;
    }

    // v3: registry reference codes on letters
    if !has_column(conn, "letters", "reference_code")? {
        conn.execute_batch("ALTER TABLE letters ADD COLUMN reference_code TEXT")?;
    }

    ensure_audit_seed(conn)?;
    conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;

    tracing::info!("[DB] Migration completed successfully");
    Ok(from)
}

/// Column probe for idempotent ALTER TABLE migrations.
pub fn has_column(conn: &Connection, table: &str, column: &str) -> Result<bool> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
    let names = stmt.query_map([], |row| row.get::<_, String>(1))?;
    for name in names {
        if name? == column {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Every store gets a random audit chain seed on first migration. The seed
/// anchors the first entry's previous_hash; without one, an attacker could
/// truncate the chain from the front undetected.
fn ensure_audit_seed(conn: &Connection) -> Result<()> {
    let existing: Option<String> = conn
        .query_row(
            "SELECT value FROM settings WHERE key = ?1",
            [crate::audit::SEED_KEY],
            |row| row.get(0),
        )
        .optional()?;
    if existing.is_none() {
        let seed = crate::audit::sha256_hex(Uuid::new_v4().as_bytes());
        conn.execute(
            "INSERT INTO settings (key, value) VALUES (?1, ?2)",
            rusqlite::params![crate::audit::SEED_KEY, seed],
        )?;
        tracing::info!("[DB] Generated audit chain seed");
    }
    Ok(())
}
