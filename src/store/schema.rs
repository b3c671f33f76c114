//! Versioned schema for the queue database.
//!
//! The version lives in `PRAGMA user_version`. Each step runs in its own
//! transaction and must leave `pending_actions` rows intact.

use rusqlite::Connection;
use tracing::info;

use super::StoreError;

/// Initial layout: the pending action log.
pub(super) const V1: &str = r#"
CREATE TABLE IF NOT EXISTS pending_actions (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    id TEXT NOT NULL UNIQUE,
    method TEXT NOT NULL,
    endpoint TEXT NOT NULL,
    body TEXT,
    headers TEXT NOT NULL DEFAULT '{}',
    created_at TEXT NOT NULL
);
"#;

/// Single-row lease so only one process drains at a time.
const V2: &str = r#"
CREATE TABLE IF NOT EXISTS drain_lease (
    name TEXT PRIMARY KEY,
    owner TEXT NOT NULL,
    expires_at INTEGER NOT NULL
);
"#;

const MIGRATIONS: &[&str] = &[V1, V2];

pub(super) const LATEST_VERSION: i64 = MIGRATIONS.len() as i64;

/// Bring the database up to [`LATEST_VERSION`].
pub(super) fn migrate(conn: &mut Connection) -> Result<(), StoreError> {
  let current: i64 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;

  if !(0..=LATEST_VERSION).contains(&current) {
    return Err(StoreError::UnsupportedVersion {
      found: current,
      supported: LATEST_VERSION,
    });
  }

  for (index, step) in MIGRATIONS.iter().enumerate().skip(current as usize) {
    let version = index as i64 + 1;
    let tx = conn.transaction()?;
    tx.execute_batch(step)?;
    tx.pragma_update(None, "user_version", version)?;
    tx.commit()?;
    info!(version, "queue schema migrated");
  }

  Ok(())
}
