//! SQLite implementation of the action store.

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use super::schema;
use super::{ActionStore, StoreError};
use crate::queue::{Method, QueuedAction};

/// How long a connection waits on another process's write lock.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const LEASE_NAME: &str = "drain";

/// SQLite-backed store.
///
/// Only the path is kept. Each operation opens its own connection, runs one
/// transaction and closes the connection again, so several processes can
/// share the file without anyone holding it open.
#[derive(Debug, Clone)]
pub struct SqliteStore {
  path: PathBuf,
}

impl SqliteStore {
  /// Open (creating if needed) the store at `path` and run migrations.
  pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
    let path = path.into();

    // Ensure parent directory exists
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
      std::fs::create_dir_all(parent).map_err(|source| StoreError::Directory {
        path: parent.display().to_string(),
        source,
      })?;
    }

    let store = Self { path };
    let mut conn = store.connect()?;
    conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| {
      row.get::<_, String>(0)
    })?;
    schema::migrate(&mut conn)?;

    debug!(path = %store.path.display(), "queue store opened");
    Ok(store)
  }

  /// Get the default database path.
  pub fn default_path() -> Option<PathBuf> {
    dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .map(|dir| dir.join("mutq").join("queue.db"))
  }

  pub fn path(&self) -> &Path {
    &self.path
  }

  fn connect(&self) -> Result<Connection, StoreError> {
    let conn = Connection::open(&self.path).map_err(|source| StoreError::Open {
      path: self.path.display().to_string(),
      source,
    })?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    conn.pragma_update(None, "synchronous", "FULL")?;
    Ok(conn)
  }
}

impl ActionStore for SqliteStore {
  fn put(&self, action: &QueuedAction) -> Result<(), StoreError> {
    let headers = serde_json::to_string(&action.headers).map_err(|source| StoreError::Encode {
      id: action.id.clone(),
      source,
    })?;

    let mut conn = self.connect()?;
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    // Overwrites keep the original seq, so the action keeps its place in line
    tx.execute(
      "INSERT INTO pending_actions (id, method, endpoint, body, headers, created_at)
       VALUES (?1, ?2, ?3, ?4, ?5, ?6)
       ON CONFLICT(id) DO UPDATE SET
         method = excluded.method,
         endpoint = excluded.endpoint,
         body = excluded.body,
         headers = excluded.headers,
         created_at = excluded.created_at",
      params![
        action.id,
        action.method.as_str(),
        action.endpoint,
        action.body,
        headers,
        action.created_at.to_rfc3339_opts(SecondsFormat::Nanos, true),
      ],
    )?;
    tx.commit()?;

    Ok(())
  }

  fn get_all(&self) -> Result<Vec<QueuedAction>, StoreError> {
    let mut conn = self.connect()?;
    let tx = conn.transaction()?;

    let rows: Vec<RawAction> = {
      let mut stmt = tx.prepare(
        "SELECT id, method, endpoint, body, headers, created_at
         FROM pending_actions
         ORDER BY seq",
      )?;
      let rows = stmt.query_map([], |row| {
        Ok(RawAction {
          id: row.get(0)?,
          method: row.get(1)?,
          endpoint: row.get(2)?,
          body: row.get(3)?,
          headers: row.get(4)?,
          created_at: row.get(5)?,
        })
      })?;
      rows.collect::<Result<_, _>>()?
    };
    tx.commit()?;

    rows.into_iter().map(RawAction::decode).collect()
  }

  fn delete(&self, id: &str) -> Result<(), StoreError> {
    let mut conn = self.connect()?;
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    tx.execute("DELETE FROM pending_actions WHERE id = ?1", params![id])?;
    tx.commit()?;
    Ok(())
  }

  fn clear(&self) -> Result<(), StoreError> {
    let mut conn = self.connect()?;
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    tx.execute("DELETE FROM pending_actions", [])?;
    tx.commit()?;
    Ok(())
  }

  fn try_acquire_lease(&self, owner: &str, ttl: Duration) -> Result<bool, StoreError> {
    let now = Utc::now().timestamp_millis();
    let expires_at = now.saturating_add(i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX));

    let mut conn = self.connect()?;
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    let held: Option<(String, i64)> = tx
      .query_row(
        "SELECT owner, expires_at FROM drain_lease WHERE name = ?1",
        params![LEASE_NAME],
        |row| Ok((row.get(0)?, row.get(1)?)),
      )
      .optional()?;

    let free = match held {
      None => true,
      Some((holder, holder_expires)) => holder == owner || holder_expires <= now,
    };

    if free {
      tx.execute(
        "INSERT INTO drain_lease (name, owner, expires_at) VALUES (?1, ?2, ?3)
         ON CONFLICT(name) DO UPDATE SET owner = excluded.owner, expires_at = excluded.expires_at",
        params![LEASE_NAME, owner, expires_at],
      )?;
    }
    tx.commit()?;

    Ok(free)
  }

  fn release_lease(&self, owner: &str) -> Result<(), StoreError> {
    let mut conn = self.connect()?;
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    tx.execute(
      "DELETE FROM drain_lease WHERE name = ?1 AND owner = ?2",
      params![LEASE_NAME, owner],
    )?;
    tx.commit()?;
    Ok(())
  }
}

/// A row as read from SQLite, before validation.
struct RawAction {
  id: String,
  method: String,
  endpoint: String,
  body: Option<String>,
  headers: String,
  created_at: String,
}

impl RawAction {
  fn decode(self) -> Result<QueuedAction, StoreError> {
    let corrupt = |reason: String| StoreError::Corrupt {
      id: self.id.clone(),
      reason,
    };

    let method: Method = self.method.parse().map_err(corrupt)?;
    let headers: BTreeMap<String, String> =
      serde_json::from_str(&self.headers).map_err(|e| corrupt(format!("headers: {}", e)))?;
    let created_at = DateTime::parse_from_rfc3339(&self.created_at)
      .map_err(|e| corrupt(format!("created_at: {}", e)))?
      .with_timezone(&Utc);

    Ok(QueuedAction {
      id: self.id.clone(),
      method,
      endpoint: self.endpoint.clone(),
      body: self.body.clone(),
      headers,
      created_at,
    })
  }
}
