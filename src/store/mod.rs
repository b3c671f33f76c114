//! Durable storage for pending actions.
//!
//! The store is the only state that survives a restart. Every write must be
//! committed before the call returns, so a caller that sees `Ok(())` can rely
//! on the action being there after a crash.

mod schema;
mod sqlite;

use std::time::Duration;

use crate::queue::QueuedAction;

pub use sqlite::SqliteStore;

/// Errors from the persistent store. Any of these means durability was not
/// confirmed.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
  #[error("failed to open queue database at {path}: {source}")]
  Open {
    path: String,
    #[source]
    source: rusqlite::Error,
  },

  #[error("failed to create queue directory {path}: {source}")]
  Directory {
    path: String,
    #[source]
    source: std::io::Error,
  },

  #[error("queue transaction failed: {0}")]
  Transaction(#[from] rusqlite::Error),

  #[error("stored action {id} is corrupt: {reason}")]
  Corrupt { id: String, reason: String },

  #[error("failed to encode action {id}: {source}")]
  Encode {
    id: String,
    #[source]
    source: serde_json::Error,
  },

  #[error("schema version {found} is not supported (this build knows 0 to {supported})")]
  UnsupportedVersion { found: i64, supported: i64 },

  #[error("background store task failed: {0}")]
  Task(#[from] tokio::task::JoinError),
}

/// Storage backend for the pending action log.
///
/// Implementations are synchronous; async callers move them onto the
/// blocking pool.
pub trait ActionStore: Send + Sync + 'static {
  /// Insert or overwrite an action by id. Returns after the write is durable.
  fn put(&self, action: &QueuedAction) -> Result<(), StoreError>;

  /// All stored actions in insertion order.
  fn get_all(&self) -> Result<Vec<QueuedAction>, StoreError>;

  /// Remove one action. Unknown ids are a no-op.
  fn delete(&self, id: &str) -> Result<(), StoreError>;

  /// Remove every action.
  fn clear(&self) -> Result<(), StoreError>;

  /// Take the drain lease for `owner` if it is free, expired, or already ours.
  fn try_acquire_lease(&self, owner: &str, ttl: Duration) -> Result<bool, StoreError>;

  /// Drop the drain lease if `owner` holds it.
  fn release_lease(&self, owner: &str) -> Result<(), StoreError>;
}
