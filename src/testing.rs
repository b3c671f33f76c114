//! Shared fixtures for unit tests.

use futures::future::BoxFuture;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::Notify;
use url::Url;

use crate::http::{Request, Response, Transport, TransportError};
use crate::queue::QueuedAction;
use crate::store::{ActionStore, SqliteStore, StoreError};

/// A fresh on-disk store. Keep the directory alive for the test's duration.
pub fn temp_store() -> (TempDir, SqliteStore) {
  let dir = TempDir::new().unwrap();
  let store = SqliteStore::open(dir.path().join("queue.db")).unwrap();
  (dir, store)
}

/// A store whose every operation fails, as if storage were disabled.
pub struct FailingStore;

fn unavailable() -> StoreError {
  StoreError::Transaction(rusqlite::Error::InvalidQuery)
}

impl ActionStore for FailingStore {
  fn put(&self, _action: &QueuedAction) -> Result<(), StoreError> {
    Err(unavailable())
  }

  fn get_all(&self) -> Result<Vec<QueuedAction>, StoreError> {
    Err(unavailable())
  }

  fn delete(&self, _id: &str) -> Result<(), StoreError> {
    Err(unavailable())
  }

  fn clear(&self) -> Result<(), StoreError> {
    Err(unavailable())
  }

  fn try_acquire_lease(&self, _owner: &str, _ttl: Duration) -> Result<bool, StoreError> {
    Err(unavailable())
  }

  fn release_lease(&self, _owner: &str) -> Result<(), StoreError> {
    Err(unavailable())
  }
}

/// Wraps a real store; the next `get_all` after [`SlowStore::delay_next_read`]
/// takes `delay` before reading.
#[derive(Clone)]
pub struct SlowStore {
  inner: SqliteStore,
  delay: Duration,
  armed: Arc<AtomicBool>,
}

impl SlowStore {
  pub fn new(inner: SqliteStore, delay: Duration) -> Self {
    Self {
      inner,
      delay,
      armed: Arc::new(AtomicBool::new(false)),
    }
  }

  pub fn delay_next_read(&self) {
    self.armed.store(true, Ordering::SeqCst);
  }
}

impl ActionStore for SlowStore {
  fn put(&self, action: &QueuedAction) -> Result<(), StoreError> {
    self.inner.put(action)
  }

  fn get_all(&self) -> Result<Vec<QueuedAction>, StoreError> {
    if self.armed.swap(false, Ordering::SeqCst) {
      // Read first, then stall, so the result is already stale on return
      let snapshot = self.inner.get_all();
      std::thread::sleep(self.delay);
      return snapshot;
    }
    self.inner.get_all()
  }

  fn delete(&self, id: &str) -> Result<(), StoreError> {
    self.inner.delete(id)
  }

  fn clear(&self) -> Result<(), StoreError> {
    self.inner.clear()
  }

  fn try_acquire_lease(&self, owner: &str, ttl: Duration) -> Result<bool, StoreError> {
    self.inner.try_acquire_lease(owner, ttl)
  }

  fn release_lease(&self, owner: &str) -> Result<(), StoreError> {
    self.inner.release_lease(owner)
  }
}

/// Local HTTP server that accepts connections and never answers.
pub async fn hanging_server() -> Url {
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let addr = listener.local_addr().unwrap();
  tokio::spawn(async move {
    let mut held = Vec::new();
    while let Ok((socket, _)) = listener.accept().await {
      held.push(socket);
    }
  });
  Url::parse(&format!("http://{}", addr)).unwrap()
}

/// Local HTTP server that writes `head` (status line, headers and the start
/// of a body shorter than its Content-Length) and then closes its side.
pub async fn truncating_server(head: &'static str) -> Url {
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let addr = listener.local_addr().unwrap();
  tokio::spawn(async move {
    while let Ok((mut socket, _)) = listener.accept().await {
      tokio::spawn(async move {
        let mut buf = [0u8; 4096];
        let _ = socket.read(&mut buf).await;
        let _ = socket.write_all(head.as_bytes()).await;
        let _ = socket.shutdown().await;
        // Drain until the client gives up so the close is clean
        while matches!(socket.read(&mut buf).await, Ok(n) if n > 0) {}
      });
    }
  });
  Url::parse(&format!("http://{}", addr)).unwrap()
}

/// Collects every snapshot a queue listener receives.
#[derive(Clone, Default)]
pub struct Recorder {
  seen: Arc<Mutex<Vec<Vec<QueuedAction>>>>,
}

impl Recorder {
  pub fn listener(&self) -> impl Fn(&[QueuedAction]) + Send + Sync + 'static {
    let seen = Arc::clone(&self.seen);
    move |pending: &[QueuedAction]| seen.lock().unwrap().push(pending.to_vec())
  }

  pub fn lengths(&self) -> Vec<usize> {
    self.seen.lock().unwrap().iter().map(Vec::len).collect()
  }

  pub fn last(&self) -> Option<Vec<QueuedAction>> {
    self.seen.lock().unwrap().last().cloned()
  }
}

#[derive(Clone)]
enum Outcome {
  Status(u16, String),
  Fail(TransportError),
}

#[derive(Default)]
struct Script {
  queued: HashMap<String, VecDeque<Outcome>>,
  calls: Vec<Request>,
  hanging: HashSet<String>,
  gates: HashMap<String, Arc<Notify>>,
}

/// Transport with per-path scripted outcomes. Paths without a script answer
/// `200 {}`.
#[derive(Clone, Default)]
pub struct ScriptedTransport {
  script: Arc<Mutex<Script>>,
}

impl ScriptedTransport {
  pub fn new() -> Self {
    Self::default()
  }

  /// Answer the next request to `path` with `status`.
  pub fn respond(&self, path: &str, status: u16, body: &str) {
    self.push(path, Outcome::Status(status, body.to_string()));
  }

  /// Fail the next request to `path` as if the connection were refused.
  pub fn refuse(&self, path: &str) {
    self.push(
      path,
      Outcome::Fail(TransportError::Network("connection refused".to_string())),
    );
  }

  /// Requests to `path` never complete.
  pub fn hang(&self, path: &str) {
    self.script.lock().unwrap().hanging.insert(path.to_string());
  }

  /// Requests to `path` wait until the returned handle is notified.
  pub fn gate(&self, path: &str) -> Arc<Notify> {
    let gate = Arc::new(Notify::new());
    self
      .script
      .lock()
      .unwrap()
      .gates
      .insert(path.to_string(), Arc::clone(&gate));
    gate
  }

  pub fn calls(&self) -> Vec<Request> {
    self.script.lock().unwrap().calls.clone()
  }

  /// Paths requested so far, in order.
  pub fn paths(&self) -> Vec<String> {
    self
      .calls()
      .iter()
      .map(|r| r.url.path().to_string())
      .collect()
  }

  fn push(&self, path: &str, outcome: Outcome) {
    self
      .script
      .lock()
      .unwrap()
      .queued
      .entry(path.to_string())
      .or_default()
      .push_back(outcome);
  }
}

impl Transport for ScriptedTransport {
  fn send<'a>(&'a self, request: &'a Request) -> BoxFuture<'a, Result<Response, TransportError>> {
    Box::pin(async move {
      let path = request.url.path().to_string();

      let (outcome, hang, gate) = {
        let mut script = self.script.lock().unwrap();
        script.calls.push(request.clone());
        let scripted = script.queued.get_mut(&path).and_then(VecDeque::pop_front);
        let outcome = scripted.unwrap_or_else(|| Outcome::Status(200, "{}".to_string()));
        (
          outcome,
          script.hanging.contains(&path),
          script.gates.get(&path).cloned(),
        )
      };

      if hang {
        futures::future::pending::<()>().await;
      }
      if let Some(gate) = gate {
        gate.notified().await;
      }

      match outcome {
        Outcome::Status(status, body) => Ok(Response { status, body }),
        Outcome::Fail(e) => Err(e),
      }
    })
  }
}
