//! Queue manager: the single boundary in front of the store, plus an
//! in-process observer registry.

use chrono::Utc;
use std::sync::{Arc, Mutex, Weak};
use tracing::{info, warn};

use super::{NewAction, QueueError, QueuedAction};
use crate::store::{ActionStore, StoreError};

type Listener = Arc<dyn Fn(&[QueuedAction]) + Send + Sync>;

#[derive(Default)]
struct Registry {
  next_id: u64,
  listeners: Vec<(u64, Listener)>,
}

/// Owns all reads and writes to the action store and tells observers about
/// every change.
///
/// Observers are process-local and never persisted; they have to be
/// registered again after a restart.
pub struct QueueManager<S: ActionStore> {
  store: Arc<S>,
  registry: Arc<Mutex<Registry>>,
  /// Held across each read-then-broadcast so snapshots reach listeners in
  /// the order they were read
  delivery: Arc<tokio::sync::Mutex<()>>,
}

impl<S: ActionStore> QueueManager<S> {
  pub fn new(store: S) -> Self {
    Self {
      store: Arc::new(store),
      registry: Arc::new(Mutex::new(Registry::default())),
      delivery: Arc::new(tokio::sync::Mutex::new(())),
    }
  }

  /// Run a store operation on the blocking pool.
  pub(crate) async fn with_store<T, F>(&self, op: F) -> Result<T, StoreError>
  where
    T: Send + 'static,
    F: FnOnce(&S) -> Result<T, StoreError> + Send + 'static,
  {
    let store = Arc::clone(&self.store);
    tokio::task::spawn_blocking(move || op(store.as_ref())).await?
  }

  /// Persist a new pending action and notify observers.
  ///
  /// Returns only after the action is durable. If the store fails the error
  /// is returned and nobody is notified.
  pub async fn enqueue(&self, new: NewAction) -> Result<QueuedAction, QueueError> {
    if !new.method.is_mutation() {
      return Err(QueueError::NotAMutation(new.method));
    }

    let action = new.into_queued(Utc::now());
    let stored = action.clone();
    self.with_store(move |store| store.put(&stored)).await?;

    info!(
      id = %action.id,
      method = %action.method,
      endpoint = %action.endpoint,
      "action queued for later sync"
    );

    self.notify_quietly().await;
    Ok(action)
  }

  /// Remove a replayed action and notify observers.
  pub async fn remove(&self, id: &str) -> Result<(), QueueError> {
    let id = id.to_string();
    self.with_store(move |store| store.delete(&id)).await?;
    self.notify_quietly().await;
    Ok(())
  }

  /// Drop every pending action. Meant for explicit resets such as logout.
  pub async fn clear(&self) -> Result<(), QueueError> {
    self.with_store(|store| store.clear()).await?;
    warn!("pending action queue cleared");
    self.notify_quietly().await;
    Ok(())
  }

  /// Current pending actions in replay order.
  pub async fn pending(&self) -> Result<Vec<QueuedAction>, QueueError> {
    Ok(self.with_store(|store| store.get_all()).await?)
  }

  /// Register a listener. It is called right away with the current list and
  /// again after every change until the subscription is dropped.
  pub async fn subscribe<F>(&self, listener: F) -> Result<Subscription, QueueError>
  where
    F: Fn(&[QueuedAction]) + Send + Sync + 'static,
  {
    let listener: Listener = Arc::new(listener);
    let _delivery = self.delivery.lock().await;

    let id = {
      let mut registry = lock(&self.registry);
      let id = registry.next_id;
      registry.next_id += 1;
      registry.listeners.push((id, Arc::clone(&listener)));
      id
    };

    let subscription = Subscription {
      id,
      registry: Arc::downgrade(&self.registry),
    };

    let current = self.pending().await?;
    listener(&current);

    Ok(subscription)
  }

  /// Read the store and send the fresh list to every listener. Returns the
  /// list that was sent.
  pub async fn notify(&self) -> Result<Vec<QueuedAction>, QueueError> {
    let _delivery = self.delivery.lock().await;
    let current = self.pending().await?;
    self.broadcast(&current);
    Ok(current)
  }

  pub fn listener_count(&self) -> usize {
    lock(&self.registry).listeners.len()
  }

  /// The write already succeeded, so a failed re-read only costs observers
  /// one update.
  async fn notify_quietly(&self) {
    if let Err(e) = self.notify().await {
      warn!(error = %e, "failed to refresh queue observers");
    }
  }

  fn broadcast(&self, snapshot: &[QueuedAction]) {
    // Call listeners outside the lock so they may subscribe or unsubscribe
    let listeners: Vec<Listener> = lock(&self.registry)
      .listeners
      .iter()
      .map(|(_, l)| Arc::clone(l))
      .collect();

    for listener in listeners {
      listener(snapshot);
    }
  }
}

impl<S: ActionStore> Clone for QueueManager<S> {
  fn clone(&self) -> Self {
    Self {
      store: Arc::clone(&self.store),
      registry: Arc::clone(&self.registry),
      delivery: Arc::clone(&self.delivery),
    }
  }
}

/// Handle returned by [`QueueManager::subscribe`]. Dropping it unsubscribes.
#[must_use = "dropping a subscription unsubscribes the listener"]
pub struct Subscription {
  id: u64,
  registry: Weak<Mutex<Registry>>,
}

impl Subscription {
  pub fn unsubscribe(self) {
    // Drop does the work
  }
}

impl Drop for Subscription {
  fn drop(&mut self) {
    if let Some(registry) = self.registry.upgrade() {
      lock(&registry).listeners.retain(|(id, _)| *id != self.id);
    }
  }
}

/// The registry holds no invariants a panicking listener could break, so a
/// poisoned lock is still usable.
fn lock(registry: &Mutex<Registry>) -> std::sync::MutexGuard<'_, Registry> {
  registry.lock().unwrap_or_else(|e| e.into_inner())
}
