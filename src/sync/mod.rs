//! Sync engine: replays pending actions in order once the network is back.
//!
//! A drain takes a point-in-time snapshot of the queue and walks it front to
//! back. Each action is removed only after the server answered with a 2xx.
//! The first failure ends the drain, because later actions may depend on the
//! earlier ones having landed. Actions enqueued while a drain is running are
//! left for the next one.

use rand::Rng;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

use crate::connectivity::{Connectivity, ConnectivityEvent};
use crate::http::transport::{resolve, send_with_timeout};
use crate::http::{Request, Transport, TransportError};
use crate::queue::{QueueError, QueueManager, QueuedAction};
use crate::store::ActionStore;

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
  #[error("sync engine has no base URL; call configure() first")]
  NotConfigured,

  #[error(transparent)]
  Queue(#[from] QueueError),
}

/// Tuning for replays.
#[derive(Debug, Clone)]
pub struct SyncOptions {
  /// Deadline for each replayed request
  pub timeout: Duration,
  /// Header carrying the action id on replay, so the server can drop
  /// duplicates. `None` sends the captured headers unchanged.
  pub idempotency_header: Option<String>,
  /// How long a drain may hold the cross-process lease without renewing it.
  /// Raised to at least `timeout + LEASE_MARGIN`, since the lease is only
  /// renewed between replays.
  pub lease_ttl: Duration,
}

/// Slack between the replay deadline and lease expiry, covering the store
/// round trips around each replay.
pub const LEASE_MARGIN: Duration = Duration::from_secs(5);

impl SyncOptions {
  /// The shortest lease that outlives one replay.
  pub fn min_lease_ttl(&self) -> Duration {
    self.timeout.saturating_add(LEASE_MARGIN)
  }
}

impl Default for SyncOptions {
  fn default() -> Self {
    Self {
      timeout: Duration::from_secs(15),
      idempotency_header: Some("Idempotency-Key".to_string()),
      lease_ttl: Duration::from_secs(60),
    }
  }
}

/// What one call to [`SyncEngine::process_queue`] did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
  /// Another drain was already running here or in another process
  pub skipped: bool,
  /// Actions confirmed by the server and removed
  pub replayed: usize,
  /// The action that failed and stopped the drain
  pub halted_on: Option<String>,
  /// Another process took the lease mid-drain; the rest was left to it
  pub lease_lost: bool,
  /// Actions still pending after the drain
  pub remaining: usize,
}

impl DrainReport {
  fn skipped() -> Self {
    Self {
      skipped: true,
      ..Self::default()
    }
  }
}

#[derive(Debug, thiserror::Error)]
enum ReplayFailure {
  #[error("invalid endpoint: {0}")]
  Endpoint(#[from] url::ParseError),

  #[error("server answered {0}")]
  Status(u16),

  #[error(transparent)]
  Transport(#[from] TransportError),
}

struct Inner<S: ActionStore> {
  queue: QueueManager<S>,
  transport: Arc<dyn Transport>,
  base_url: RwLock<Option<Url>>,
  options: SyncOptions,
  draining: AtomicBool,
  /// Identifies this engine in the store's drain lease
  owner: String,
}

/// Drains the queue against the network. Cheap to clone; clones share the
/// reentrancy flag.
pub struct SyncEngine<S: ActionStore> {
  inner: Arc<Inner<S>>,
}

impl<S: ActionStore> SyncEngine<S> {
  pub fn new(queue: QueueManager<S>, transport: Arc<dyn Transport>, mut options: SyncOptions) -> Self {
    let min_ttl = options.min_lease_ttl();
    if options.lease_ttl < min_ttl {
      warn!(
        lease_ttl = ?options.lease_ttl,
        timeout = ?options.timeout,
        "drain lease shorter than a replay, raising it"
      );
      options.lease_ttl = min_ttl;
    }

    let owner = format!(
      "{}-{:08x}",
      std::process::id(),
      rand::thread_rng().gen::<u32>()
    );

    Self {
      inner: Arc::new(Inner {
        queue,
        transport,
        base_url: RwLock::new(None),
        options,
        draining: AtomicBool::new(false),
        owner,
      }),
    }
  }

  /// Set the origin queued endpoints are replayed against.
  pub fn configure(&self, base_url: Url) {
    info!(base_url = %base_url, "sync engine configured");
    *self
      .inner
      .base_url
      .write()
      .unwrap_or_else(|e| e.into_inner()) = Some(base_url);
  }

  pub fn queue(&self) -> &QueueManager<S> {
    &self.inner.queue
  }

  pub(crate) fn transport(&self) -> &dyn Transport {
    self.inner.transport.as_ref()
  }

  pub(crate) fn timeout(&self) -> Duration {
    self.inner.options.timeout
  }

  pub fn is_draining(&self) -> bool {
    self.inner.draining.load(Ordering::Acquire)
  }

  fn base_url(&self) -> Option<Url> {
    self
      .inner
      .base_url
      .read()
      .unwrap_or_else(|e| e.into_inner())
      .clone()
  }

  /// Try to replay everything currently pending.
  ///
  /// Safe to call redundantly: if a drain is already running this returns a
  /// skipped report right away. Replay failures are not errors; they leave
  /// the action queued and show up in the report.
  pub async fn process_queue(&self) -> Result<DrainReport, SyncError> {
    let base_url = self.base_url().ok_or(SyncError::NotConfigured)?;

    let Some(_flag) = DrainFlag::acquire(&self.inner.draining) else {
      debug!("drain already running, skipping");
      return Ok(DrainReport::skipped());
    };

    if !self.renew_lease().await? {
      debug!("another process holds the drain lease, skipping");
      return Ok(DrainReport::skipped());
    }

    let result = self.drain(&base_url).await;

    let owner = self.inner.owner.clone();
    if let Err(e) = self
      .inner
      .queue
      .with_store(move |store| store.release_lease(&owner))
      .await
    {
      warn!(error = %e, "failed to release drain lease");
    }

    // Observers get the true remaining list whatever happened above
    let remaining = match self.inner.queue.notify().await {
      Ok(pending) => pending.len(),
      Err(e) => {
        warn!(error = %e, "failed to refresh queue observers after drain");
        0
      }
    };

    result.map(|report| DrainReport {
      remaining,
      ..report
    })
  }

  async fn drain(&self, base_url: &Url) -> Result<DrainReport, SyncError> {
    let snapshot = self.inner.queue.pending().await?;
    let mut report = DrainReport::default();

    if snapshot.is_empty() {
      return Ok(report);
    }

    info!(count = snapshot.len(), "draining pending actions");

    for action in &snapshot {
      if !self.renew_lease().await? {
        warn!("drain lease lost to another process, stopping");
        report.lease_lost = true;
        break;
      }

      match self.replay(base_url, action).await {
        Ok(()) => {
          self.inner.queue.remove(&action.id).await?;
          report.replayed += 1;
          info!(id = %action.id, method = %action.method, endpoint = %action.endpoint, "action replayed");
        }
        Err(failure) => {
          warn!(
            id = %action.id,
            method = %action.method,
            endpoint = %action.endpoint,
            reason = %failure,
            "replay failed, halting drain"
          );
          report.halted_on = Some(action.id.clone());
          break;
        }
      }
    }

    Ok(report)
  }

  /// Take or extend the cross-process lease.
  async fn renew_lease(&self) -> Result<bool, SyncError> {
    let owner = self.inner.owner.clone();
    let ttl = self.inner.options.lease_ttl;
    let acquired = self
      .inner
      .queue
      .with_store(move |store| store.try_acquire_lease(&owner, ttl))
      .await
      .map_err(QueueError::from)?;
    Ok(acquired)
  }

  async fn replay(&self, base_url: &Url, action: &QueuedAction) -> Result<(), ReplayFailure> {
    let url = resolve(base_url, &action.endpoint)?;

    let mut headers = action.headers.clone();
    if let Some(name) = &self.inner.options.idempotency_header {
      let present = headers.keys().any(|key| key.eq_ignore_ascii_case(name));
      if !present {
        headers.insert(name.clone(), action.id.clone());
      }
    }

    let request = Request {
      method: action.method,
      url,
      headers,
      body: action.body.clone(),
    };

    debug!(id = %action.id, url = %request.url, "replaying action");
    let response = send_with_timeout(self.transport(), &request, self.timeout()).await?;

    if response.is_success() {
      Ok(())
    } else {
      Err(ReplayFailure::Status(response.status))
    }
  }

  /// Start a drain in the background and forget about it.
  pub fn trigger(&self) -> JoinHandle<()> {
    let engine = self.clone();
    tokio::spawn(async move {
      match engine.process_queue().await {
        Ok(report) if report.replayed > 0 => {
          info!(
            replayed = report.replayed,
            remaining = report.remaining,
            "background drain finished"
          );
        }
        Ok(_) => {}
        Err(e) => warn!(error = %e, "background drain failed"),
      }
    })
  }

  /// Drain every time `probe` reports that the device came back online.
  pub fn watch_connectivity(&self, probe: &dyn Connectivity) -> JoinHandle<()> {
    let mut rx = probe.watch();
    // Read the starting state here so a change made right after this call
    // still shows up as a transition
    let mut was_online = *rx.borrow_and_update();
    let engine = self.clone();

    tokio::spawn(async move {
      while rx.changed().await.is_ok() {
        let online = *rx.borrow_and_update();

        match ConnectivityEvent::from_transition(was_online, online) {
          Some(ConnectivityEvent::BecameOnline) => {
            info!("connectivity regained, draining queue");
            if let Err(e) = engine.process_queue().await {
              warn!(error = %e, "drain after reconnect failed");
            }
          }
          Some(ConnectivityEvent::BecameOffline) => {
            info!("connectivity lost, mutations will be queued");
          }
          None => {}
        }

        was_online = online;
      }

      debug!("connectivity source closed, no longer watching");
    })
  }
}

impl<S: ActionStore> Clone for SyncEngine<S> {
  fn clone(&self) -> Self {
    Self {
      inner: Arc::clone(&self.inner),
    }
  }
}

/// Held for the duration of a drain; clears the flag on drop.
struct DrainFlag<'a>(&'a AtomicBool);

impl<'a> DrainFlag<'a> {
  fn acquire(flag: &'a AtomicBool) -> Option<Self> {
    flag
      .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
      .ok()
      .map(|_| Self(flag))
  }
}

impl Drop for DrainFlag<'_> {
  fn drop(&mut self) {
    self.0.store(false, Ordering::Release);
  }
}
