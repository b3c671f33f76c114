//! Online/offline signal.
//!
//! The rest of the crate only sees the [`Connectivity`] trait, so tests can
//! flip the state by hand and the binary can probe the real network.

use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};
use url::Url;

/// Source of the device's connectivity state.
pub trait Connectivity: Send + Sync {
  fn is_online(&self) -> bool;

  /// Receiver that observes every state change. Dropping it unsubscribes.
  fn watch(&self) -> watch::Receiver<bool>;
}

/// Edge events derived from the level-triggered state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityEvent {
  BecameOnline,
  BecameOffline,
}

impl ConnectivityEvent {
  pub fn from_transition(was_online: bool, is_online: bool) -> Option<Self> {
    match (was_online, is_online) {
      (false, true) => Some(ConnectivityEvent::BecameOnline),
      (true, false) => Some(ConnectivityEvent::BecameOffline),
      _ => None,
    }
  }
}

/// Publish `online` only if it differs from the current state.
fn publish(state: &watch::Sender<bool>, online: bool) -> bool {
  state.send_if_modified(|current| {
    if *current == online {
      false
    } else {
      *current = online;
      true
    }
  })
}

/// Connectivity that changes only when told to.
pub struct ManualConnectivity {
  state: watch::Sender<bool>,
}

impl ManualConnectivity {
  pub fn new(online: bool) -> Self {
    let (state, _) = watch::channel(online);
    Self { state }
  }

  pub fn set_online(&self, online: bool) {
    publish(&self.state, online);
  }
}

impl Connectivity for ManualConnectivity {
  fn is_online(&self) -> bool {
    *self.state.borrow()
  }

  fn watch(&self) -> watch::Receiver<bool> {
    self.state.subscribe()
  }
}

#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
  #[error("cannot probe {0}: URL has no host")]
  NoHost(String),
}

/// Periodically opens a TCP connection to the API host and reports whether
/// it succeeded.
pub struct TcpProbe {
  state: watch::Sender<bool>,
  task: JoinHandle<()>,
}

impl TcpProbe {
  /// Check once, then keep checking every `interval` in the background.
  pub async fn start(target: &Url, interval: Duration, timeout: Duration) -> Result<Self, ProbeError> {
    let host = target
      .host_str()
      .ok_or_else(|| ProbeError::NoHost(target.to_string()))?
      .to_string();
    let port = target.port_or_known_default().unwrap_or(80);

    let initial = reachable(&host, port, timeout).await;
    debug!(host = %host, port, online = initial, "initial connectivity probe");
    let (state, _) = watch::channel(initial);

    let sender = state.clone();
    let task = tokio::spawn(async move {
      loop {
        tokio::time::sleep(interval).await;
        let online = reachable(&host, port, timeout).await;
        if publish(&sender, online) {
          info!(host = %host, online, "connectivity changed");
        }
      }
    });

    Ok(Self { state, task })
  }
}

impl Connectivity for TcpProbe {
  fn is_online(&self) -> bool {
    *self.state.borrow()
  }

  fn watch(&self) -> watch::Receiver<bool> {
    self.state.subscribe()
  }
}

impl Drop for TcpProbe {
  fn drop(&mut self) {
    self.task.abort();
  }
}

async fn reachable(host: &str, port: u16, timeout: Duration) -> bool {
  matches!(
    tokio::time::timeout(timeout, TcpStream::connect((host, port))).await,
    Ok(Ok(_))
  )
}
