//! Offline-tolerant mutation queue.
//!
//! State-changing requests that can't reach the server are written to a
//! durable local queue and replayed, in order, once connectivity returns.
//!
//! - [`store`]: crash-safe SQLite log of pending actions
//! - [`queue`]: enqueue/remove plus in-process observers
//! - [`sync`]: ordered, halt-on-failure replay with a reentrancy guard
//! - [`http`]: the client adapter that decides queue vs. surface
//! - [`connectivity`]: online/offline signal
//!
//! # Example
//!
//! ```ignore
//! let store = SqliteStore::open(SqliteStore::default_path().unwrap())?;
//! let transport = Arc::new(ReqwestTransport::new(Duration::from_secs(15))?);
//! let engine = SyncEngine::new(QueueManager::new(store), transport, SyncOptions::default());
//! let probe = Arc::new(ManualConnectivity::new(true));
//! let client = HttpClient::new(base_url, engine.clone(), probe.clone());
//!
//! let _banner = engine.queue().subscribe(|pending| show_pending(pending.len())).await?;
//! let _watcher = engine.watch_connectivity(probe.as_ref());
//!
//! match client.patch("/patients/7", &update).await {
//!     Ok(_) => saved(),
//!     Err(e) if e.is_queued() => saved_will_sync(),
//!     Err(e) => show_error(e),
//! }
//! ```

pub mod connectivity;
pub mod http;
pub mod queue;
pub mod store;
pub mod sync;

#[cfg(test)]
mod testing;

pub use connectivity::{Connectivity, ManualConnectivity, TcpProbe};
pub use http::{HttpClient, HttpError, ReqwestTransport};
pub use queue::{Method, NewAction, QueueManager, QueuedAction};
pub use store::{ActionStore, SqliteStore};
pub use sync::{DrainReport, SyncEngine, SyncOptions};
