use color_eyre::{eyre::eyre, Result};
use mutq::{
  Connectivity, HttpClient, HttpError, ManualConnectivity, Method, QueueManager, QueuedAction,
  ReqwestTransport, SqliteStore, SyncEngine, TcpProbe,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use url::Url;

use crate::config::Config;

/// Everything the commands need, wired once at startup.
pub struct App {
  config: Config,
  base_url: Url,
  engine: SyncEngine<SqliteStore>,
  /// Force the device to look offline
  offline: bool,
}

impl App {
  pub fn new(config: Config, offline: bool) -> Result<Self> {
    let base_url = config.api.base_url()?;

    let path = config.queue.database_path()?;
    let store = SqliteStore::open(&path)?;
    info!(path = %path.display(), "queue database ready");

    let transport = ReqwestTransport::new(config.api.timeout())
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    let engine = SyncEngine::new(
      QueueManager::new(store),
      Arc::new(transport),
      config.sync_options()?,
    );
    engine.configure(base_url.clone());

    Ok(Self {
      config,
      base_url,
      engine,
      offline,
    })
  }

  async fn connectivity(&self) -> Result<Arc<dyn Connectivity>> {
    if self.offline {
      return Ok(Arc::new(ManualConnectivity::new(false)));
    }

    let probe = TcpProbe::start(
      &self.base_url,
      Duration::from_secs(self.config.connectivity.probe_interval_secs),
      Duration::from_secs(self.config.connectivity.probe_timeout_secs),
    )
    .await?;
    Ok(Arc::new(probe))
  }

  fn client(&self, connectivity: Arc<dyn Connectivity>) -> HttpClient<SqliteStore> {
    let mut client = HttpClient::new(self.base_url.clone(), self.engine.clone(), connectivity);
    for (name, value) in &self.config.api.headers {
      client = client.with_default_header(name, value);
    }
    if let Some(token) = Config::get_api_token() {
      client.set_token(token);
    }
    client
  }

  /// Send one request through the adapter.
  pub async fn send(&self, method: Method, endpoint: &str, body: Option<String>) -> Result<()> {
    if let Some(body) = &body {
      serde_json::from_str::<serde_json::Value>(body)
        .map_err(|e| eyre!("--body is not valid JSON: {}", e))?;
    }

    let client = self.client(self.connectivity().await?);
    let result = client.request(method, endpoint, body).await;

    // Let a drain started by the request finish before the process exits
    self.wait_idle().await;

    match result {
      Ok(response) => {
        println!("{} {}", response.status, response.body);
        Ok(())
      }
      Err(HttpError::Queued { id }) => {
        println!("Saved offline, will sync when connected (queued as {})", id);
        Ok(())
      }
      Err(e) => Err(eyre!(e)),
    }
  }

  /// Print the pending actions.
  pub async fn pending(&self, json: bool) -> Result<()> {
    let pending = self.engine.queue().pending().await?;

    if json {
      println!("{}", serde_json::to_string_pretty(&pending)?);
      return Ok(());
    }

    if pending.is_empty() {
      println!("No pending actions");
      return Ok(());
    }

    println!("{:<24} {:<7} {:<20} ENDPOINT", "ID", "METHOD", "CREATED");
    for action in &pending {
      print_action(action);
    }
    println!("{} pending", pending.len());
    Ok(())
  }

  /// Run one drain now.
  pub async fn sync(&self) -> Result<()> {
    let report = self.engine.process_queue().await?;

    if report.skipped {
      println!("A sync is already running elsewhere; try again shortly");
    } else if report.lease_lost {
      println!(
        "Replayed {}, then another process took over ({} still pending)",
        report.replayed, report.remaining
      );
    } else if let Some(id) = &report.halted_on {
      println!(
        "Replayed {}, stopped at {} ({} still pending)",
        report.replayed, id, report.remaining
      );
    } else {
      println!(
        "Replayed {} ({} still pending)",
        report.replayed, report.remaining
      );
    }
    Ok(())
  }

  /// Drop every pending action.
  pub async fn clear(&self) -> Result<()> {
    let count = self.engine.queue().pending().await?.len();
    self.engine.queue().clear().await?;
    println!("Cleared {} pending actions", count);
    Ok(())
  }

  /// Stay running: drain on every reconnect and periodically while online,
  /// and print the pending count whenever it changes.
  pub async fn watch(&self) -> Result<()> {
    let probe = self.connectivity().await?;

    let _banner = self
      .engine
      .queue()
      .subscribe(|pending: &[QueuedAction]| {
        println!("{} pending", pending.len());
      })
      .await?;

    let watcher = self.engine.watch_connectivity(probe.as_ref());

    let mut ticker = tokio::time::interval(Duration::from_secs(
      self.config.connectivity.resync_interval_secs.max(1),
    ));
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    println!(
      "Watching {} ({}), Ctrl-C to stop",
      self.base_url,
      if probe.is_online() { "online" } else { "offline" }
    );

    loop {
      tokio::select! {
        _ = &mut ctrl_c => break,
        _ = ticker.tick() => {
          if probe.is_online() {
            self.engine.trigger();
          }
        }
      }
    }

    watcher.abort();
    self.wait_idle().await;
    Ok(())
  }

  async fn wait_idle(&self) {
    // A just-spawned drain may not have set the flag yet
    tokio::task::yield_now().await;
    while self.engine.is_draining() {
      tokio::time::sleep(Duration::from_millis(20)).await;
    }
  }
}

fn print_action(action: &QueuedAction) {
  println!(
    "{:<24} {:<7} {:<20} {}",
    action.id,
    action.method.as_str(),
    action.created_at.format("%Y-%m-%d %H:%M:%S"),
    action.endpoint
  );
}
