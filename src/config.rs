use color_eyre::{eyre::eyre, Result};
use mutq::sync::{SyncOptions, LEASE_MARGIN};
use mutq::SqliteStore;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub api: ApiConfig,
  #[serde(default)]
  pub queue: QueueConfig,
  #[serde(default)]
  pub sync: SyncConfig,
  #[serde(default)]
  pub connectivity: ConnectivityConfig,
  #[serde(default)]
  pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
  /// Origin every endpoint is resolved against (e.g. "https://clinic.example.com/api")
  pub base_url: String,
  #[serde(default = "default_timeout_secs")]
  pub timeout_secs: u64,
  /// Extra headers sent with every request
  #[serde(default)]
  pub headers: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct QueueConfig {
  /// Queue database file (defaults to $XDG_DATA_HOME/mutq/queue.db)
  pub database: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
  /// Header that carries the action id on replay; null disables it
  #[serde(default = "default_idempotency_header")]
  pub idempotency_header: Option<String>,
  #[serde(default = "default_lease_ttl_secs")]
  pub lease_ttl_secs: u64,
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      idempotency_header: default_idempotency_header(),
      lease_ttl_secs: default_lease_ttl_secs(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConnectivityConfig {
  #[serde(default = "default_probe_interval_secs")]
  pub probe_interval_secs: u64,
  #[serde(default = "default_probe_timeout_secs")]
  pub probe_timeout_secs: u64,
  /// How often `watch` drains even without a reconnect
  #[serde(default = "default_resync_interval_secs")]
  pub resync_interval_secs: u64,
}

impl Default for ConnectivityConfig {
  fn default() -> Self {
    Self {
      probe_interval_secs: default_probe_interval_secs(),
      probe_timeout_secs: default_probe_timeout_secs(),
      resync_interval_secs: default_resync_interval_secs(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
  /// tracing filter directive; RUST_LOG takes precedence
  #[serde(default = "default_log_filter")]
  pub filter: String,
  /// Log directory (defaults to $XDG_DATA_HOME/mutq/logs)
  pub directory: Option<PathBuf>,
}

impl Default for LoggingConfig {
  fn default() -> Self {
    Self {
      filter: default_log_filter(),
      directory: None,
    }
  }
}

fn default_timeout_secs() -> u64 {
  15
}

fn default_idempotency_header() -> Option<String> {
  Some("Idempotency-Key".to_string())
}

fn default_lease_ttl_secs() -> u64 {
  60
}

fn default_probe_interval_secs() -> u64 {
  5
}

fn default_probe_timeout_secs() -> u64 {
  3
}

fn default_resync_interval_secs() -> u64 {
  30
}

fn default_log_filter() -> String {
  "info".to_string()
}

impl ApiConfig {
  pub fn base_url(&self) -> Result<Url> {
    Url::parse(&self.base_url).map_err(|e| eyre!("Invalid api.base_url {}: {}", self.base_url, e))
  }

  pub fn timeout(&self) -> Duration {
    Duration::from_secs(self.timeout_secs)
  }
}

impl QueueConfig {
  pub fn database_path(&self) -> Result<PathBuf> {
    self
      .database
      .clone()
      .or_else(SqliteStore::default_path)
      .ok_or_else(|| eyre!("Could not determine data directory; set queue.database"))
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./mutq.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/mutq/config.yaml
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Err(eyre!(
        "No configuration file found. Create one at ~/.config/mutq/config.yaml\n\
                 with at least `api: {{ base_url: ... }}`."
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("mutq.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("mutq").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    let config: Config = serde_yaml::from_str(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))?;

    Ok(config)
  }

  /// Get the API bearer token from the environment, if one is set.
  ///
  /// Checks MUTQ_API_TOKEN.
  pub fn get_api_token() -> Option<String> {
    std::env::var("MUTQ_API_TOKEN")
      .ok()
      .filter(|t| !t.is_empty())
  }

  /// Replay settings. The lease has to outlive a whole replay, or another
  /// process could take it over mid-request.
  pub fn sync_options(&self) -> Result<SyncOptions> {
    let options = SyncOptions {
      timeout: self.api.timeout(),
      idempotency_header: self.sync.idempotency_header.clone(),
      lease_ttl: Duration::from_secs(self.sync.lease_ttl_secs),
    };

    if options.lease_ttl < options.min_lease_ttl() {
      return Err(eyre!(
        "sync.lease_ttl_secs ({}) must be at least api.timeout_secs + {} ({})",
        self.sync.lease_ttl_secs,
        LEASE_MARGIN.as_secs(),
        options.min_lease_ttl().as_secs()
      ));
    }

    Ok(options)
  }
}
