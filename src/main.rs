mod app;
mod config;
mod logging;

use clap::{Parser, Subcommand};
use color_eyre::Result;
use mutq::Method;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "mutq")]
#[command(about = "Queue writes while offline and replay them once the network is back")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/mutq/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Treat the device as offline regardless of the network
  #[arg(long)]
  offline: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Send a request; mutations that can't reach the server are queued
  Send {
    /// HTTP method (GET, POST, PUT, PATCH, DELETE)
    method: Method,
    /// Endpoint relative to api.base_url
    endpoint: String,
    /// JSON request body
    #[arg(short, long)]
    body: Option<String>,
  },
  /// List pending actions
  Pending {
    /// Print as JSON
    #[arg(long)]
    json: bool,
  },
  /// Replay pending actions now
  Sync,
  /// Keep running and replay whenever the network comes back
  Watch,
  /// Drop every pending action
  Clear,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = config::Config::load(args.config.as_deref())?;
  let _log_guard = logging::init(&config.logging)?;

  let app = app::App::new(config, args.offline)?;

  match args.command {
    Command::Send {
      method,
      endpoint,
      body,
    } => app.send(method, &endpoint, body).await,
    Command::Pending { json } => app.pending(json).await,
    Command::Sync => app.sync().await,
    Command::Watch => app.watch().await,
    Command::Clear => app.clear().await,
  }
}
