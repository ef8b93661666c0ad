mod app;
mod cache;
mod config;
mod event;
mod http;
mod intercept;
mod logging;
mod network;
mod notify;
mod queue;

use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use crate::app::{App, Storage};
use crate::cache::SqliteStore;
use crate::http::{Method, Request};
use crate::network::HttpNetwork;

#[derive(Parser, Debug)]
#[command(name = "intercache")]
#[command(about = "Client-side interception cache with offline queuing")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/intercache/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Cache database path (overrides config)
  #[arg(long)]
  store: Option<PathBuf>,

  /// Keep all state in memory for this invocation
  #[arg(long)]
  ephemeral: bool,

  /// Deployment version tag (overrides config)
  #[arg(long)]
  version_tag: Option<String>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Send one request through the interceptor; the body goes to stdout
  Fetch {
    /// Path (resolved against the origin) or absolute URL
    target: String,
    #[arg(short = 'X', long, default_value = "GET")]
    method: String,
    /// Header as "name: value"
    #[arg(short = 'H', long = "header")]
    headers: Vec<String>,
    /// Request body
    #[arg(short, long)]
    data: Option<String>,
    /// Treat as a page navigation
    #[arg(long)]
    navigate: bool,
    /// Queue the request for replay if the network is unreachable
    #[arg(long)]
    queue: bool,
  },
  /// Pre-populate the configured version from the manifest
  Install {
    /// Leave the installed version waiting instead of cutting over
    #[arg(long)]
    no_activate: bool,
  },
  /// Make the configured version active and delete other generations
  Activate,
  /// Evict entries older than the horizon
  Sweep,
  /// Replay queued offline actions
  Drain,
  /// List queued offline actions
  Queue,
  /// List cache generations
  Generations,
  /// Forward a push payload (JSON file, or stdin when omitted)
  Notify { file: Option<PathBuf> },
  /// Run the sweep schedule and reconnect-triggered drains until interrupted
  Run,
}

fn parse_header(raw: &str) -> Result<(String, String)> {
  let (name, value) = raw
    .split_once(':')
    .ok_or_else(|| eyre!("Header must look like 'name: value': {}", raw))?;
  Ok((name.trim().to_string(), value.trim().to_string()))
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = config::Config::load(args.config.as_deref())?;

  // Override version if specified on command line
  let config = if let Some(version) = args.version_tag {
    config::Config { version, ..config }
  } else {
    config
  };

  let _log_guard = logging::init_logging(config.log_dir.as_deref())?;

  let storage = if args.ephemeral {
    Storage::Ephemeral
  } else {
    let path = match args.store.or_else(|| config.store_path.clone()) {
      Some(path) => path,
      None => SqliteStore::default_path()?,
    };
    Storage::Disk(path)
  };

  let network = Arc::new(HttpNetwork::new()?);
  let app = App::new(config, storage, network)?;

  match args.command {
    Command::Fetch {
      target,
      method,
      headers,
      data,
      navigate,
      queue,
    } => {
      let mut request = Request::new(Method::parse(&method)?, app.config().resolve(&target)?);
      for raw in &headers {
        let (name, value) = parse_header(raw)?;
        request = request.with_header(&name, &value);
      }
      if let Some(data) = data {
        request = request.with_body(data);
      }
      if navigate {
        request = request.navigation();
      }
      if queue {
        request = request.queue_if_offline();
      }

      let result = app.fetch(request).await;
      match result.cached_at {
        Some(at) => eprintln!(
          "{} ({:?}, cached {})",
          result.data.status,
          result.source,
          at.to_rfc3339()
        ),
        None => eprintln!("{} ({:?})", result.data.status, result.source),
      }
      std::io::stdout().write_all(&result.data.body)?;
    }
    Command::Install { no_activate } => {
      let (install, activation) = app.install(!no_activate).await?;
      println!(
        "installed {}: {} stored, {} failed",
        app.config().version,
        install.stored.len(),
        install.failed.len()
      );
      for (url, reason) in &install.failed {
        println!("  failed {}: {}", url, reason);
      }
      if let Some(activation) = activation {
        println!(
          "activated: {} kept, {} deleted, {} failed",
          activation.kept.len(),
          activation.deleted.len(),
          activation.failed.len()
        );
      }
    }
    Command::Activate => {
      let report = app.activate()?;
      println!(
        "activated {}: {} kept, {} deleted, {} failed",
        app.config().version,
        report.kept.len(),
        report.deleted.len(),
        report.failed.len()
      );
    }
    Command::Sweep => {
      let report = app.sweep()?;
      println!(
        "swept: {} scanned, {} deleted, {} failed",
        report.scanned, report.deleted, report.failed
      );
    }
    Command::Drain => {
      let report = app.drain().await?;
      println!(
        "drained: {} replayed, {} remaining",
        report.replayed.len(),
        report.remaining
      );
      if let Some(id) = report.blocked_on {
        println!("  blocked on {}", id);
      }
      if let Some(id) = report.claimed_elsewhere {
        println!("  {} is being replayed by another process", id);
      }
    }
    Command::Queue => {
      if app.queue_is_empty()? {
        println!("queue is empty");
      } else {
        println!("{}", serde_json::to_string_pretty(&app.queued()?)?);
      }
    }
    Command::Generations => {
      for generation in app.generations()? {
        println!(
          "{}{}\t{} entries\toldest {}",
          generation.name,
          if generation.current { " *" } else { "" },
          generation.entries,
          generation
            .oldest
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "-".to_string())
        );
      }
    }
    Command::Notify { file } => {
      let raw = match file {
        Some(path) => std::fs::read(&path)
          .map_err(|e| eyre!("Failed to read {}: {}", path.display(), e))?,
        None => {
          let mut buf = Vec::new();
          std::io::Read::read_to_end(&mut std::io::stdin(), &mut buf)?;
          buf
        }
      };
      let payload = app.notify(&raw)?;
      println!("{}", serde_json::to_string_pretty(&payload)?);
    }
    Command::Run => app.run().await?,
  }

  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_parse_header() {
    assert_eq!(
      parse_header("Accept: text/html").unwrap(),
      ("Accept".to_string(), "text/html".to_string())
    );
    assert!(parse_header("no-colon").is_err());
  }

  #[test]
  fn test_cli_parses_fetch() {
    let args = Args::try_parse_from([
      "intercache",
      "--ephemeral",
      "fetch",
      "/checkin",
      "-X",
      "POST",
      "-d",
      "{}",
      "--queue",
    ])
    .unwrap();
    assert!(args.ephemeral);
    match args.command {
      Command::Fetch { method, queue, .. } => {
        assert_eq!(method, "POST");
        assert!(queue);
      }
      other => panic!("unexpected command {:?}", other),
    }
  }
}
