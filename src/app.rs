use color_eyre::Result;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

use crate::cache::{
  ActivationReport, CacheResult, CacheStoreManager, GenerationInfo, InstallReport, Janitor,
  MemoryStore, SqliteStore, Store, SweepReport,
};
use crate::config::Config;
use crate::event::{Event, EventHandler};
use crate::http::{Request, Response};
use crate::intercept::{Classifier, Interceptor, NetworkFirst, Strategy};
use crate::network::Network;
use crate::notify::{LogSink, NotificationAdapter, PushPayload};
use crate::queue::{DrainReport, OfflineAction, OfflineQueue};

/// Fully wired caching layer.
pub struct App {
  config: Config,
  manager: Arc<CacheStoreManager>,
  interceptor: Interceptor,
  queue: Arc<OfflineQueue>,
  janitor: Janitor,
  network: Arc<dyn Network>,
}

/// Where persistent state lives.
pub enum Storage {
  /// SQLite files: the cache at this path, the queue next to it
  Disk(PathBuf),
  /// Nothing survives the process
  Ephemeral,
}

impl Storage {
  fn open(&self) -> Result<(Arc<dyn Store>, Arc<OfflineQueue>)> {
    match self {
      Storage::Disk(path) => {
        let store = SqliteStore::open(path)?;
        let queue = OfflineQueue::open(&queue_path(path))?;
        Ok((Arc::new(store), Arc::new(queue)))
      }
      Storage::Ephemeral => Ok((
        Arc::new(MemoryStore::new()),
        Arc::new(OfflineQueue::open_in_memory()?),
      )),
    }
  }
}

fn queue_path(store_path: &Path) -> PathBuf {
  store_path.with_file_name("queue.db")
}

impl App {
  pub fn new(config: Config, storage: Storage, network: Arc<dyn Network>) -> Result<Self> {
    let (store, queue) = storage.open()?;

    let manager = Arc::new(CacheStoreManager::open(Arc::clone(&store), &config.version)?);
    let classifier = Classifier::new(config.rules(), config.sensitive.clone());
    let interceptor = Interceptor::new(classifier, Arc::clone(&manager), Arc::clone(&network))
      .with_executor(
        Strategy::NetworkFirst,
        Arc::new(NetworkFirst::new(config.network_timeout())),
      )
      .with_queue(Arc::clone(&queue))
      .with_offline_document(config.offline_document_url()?)
      .with_max_entry_bytes(config.max_entry_bytes);
    let janitor = Janitor::new(store).with_horizon(config.janitor_horizon()?);

    Ok(Self {
      config,
      manager,
      interceptor,
      queue,
      janitor,
      network,
    })
  }

  pub fn config(&self) -> &Config {
    &self.config
  }

  pub async fn fetch(&self, request: Request) -> CacheResult<Response> {
    self.interceptor.handle(request).await
  }

  /// Install the configured version from the manifest, optionally activating it.
  ///
  /// Requests keep being served from the recorded active version until the
  /// configured one is activated.
  pub async fn install(&self, activate: bool) -> Result<(InstallReport, Option<ActivationReport>)> {
    let manifest = self.config.manifest_urls()?;
    let install = self
      .manager
      .install(&self.config.version, &manifest, self.network.as_ref())
      .await?;

    let activation = if activate {
      Some(self.manager.activate(&self.config.version)?)
    } else {
      None
    };

    Ok((install, activation))
  }

  pub fn activate(&self) -> Result<ActivationReport> {
    self.manager.activate(&self.config.version)
  }

  pub fn sweep(&self) -> Result<SweepReport> {
    self.janitor.sweep()
  }

  pub async fn drain(&self) -> Result<DrainReport> {
    self.queue.drain(self.network.as_ref()).await
  }

  pub fn queued(&self) -> Result<Vec<OfflineAction>> {
    self.queue.list()
  }

  pub fn queue_is_empty(&self) -> Result<bool> {
    self.queue.is_empty()
  }

  pub fn generations(&self) -> Result<Vec<GenerationInfo>> {
    self.manager.describe()
  }

  pub fn notify(&self, raw: &[u8]) -> Result<PushPayload> {
    NotificationAdapter::new(LogSink).accept(raw)
  }

  /// Serve triggers until interrupted: sweeps on the janitor interval and
  /// drains the queue whenever connectivity returns.
  pub async fn run(&self) -> Result<()> {
    let mut events = EventHandler::new(
      self.config.sweep_interval()?,
      self.config.probe_interval()?,
      Arc::clone(&self.network),
      self.config.origin.clone(),
    );

    let active = self.manager.current()?;
    info!(
      version = %active.version(),
      horizon_days = self.config.janitor.horizon_days,
      "Running; press Ctrl-C to stop"
    );

    loop {
      tokio::select! {
        _ = tokio::signal::ctrl_c() => {
          info!("Shutting down");
          return Ok(());
        }
        event = events.next() => match event {
          Some(Event::Sweep) => {
            if let Err(e) = self.sweep() {
              warn!(error = %e, "Sweep failed");
            }
          }
          Some(Event::Reconnect) => {
            if let Err(e) = self.drain().await {
              warn!(error = %e, "Drain failed");
            }
          }
          None => return Ok(()),
        },
      }
    }
  }
}
