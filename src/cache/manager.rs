//! Cache Store Manager: versioned generations and their lifecycle.
//!
//! Each deployed version owns one generation per [`Role`], named
//! `"{role}-{version}"` (e.g. `static-v3`). A new version is installed next
//! to the active one and becomes visible to requests only through
//! [`CacheStoreManager::activate`], which swaps the whole generation set in
//! one step and then deletes every generation outside the new keep-list.
//!
//! Lifecycle states live in the store, so the active version of a previous
//! process is the one a new process starts serving from.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};
use tracing::{debug, info, warn};
use url::Url;

use super::traits::{CacheEntry, LifecycleState, Store};
use crate::http::Request;
use crate::network::Network;

/// How many manifest resources are fetched concurrently during install.
const INSTALL_CONCURRENCY: usize = 4;

/// Resource role; exactly one generation per role is authoritative.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
  Static,
  Dynamic,
  Api,
}

impl Role {
  pub const ALL: [Role; 3] = [Role::Static, Role::Dynamic, Role::Api];

  pub fn as_str(&self) -> &'static str {
    match self {
      Role::Static => "static",
      Role::Dynamic => "dynamic",
      Role::Api => "api",
    }
  }
}

impl fmt::Display for Role {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// The generation names of one version, one per role.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationSet {
  version: String,
  names: HashMap<Role, String>,
}

impl GenerationSet {
  pub fn for_version(version: &str) -> Self {
    let names = Role::ALL
      .iter()
      .map(|role| (*role, format!("{}-{}", role, version)))
      .collect();

    Self {
      version: version.to_string(),
      names,
    }
  }

  pub fn version(&self) -> &str {
    &self.version
  }

  pub fn name(&self, role: Role) -> &str {
    // every role is populated by `for_version`
    self.names.get(&role).map(String::as_str).unwrap_or_default()
  }

  pub fn contains(&self, generation: &str) -> bool {
    self.names.values().any(|n| n == generation)
  }

  pub fn names(&self) -> impl Iterator<Item = &str> {
    Role::ALL.iter().map(move |role| self.name(*role))
  }
}

/// Outcome of pre-populating a version from the install manifest.
#[derive(Debug, Default, Clone)]
pub struct InstallReport {
  pub stored: Vec<Url>,
  pub failed: Vec<(Url, String)>,
}

/// Outcome of a version cutover.
#[derive(Debug, Default, Clone)]
pub struct ActivationReport {
  pub kept: Vec<String>,
  pub deleted: Vec<String>,
  pub failed: Vec<(String, String)>,
}

/// Generation info for inspection.
#[derive(Debug, Clone)]
pub struct GenerationInfo {
  pub name: String,
  pub entries: usize,
  pub oldest: Option<DateTime<Utc>>,
  pub current: bool,
}

/// Owner of all cache entries and generations.
pub struct CacheStoreManager {
  store: Arc<dyn Store>,
  active: RwLock<Arc<GenerationSet>>,
}

impl CacheStoreManager {
  /// Open a manager over `store`, serving the version it recorded as active.
  ///
  /// `bootstrap_version` only becomes active when the store has never had
  /// an active version.
  pub fn open(store: Arc<dyn Store>, bootstrap_version: &str) -> Result<Self> {
    let recorded = store
      .lifecycle()?
      .into_iter()
      .find(|(_, state)| *state == LifecycleState::Active)
      .map(|(version, _)| version);

    let version = match recorded {
      Some(version) => version,
      None => {
        store.set_lifecycle(bootstrap_version, LifecycleState::Active)?;
        bootstrap_version.to_string()
      }
    };

    let active = GenerationSet::for_version(&version);
    for name in active.names() {
      store.create_generation(name)?;
    }
    debug!(version = %version, "Serving active version");

    Ok(Self {
      store,
      active: RwLock::new(Arc::new(active)),
    })
  }

  pub fn store(&self) -> Arc<dyn Store> {
    Arc::clone(&self.store)
  }

  /// Snapshot of the authoritative generations.
  ///
  /// A request resolves its generation from a single snapshot, so a
  /// concurrent cutover is never observed halfway.
  pub fn current(&self) -> Result<Arc<GenerationSet>> {
    let active = self
      .active
      .read()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    Ok(Arc::clone(&active))
  }

  pub fn state(&self, version: &str) -> Result<Option<LifecycleState>> {
    Ok(
      self
        .store
        .lifecycle()?
        .into_iter()
        .find(|(v, _)| v == version)
        .map(|(_, state)| state),
    )
  }

  fn set_state(&self, version: &str, state: LifecycleState) -> Result<()> {
    debug!(version, ?state, "Lifecycle transition");
    self.store.set_lifecycle(version, state)
  }

  /// Describe every physical generation.
  pub fn describe(&self) -> Result<Vec<GenerationInfo>> {
    let current = self.current()?;
    self
      .store
      .list_generations()?
      .into_iter()
      .map(|name| {
        let entries = self.store.entries(&name)?;
        Ok(GenerationInfo {
          current: current.contains(&name),
          entries: entries.len(),
          oldest: entries.iter().map(|(_, at)| *at).min(),
          name,
        })
      })
      .collect()
  }

  /// Pre-populate the static generation of `version` from a manifest.
  ///
  /// Each resource is fetched independently; failures are recorded in the
  /// report and never abort the others. Installing the already active
  /// version refreshes it in place.
  pub async fn install(
    &self,
    version: &str,
    manifest: &[Url],
    network: &dyn Network,
  ) -> Result<InstallReport> {
    let already_active = self.state(version)? == Some(LifecycleState::Active);
    if !already_active {
      self.set_state(version, LifecycleState::Installing)?;
    }

    let generations = GenerationSet::for_version(version);
    for name in generations.names() {
      self.store.create_generation(name)?;
    }
    let target = generations.name(Role::Static).to_string();

    let outcomes: Vec<(Url, std::result::Result<(), String>)> = stream::iter(manifest.iter().cloned())
      .map(|url| {
        let target = target.as_str();
        async move {
          let outcome = self.install_one(target, &url, network).await;
          (url, outcome)
        }
      })
      .buffer_unordered(INSTALL_CONCURRENCY)
      .collect()
      .await;

    let mut report = InstallReport::default();
    for (url, outcome) in outcomes {
      match outcome {
        Ok(()) => report.stored.push(url),
        Err(reason) => {
          warn!(url = %url, reason = %reason, "Manifest resource not cached");
          report.failed.push((url, reason));
        }
      }
    }

    if !already_active {
      self.set_state(version, LifecycleState::Installed)?;
    }
    info!(
      version,
      stored = report.stored.len(),
      failed = report.failed.len(),
      "Install finished"
    );

    Ok(report)
  }

  async fn install_one(
    &self,
    generation: &str,
    url: &Url,
    network: &dyn Network,
  ) -> std::result::Result<(), String> {
    let request = Request::get(url.clone());
    let response = network.send(&request).await.map_err(|e| e.to_string())?;
    if !response.is_success() {
      return Err(format!("status {}", response.status));
    }

    self
      .store
      .put(generation, &request.cache_key(), &CacheEntry::new(response))
      .map_err(|e| e.to_string())
  }

  /// Cut over to `version` and delete every generation outside its set.
  ///
  /// The new active version is recorded in the store before the in-process
  /// set is swapped; deletion of old generations happens afterwards and one
  /// failure does not stop the rest. A cutover interrupted while
  /// `Activating` can be retried.
  pub fn activate(&self, version: &str) -> Result<ActivationReport> {
    match self.state(version)? {
      Some(LifecycleState::Active) => {}
      Some(LifecycleState::Installed | LifecycleState::Activating) => {
        self.set_state(version, LifecycleState::Activating)?;
      }
      Some(state) => {
        return Err(eyre!(
          "Cannot activate {}: lifecycle is {:?}",
          version,
          state
        ))
      }
      None => return Err(eyre!("Cannot activate {}: version was never installed", version)),
    }

    let next = Arc::new(GenerationSet::for_version(version));
    for name in next.names() {
      self.store.create_generation(name)?;
    }
    self.store.promote(version)?;
    {
      let mut active = self
        .active
        .write()
        .map_err(|e| eyre!("Lock poisoned: {}", e))?;
      *active = Arc::clone(&next);
    }

    let mut report = ActivationReport::default();
    for name in self.store.list_generations()? {
      if next.contains(&name) {
        report.kept.push(name);
        continue;
      }
      match self.store.delete_generation(&name) {
        Ok(()) => {
          debug!(generation = %name, "Deleted stale generation");
          report.deleted.push(name);
        }
        Err(e) => {
          warn!(generation = %name, error = %e, "Failed to delete stale generation");
          report.failed.push((name, e.to_string()));
        }
      }
    }

    info!(
      version,
      kept = report.kept.len(),
      deleted = report.deleted.len(),
      failed = report.failed.len(),
      "Activation finished"
    );

    Ok(report)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::MemoryStore;
  use crate::http::{CacheKey, Method, Response};
  use crate::network::testing::FakeNetwork;

  fn url(path: &str) -> Url {
    Url::parse("https://example.com").unwrap().join(path).unwrap()
  }

  fn key(path: &str) -> CacheKey {
    CacheKey::new(Method::Get, &url(path))
  }

  /// Store that refuses to delete one generation.
  struct StubbornStore {
    inner: MemoryStore,
    stubborn: String,
  }

  impl Store for StubbornStore {
    fn get(&self, generation: &str, key: &CacheKey) -> Result<Option<CacheEntry>> {
      self.inner.get(generation, key)
    }
    fn put(&self, generation: &str, key: &CacheKey, entry: &CacheEntry) -> Result<()> {
      self.inner.put(generation, key, entry)
    }
    fn delete(&self, generation: &str, key: &CacheKey) -> Result<bool> {
      self.inner.delete(generation, key)
    }
    fn delete_if_older(
      &self,
      generation: &str,
      key: &CacheKey,
      cutoff: DateTime<Utc>,
    ) -> Result<bool> {
      self.inner.delete_if_older(generation, key, cutoff)
    }
    fn entries(&self, generation: &str) -> Result<Vec<(CacheKey, DateTime<Utc>)>> {
      self.inner.entries(generation)
    }
    fn create_generation(&self, generation: &str) -> Result<()> {
      self.inner.create_generation(generation)
    }
    fn list_generations(&self) -> Result<Vec<String>> {
      self.inner.list_generations()
    }
    fn delete_generation(&self, generation: &str) -> Result<()> {
      if generation == self.stubborn {
        return Err(eyre!("disk full"));
      }
      self.inner.delete_generation(generation)
    }
    fn lifecycle(&self) -> Result<Vec<(String, LifecycleState)>> {
      self.inner.lifecycle()
    }
    fn set_lifecycle(&self, version: &str, state: LifecycleState) -> Result<()> {
      self.inner.set_lifecycle(version, state)
    }
    fn promote(&self, version: &str) -> Result<()> {
      self.inner.promote(version)
    }
  }

  #[test]
  fn test_generation_names() {
    let set = GenerationSet::for_version("v3");
    assert_eq!(set.name(Role::Static), "static-v3");
    assert_eq!(set.name(Role::Dynamic), "dynamic-v3");
    assert_eq!(set.name(Role::Api), "api-v3");
    assert!(set.contains("api-v3"));
    assert!(!set.contains("api-v2"));
  }

  #[tokio::test]
  async fn test_install_tolerates_partial_failure() {
    let store = Arc::new(MemoryStore::new());
    let manager = CacheStoreManager::open(store.clone(), "v1").unwrap();
    let network = FakeNetwork::new();
    network.respond("https://example.com/", Response::new(200, "<html>"));
    network.respond("https://example.com/offline.html", Response::new(200, "offline"));
    // /missing.css is not scripted and answers 404

    let manifest = vec![url("/"), url("/missing.css"), url("/offline.html")];
    let report = manager.install("v2", &manifest, &network).await.unwrap();

    assert_eq!(report.stored.len(), 2);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].0, url("/missing.css"));
    assert_eq!(manager.state("v2").unwrap(), Some(LifecycleState::Installed));
    assert!(store.get("static-v2", &key("/")).unwrap().is_some());
    assert!(store.get("static-v2", &key("/offline.html")).unwrap().is_some());

    // v1 stays authoritative until activation
    assert_eq!(manager.current().unwrap().version(), "v1");
  }

  #[tokio::test]
  async fn test_activation_deletes_only_outside_keep_list() {
    let store = Arc::new(MemoryStore::new());
    let manager = CacheStoreManager::open(store.clone(), "v1").unwrap();
    store
      .put("static-v1", &key("/old.js"), &CacheEntry::new(Response::new(200, "old")))
      .unwrap();
    store
      .put("api-v1", &key("/api/x"), &CacheEntry::new(Response::new(200, "x")))
      .unwrap();

    let network = FakeNetwork::new();
    network.respond("https://example.com/app.js", Response::new(200, "app"));
    manager.install("v2", &[url("/app.js")], &network).await.unwrap();
    store
      .put("api-v2", &key("/api/y"), &CacheEntry::new(Response::new(200, "y")))
      .unwrap();

    let before: Vec<_> = ["static-v2", "api-v2", "dynamic-v2"]
      .iter()
      .map(|g| store.entries(g).unwrap())
      .collect();

    let report = manager.activate("v2").unwrap();

    assert_eq!(manager.current().unwrap().version(), "v2");
    assert_eq!(manager.state("v2").unwrap(), Some(LifecycleState::Active));
    assert_eq!(manager.state("v1").unwrap(), None);
    assert_eq!(
      store.list_generations().unwrap(),
      vec![
        "api-v2".to_string(),
        "dynamic-v2".to_string(),
        "static-v2".to_string()
      ]
    );
    assert_eq!(report.deleted.len(), 3);
    assert!(report.failed.is_empty());

    let after: Vec<_> = ["static-v2", "api-v2", "dynamic-v2"]
      .iter()
      .map(|g| store.entries(g).unwrap())
      .collect();
    assert_eq!(before, after);
  }

  #[tokio::test]
  async fn test_activation_continues_past_failed_deletion() {
    let store = Arc::new(StubbornStore {
      inner: MemoryStore::new(),
      stubborn: "static-v1".to_string(),
    });
    store.create_generation("static-v1").unwrap();
    store.create_generation("api-v1").unwrap();
    store.create_generation("dynamic-v0").unwrap();

    let manager = CacheStoreManager::open(store.clone(), "v1").unwrap();
    manager.install("v2", &[], &FakeNetwork::new()).await.unwrap();
    let report = manager.activate("v2").unwrap();

    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].0, "static-v1");
    assert_eq!(
      report.deleted,
      vec![
        "api-v1".to_string(),
        "dynamic-v0".to_string(),
        "dynamic-v1".to_string()
      ]
    );
    assert_eq!(manager.current().unwrap().version(), "v2");
  }

  #[test]
  fn test_activate_requires_install() {
    let manager = CacheStoreManager::open(Arc::new(MemoryStore::new()), "v1").unwrap();
    assert!(manager.activate("v9").is_err());
    assert_eq!(manager.current().unwrap().version(), "v1");
  }

  #[tokio::test]
  async fn test_reinstall_of_active_version_keeps_it_active() {
    let manager = CacheStoreManager::open(Arc::new(MemoryStore::new()), "v1").unwrap();
    manager.install("v1", &[], &FakeNetwork::new()).await.unwrap();
    assert_eq!(manager.state("v1").unwrap(), Some(LifecycleState::Active));
  }

  #[tokio::test]
  async fn test_reopen_serves_recorded_active_version() {
    let store = Arc::new(MemoryStore::new());
    let first = CacheStoreManager::open(store.clone(), "v1").unwrap();
    first.install("v2", &[], &FakeNetwork::new()).await.unwrap();
    first.activate("v2").unwrap();

    let reopened = CacheStoreManager::open(store.clone(), "v1").unwrap();
    assert_eq!(reopened.current().unwrap().version(), "v2");
    assert_eq!(reopened.state("v2").unwrap(), Some(LifecycleState::Active));
    assert_eq!(reopened.state("v1").unwrap(), None);
  }

  #[tokio::test]
  async fn test_installed_version_waits_across_reopen() {
    let store = Arc::new(MemoryStore::new());
    let first = CacheStoreManager::open(store.clone(), "v1").unwrap();
    first.install("v2", &[], &FakeNetwork::new()).await.unwrap();

    let reopened = CacheStoreManager::open(store.clone(), "v2").unwrap();
    assert_eq!(reopened.current().unwrap().version(), "v1");
    assert_eq!(reopened.state("v2").unwrap(), Some(LifecycleState::Installed));

    reopened.activate("v2").unwrap();
    assert_eq!(reopened.current().unwrap().version(), "v2");
  }
}
