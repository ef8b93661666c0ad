//! Core traits and types for the caching system.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};

use crate::http::{CacheKey, Response};

/// A stored response snapshot.
///
/// Entries are immutable once stored; an update replaces the whole entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
  pub response: Response,
  pub stored_at: DateTime<Utc>,
}

impl CacheEntry {
  pub fn new(response: Response) -> Self {
    Self::stored_at(response, Utc::now())
  }

  pub fn stored_at(response: Response, stored_at: DateTime<Utc>) -> Self {
    Self {
      response,
      stored_at,
    }
  }

  pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
    now - self.stored_at
  }
}

/// Lifecycle of a version's generations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
  Installing,
  Installed,
  Activating,
  Active,
}

impl LifecycleState {
  pub fn as_str(&self) -> &'static str {
    match self {
      LifecycleState::Installing => "installing",
      LifecycleState::Installed => "installed",
      LifecycleState::Activating => "activating",
      LifecycleState::Active => "active",
    }
  }

  pub fn parse(s: &str) -> Result<Self> {
    match s {
      "installing" => Ok(LifecycleState::Installing),
      "installed" => Ok(LifecycleState::Installed),
      "activating" => Ok(LifecycleState::Activating),
      "active" => Ok(LifecycleState::Active),
      other => Err(eyre!("Unknown lifecycle state: {}", other)),
    }
  }
}

/// Trait for cache storage backends.
///
/// Every operation is atomic per key; no global lock is implied across keys.
/// Generations must exist (`create_generation`) before entries are written
/// to them, so a write racing a generation's deletion cannot bring it back.
pub trait Store: Send + Sync {
  /// Get an entry from a generation.
  fn get(&self, generation: &str, key: &CacheKey) -> Result<Option<CacheEntry>>;

  /// Store an entry, replacing any prior entry for the key.
  /// Fails if the generation does not exist.
  fn put(&self, generation: &str, key: &CacheKey, entry: &CacheEntry) -> Result<()>;

  /// Delete an entry. Returns whether anything was removed.
  fn delete(&self, generation: &str, key: &CacheKey) -> Result<bool>;

  /// Delete an entry only if it was stored strictly before `cutoff`.
  ///
  /// The age check and the delete are one atomic step, so an entry replaced
  /// after the caller looked at it survives.
  fn delete_if_older(
    &self,
    generation: &str,
    key: &CacheKey,
    cutoff: DateTime<Utc>,
  ) -> Result<bool>;

  /// Keys and stored-at timestamps of every entry in a generation.
  fn entries(&self, generation: &str) -> Result<Vec<(CacheKey, DateTime<Utc>)>>;

  /// Make sure a (possibly empty) generation exists.
  fn create_generation(&self, generation: &str) -> Result<()>;

  /// Names of all physically present generations.
  fn list_generations(&self) -> Result<Vec<String>>;

  /// Delete a generation with all of its entries.
  fn delete_generation(&self, generation: &str) -> Result<()>;

  /// Recorded lifecycle state of every known version.
  fn lifecycle(&self) -> Result<Vec<(String, LifecycleState)>>;

  /// Record the lifecycle state of a version.
  fn set_lifecycle(&self, version: &str, state: LifecycleState) -> Result<()>;

  /// Make `version` the only active version and forget every other one.
  fn promote(&self, version: &str) -> Result<()>;
}

/// Result from a cache operation, including data and metadata about the source.
#[derive(Debug, Clone)]
pub struct CacheResult<T> {
  /// The actual data
  pub data: T,
  /// Where the data came from
  pub source: CacheSource,
  /// When the data was cached (if from cache)
  pub cached_at: Option<DateTime<Utc>>,
}

impl<T> CacheResult<T> {
  /// Create a new cache result from fresh network data.
  pub fn from_network(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Network,
      cached_at: None,
    }
  }

  /// Create a new cache result from cached data.
  pub fn from_cache(data: T, cached_at: DateTime<Utc>, is_stale: bool) -> Self {
    Self {
      data,
      source: if is_stale {
        CacheSource::CacheStale
      } else {
        CacheSource::CacheFresh
      },
      cached_at: Some(cached_at),
    }
  }

  /// Create a new cache result for offline mode.
  pub fn offline(data: T, cached_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source: CacheSource::Offline,
      cached_at: Some(cached_at),
    }
  }

  /// Data produced locally because neither network nor cache could answer.
  pub fn synthesized(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Synthesized,
      cached_at: None,
    }
  }

  /// A mutation accepted into the offline queue.
  pub fn queued(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Queued,
      cached_at: None,
    }
  }
}

/// Indicates where a response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Fresh data from network
  Network,
  /// Data from cache, still considered fresh
  CacheFresh,
  /// Data from cache past its TTL, or served while revalidating
  CacheStale,
  /// Offline mode - network unavailable, serving cached data
  Offline,
  /// Offline error or offline document built locally
  Synthesized,
  /// Mutation stored in the offline queue for later replay
  Queued,
}
