//! In-memory store backend.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use super::traits::{CacheEntry, LifecycleState, Store};
use crate::http::CacheKey;

/// Store backed by nested hash maps. Nothing survives the process.
#[derive(Default)]
pub struct MemoryStore {
  generations: RwLock<HashMap<String, HashMap<CacheKey, CacheEntry>>>,
  versions: RwLock<BTreeMap<String, LifecycleState>>,
}

impl MemoryStore {
  pub fn new() -> Self {
    Self::default()
  }
}

impl Store for MemoryStore {
  fn get(&self, generation: &str, key: &CacheKey) -> Result<Option<CacheEntry>> {
    let generations = self
      .generations
      .read()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    Ok(generations.get(generation).and_then(|g| g.get(key)).cloned())
  }

  fn put(&self, generation: &str, key: &CacheKey, entry: &CacheEntry) -> Result<()> {
    let mut generations = self
      .generations
      .write()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    generations
      .get_mut(generation)
      .ok_or_else(|| eyre!("Generation {} does not exist", generation))?
      .insert(key.clone(), entry.clone());
    Ok(())
  }

  fn delete(&self, generation: &str, key: &CacheKey) -> Result<bool> {
    let mut generations = self
      .generations
      .write()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    Ok(
      generations
        .get_mut(generation)
        .map(|g| g.remove(key).is_some())
        .unwrap_or(false),
    )
  }

  fn delete_if_older(
    &self,
    generation: &str,
    key: &CacheKey,
    cutoff: DateTime<Utc>,
  ) -> Result<bool> {
    let mut generations = self
      .generations
      .write()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let Some(entries) = generations.get_mut(generation) else {
      return Ok(false);
    };
    let expired = entries
      .get(key)
      .is_some_and(|entry| entry.stored_at < cutoff);
    if expired {
      entries.remove(key);
    }
    Ok(expired)
  }

  fn entries(&self, generation: &str) -> Result<Vec<(CacheKey, DateTime<Utc>)>> {
    let generations = self
      .generations
      .read()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    Ok(
      generations
        .get(generation)
        .map(|g| {
          g.iter()
            .map(|(key, entry)| (key.clone(), entry.stored_at))
            .collect()
        })
        .unwrap_or_default(),
    )
  }

  fn create_generation(&self, generation: &str) -> Result<()> {
    let mut generations = self
      .generations
      .write()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    generations.entry(generation.to_string()).or_default();
    Ok(())
  }

  fn list_generations(&self) -> Result<Vec<String>> {
    let generations = self
      .generations
      .read()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let mut names: Vec<String> = generations.keys().cloned().collect();
    names.sort();
    Ok(names)
  }

  fn delete_generation(&self, generation: &str) -> Result<()> {
    let mut generations = self
      .generations
      .write()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    generations.remove(generation);
    Ok(())
  }

  fn lifecycle(&self) -> Result<Vec<(String, LifecycleState)>> {
    let versions = self
      .versions
      .read()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    Ok(versions.iter().map(|(v, s)| (v.clone(), *s)).collect())
  }

  fn set_lifecycle(&self, version: &str, state: LifecycleState) -> Result<()> {
    let mut versions = self
      .versions
      .write()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    versions.insert(version.to_string(), state);
    Ok(())
  }

  fn promote(&self, version: &str) -> Result<()> {
    let mut versions = self
      .versions
      .write()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    versions.clear();
    versions.insert(version.to_string(), LifecycleState::Active);
    Ok(())
  }
}
