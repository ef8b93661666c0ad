//! SQLite store implementation.

use chrono::{DateTime, SecondsFormat, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use super::traits::{CacheEntry, LifecycleState, Store};
use crate::http::{CacheKey, Headers, Response};

/// SQLite-based cache storage implementation.
pub struct SqliteStore {
  conn: Mutex<Connection>,
}

impl SqliteStore {
  /// Open (or create) a store at the given path.
  pub fn open(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

    Self::with_connection(conn)
  }

  #[cfg(test)]
  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory cache database: {}", e))?;
    Self::with_connection(conn)
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    let store = Self {
      conn: Mutex::new(conn),
    };
    store.run_migrations()?;
    Ok(store)
  }

  /// Get the default database path.
  pub fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("intercache").join("cache.db"))
  }

  /// Run database migrations for cache tables.
  fn run_migrations(&self) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;

    Ok(())
  }
}

/// Schema for cache tables.
const CACHE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS generations (
    name TEXT PRIMARY KEY,
    created_at TEXT NOT NULL
);

-- One row per cached response; key_hash is sha256(cache_key)
CREATE TABLE IF NOT EXISTS cache_entries (
    generation TEXT NOT NULL,
    key_hash TEXT NOT NULL,
    cache_key TEXT NOT NULL,
    status INTEGER NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    stored_at TEXT NOT NULL,
    PRIMARY KEY (generation, key_hash)
);

CREATE INDEX IF NOT EXISTS idx_cache_entries_stored
    ON cache_entries(generation, stored_at);

-- Lifecycle state per deployed version; exactly one row is 'active' once
-- a version has been promoted
CREATE TABLE IF NOT EXISTS lifecycle (
    version TEXT PRIMARY KEY,
    state TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
"#;

/// Stable fixed-length row id for a cache key.
fn key_hash(key: &CacheKey) -> String {
  let mut hasher = Sha256::new();
  hasher.update(key.as_str().as_bytes());
  hex::encode(hasher.finalize())
}

fn format_datetime(dt: DateTime<Utc>) -> String {
  dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Parse a datetime string stored by `format_datetime`.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}

impl Store for SqliteStore {
  fn get(&self, generation: &str, key: &CacheKey) -> Result<Option<CacheEntry>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let row: Option<(u16, String, Vec<u8>, String)> = conn
      .query_row(
        "SELECT status, headers, body, stored_at FROM cache_entries
         WHERE generation = ? AND key_hash = ?",
        params![generation, key_hash(key)],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read cache entry: {}", e))?;

    match row {
      Some((status, headers, body, stored_at)) => {
        let headers: Headers = serde_json::from_str(&headers)
          .map_err(|e| eyre!("Failed to deserialize headers: {}", e))?;
        let stored_at = parse_datetime(&stored_at)?;
        Ok(Some(CacheEntry::stored_at(
          Response {
            status,
            headers,
            body,
          },
          stored_at,
        )))
      }
      None => Ok(None),
    }
  }

  fn put(&self, generation: &str, key: &CacheKey, entry: &CacheEntry) -> Result<()> {
    let mut conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    let headers = serde_json::to_string(&entry.response.headers)
      .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;

    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    let exists: Option<i64> = tx
      .query_row(
        "SELECT 1 FROM generations WHERE name = ?",
        params![generation],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to look up generation: {}", e))?;
    if exists.is_none() {
      return Err(eyre!("Generation {} does not exist", generation));
    }

    tx.execute(
      "INSERT OR REPLACE INTO cache_entries
         (generation, key_hash, cache_key, status, headers, body, stored_at)
       VALUES (?, ?, ?, ?, ?, ?, ?)",
      params![
        generation,
        key_hash(key),
        key.as_str(),
        entry.response.status,
        headers,
        entry.response.body,
        format_datetime(entry.stored_at),
      ],
    )
    .map_err(|e| eyre!("Failed to store cache entry: {}", e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(())
  }

  fn delete(&self, generation: &str, key: &CacheKey) -> Result<bool> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let removed = conn
      .execute(
        "DELETE FROM cache_entries WHERE generation = ? AND key_hash = ?",
        params![generation, key_hash(key)],
      )
      .map_err(|e| eyre!("Failed to delete cache entry: {}", e))?;

    Ok(removed > 0)
  }

  fn delete_if_older(
    &self,
    generation: &str,
    key: &CacheKey,
    cutoff: DateTime<Utc>,
  ) -> Result<bool> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    // stored_at is fixed-width UTC, so text order is time order
    let removed = conn
      .execute(
        "DELETE FROM cache_entries
         WHERE generation = ? AND key_hash = ? AND stored_at < ?",
        params![generation, key_hash(key), format_datetime(cutoff)],
      )
      .map_err(|e| eyre!("Failed to delete cache entry: {}", e))?;

    Ok(removed > 0)
  }

  fn entries(&self, generation: &str) -> Result<Vec<(CacheKey, DateTime<Utc>)>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let mut stmt = conn
      .prepare(
        "SELECT cache_key, stored_at FROM cache_entries
         WHERE generation = ?
         ORDER BY stored_at",
      )
      .map_err(|e| eyre!("Failed to prepare entry query: {}", e))?;

    let rows: Vec<(String, String)> = stmt
      .query_map(params![generation], |row| Ok((row.get(0)?, row.get(1)?)))
      .map_err(|e| eyre!("Failed to query entries: {}", e))?
      .collect::<rusqlite::Result<_>>()
      .map_err(|e| eyre!("Failed to read entry row: {}", e))?;

    rows
      .into_iter()
      .map(|(key, stored_at)| Ok((CacheKey::from_raw(key), parse_datetime(&stored_at)?)))
      .collect()
  }

  fn create_generation(&self, generation: &str) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute(
        "INSERT OR IGNORE INTO generations (name, created_at) VALUES (?, ?)",
        params![generation, format_datetime(Utc::now())],
      )
      .map_err(|e| eyre!("Failed to create generation {}: {}", generation, e))?;

    Ok(())
  }

  fn list_generations(&self) -> Result<Vec<String>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let mut stmt = conn
      .prepare("SELECT name FROM generations ORDER BY name")
      .map_err(|e| eyre!("Failed to prepare generation query: {}", e))?;

    let names = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to query generations: {}", e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read generation row: {}", e))?;

    Ok(names)
  }

  fn delete_generation(&self, generation: &str) -> Result<()> {
    let mut conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute(
      "DELETE FROM cache_entries WHERE generation = ?",
      params![generation],
    )
    .map_err(|e| eyre!("Failed to delete entries of {}: {}", generation, e))?;

    tx.execute("DELETE FROM generations WHERE name = ?", params![generation])
      .map_err(|e| eyre!("Failed to delete generation {}: {}", generation, e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(())
  }

  fn lifecycle(&self) -> Result<Vec<(String, LifecycleState)>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let mut stmt = conn
      .prepare("SELECT version, state FROM lifecycle ORDER BY version")
      .map_err(|e| eyre!("Failed to prepare lifecycle query: {}", e))?;

    let rows: Vec<(String, String)> = stmt
      .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
      .map_err(|e| eyre!("Failed to query lifecycle: {}", e))?
      .collect::<rusqlite::Result<_>>()
      .map_err(|e| eyre!("Failed to read lifecycle row: {}", e))?;

    rows
      .into_iter()
      .map(|(version, state)| Ok((version, LifecycleState::parse(&state)?)))
      .collect()
  }

  fn set_lifecycle(&self, version: &str, state: LifecycleState) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute(
        "INSERT OR REPLACE INTO lifecycle (version, state, updated_at) VALUES (?, ?, ?)",
        params![version, state.as_str(), format_datetime(Utc::now())],
      )
      .map_err(|e| eyre!("Failed to record state of {}: {}", version, e))?;

    Ok(())
  }

  fn promote(&self, version: &str) -> Result<()> {
    let mut conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute("DELETE FROM lifecycle WHERE version != ?", params![version])
      .map_err(|e| eyre!("Failed to retire old versions: {}", e))?;

    tx.execute(
      "INSERT OR REPLACE INTO lifecycle (version, state, updated_at) VALUES (?, ?, ?)",
      params![
        version,
        LifecycleState::Active.as_str(),
        format_datetime(Utc::now())
      ],
    )
    .map_err(|e| eyre!("Failed to activate {}: {}", version, e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(())
  }
}
