//! Durable FIFO of mutations issued while offline.
//!
//! Actions are replayed strictly in enqueue order. A failing head stays in
//! place and stops the drain; the next drain starts from the same action.
//!
//! Several processes may share one queue file. Before replaying, a drain
//! claims the head for a lease; a head claimed by someone else stops the
//! drain until the claim is released or the lease runs out.

use chrono::{DateTime, SecondsFormat, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde::Serialize;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

use crate::http::{Headers, Method, Request};
use crate::network::Network;

/// Upper bound on a single replay attempt.
const REPLAY_TIMEOUT: Duration = Duration::from_secs(30);

/// How long a claim on the head is honoured; longer than any replay attempt.
const CLAIM_LEASE: Duration = Duration::from_secs(120);

/// How long to wait for another process's write lock on the queue file.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// A queued mutating request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OfflineAction {
  pub id: String,
  pub target: String,
  pub method: Method,
  pub headers: Headers,
  pub body: Option<Vec<u8>>,
  pub enqueued_at: DateTime<Utc>,
  pub attempts: u32,
}

impl OfflineAction {
  pub fn from_request(request: &Request) -> Self {
    Self {
      id: Uuid::new_v4().to_string(),
      target: request.url.to_string(),
      method: request.method,
      headers: request.headers.clone(),
      body: request.body.clone(),
      enqueued_at: Utc::now(),
      attempts: 0,
    }
  }

  pub fn to_request(&self) -> Result<Request> {
    let url = Url::parse(&self.target)
      .map_err(|e| eyre!("Invalid target for action {}: {}", self.id, e))?;

    Ok(Request {
      method: self.method,
      url,
      headers: self.headers.clone(),
      body: self.body.clone(),
      navigate: false,
      queue_if_offline: false,
    })
  }
}

/// Outcome of one drain cycle.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DrainReport {
  /// Ids replayed successfully, in replay order
  pub replayed: Vec<String>,
  /// Actions still queued after the drain
  pub remaining: usize,
  /// Head action whose replay failed, if the drain stopped early
  pub blocked_on: Option<String>,
  /// Head action being replayed by another drain, if the drain stopped there
  pub claimed_elsewhere: Option<String>,
}

/// Result of trying to claim the queue head.
enum Claim {
  Empty,
  Claimed(OfflineAction),
  /// Someone else holds an unexpired claim on this action
  Busy(String),
}

/// SQLite-backed offline action queue.
pub struct OfflineQueue {
  conn: Mutex<Connection>,
  /// One drain at a time, so each action is in flight at most once.
  drain_lock: tokio::sync::Mutex<()>,
}

const QUEUE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS offline_actions (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    id TEXT NOT NULL UNIQUE,
    target TEXT NOT NULL,
    method TEXT NOT NULL,
    headers TEXT NOT NULL,
    body BLOB,
    enqueued_at TEXT NOT NULL,
    attempts INTEGER NOT NULL DEFAULT 0,
    claimed_until TEXT
);
"#;

type ActionRow = (String, String, String, String, Option<Vec<u8>>, String, u32);

fn format_datetime(dt: DateTime<Utc>) -> String {
  dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}

const SELECT_ACTION: &str =
  "SELECT id, target, method, headers, body, enqueued_at, attempts FROM offline_actions";

impl OfflineQueue {
  pub fn open(path: &Path) -> Result<Self> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create queue directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open queue database at {}: {}", path.display(), e))?;
    Self::with_connection(conn)
  }

  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory queue database: {}", e))?;
    Self::with_connection(conn)
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    conn
      .busy_timeout(BUSY_TIMEOUT)
      .map_err(|e| eyre!("Failed to set queue busy timeout: {}", e))?;
    conn
      .execute_batch(QUEUE_SCHEMA)
      .map_err(|e| eyre!("Failed to run queue migrations: {}", e))?;

    // Queue files created before claims existed lack the column
    let has_claims: i64 = conn
      .query_row(
        "SELECT COUNT(*) FROM pragma_table_info('offline_actions') WHERE name = 'claimed_until'",
        [],
        |row| row.get(0),
      )
      .map_err(|e| eyre!("Failed to inspect queue schema: {}", e))?;
    if has_claims == 0 {
      conn
        .execute_batch("ALTER TABLE offline_actions ADD COLUMN claimed_until TEXT")
        .map_err(|e| eyre!("Failed to migrate queue schema: {}", e))?;
    }

    Ok(Self {
      conn: Mutex::new(conn),
      drain_lock: tokio::sync::Mutex::new(()),
    })
  }

  /// Append an action to the tail of the queue.
  pub fn enqueue(&self, action: OfflineAction) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    let headers = serde_json::to_string(&action.headers)
      .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;

    conn
      .execute(
        "INSERT INTO offline_actions (id, target, method, headers, body, enqueued_at, attempts)
         VALUES (?, ?, ?, ?, ?, ?, ?)",
        params![
          action.id,
          action.target,
          action.method.as_str(),
          headers,
          action.body,
          format_datetime(action.enqueued_at),
          action.attempts,
        ],
      )
      .map_err(|e| eyre!("Failed to enqueue action: {}", e))?;

    Ok(())
  }

  /// All retained actions, head first.
  pub fn list(&self) -> Result<Vec<OfflineAction>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let mut stmt = conn
      .prepare(&format!("{} ORDER BY seq", SELECT_ACTION))
      .map_err(|e| eyre!("Failed to prepare queue query: {}", e))?;

    let rows: Vec<ActionRow> = stmt
      .query_map([], read_row)
      .map_err(|e| eyre!("Failed to query queue: {}", e))?
      .collect::<rusqlite::Result<_>>()
      .map_err(|e| eyre!("Failed to read queue row: {}", e))?;

    rows.into_iter().map(action_from_row).collect()
  }

  pub fn len(&self) -> Result<usize> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let count: i64 = conn
      .query_row("SELECT COUNT(*) FROM offline_actions", [], |row| row.get(0))
      .map_err(|e| eyre!("Failed to count queue: {}", e))?;

    Ok(usize::try_from(count).unwrap_or_default())
  }

  pub fn is_empty(&self) -> Result<bool> {
    Ok(self.len()? == 0)
  }

  /// Whether any queued action targets `target`.
  pub fn contains_target(&self, target: &str) -> Result<bool> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let found: Option<i64> = conn
      .query_row(
        "SELECT 1 FROM offline_actions WHERE target = ? LIMIT 1",
        params![target],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to query queue: {}", e))?;

    Ok(found.is_some())
  }

  /// Claim the head for `lease`, unless another drain holds a live claim.
  fn claim_head(&self, now: DateTime<Utc>, lease: Duration) -> Result<Claim> {
    let mut conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    // IMMEDIATE takes the write lock up front, so two processes cannot both
    // read an unclaimed head and claim it.
    let tx = conn
      .transaction_with_behavior(TransactionBehavior::Immediate)
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    let head = tx
      .query_row(
        "SELECT id, target, method, headers, body, enqueued_at, attempts, claimed_until
         FROM offline_actions ORDER BY seq LIMIT 1",
        [],
        |row| Ok((read_row(row)?, row.get::<_, Option<String>>(7)?)),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read queue head: {}", e))?;

    let Some((row, claimed_until)) = head else {
      return Ok(Claim::Empty);
    };
    let action = action_from_row(row)?;

    if let Some(until) = claimed_until {
      if parse_datetime(&until)? > now {
        return Ok(Claim::Busy(action.id));
      }
      debug!(action_id = %action.id, "Claim expired, reclaiming");
    }

    let lease = chrono::Duration::from_std(lease)
      .map_err(|e| eyre!("Invalid claim lease: {}", e))?;
    tx.execute(
      "UPDATE offline_actions SET claimed_until = ? WHERE id = ?",
      params![format_datetime(now + lease), action.id],
    )
    .map_err(|e| eyre!("Failed to claim action {}: {}", action.id, e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(Claim::Claimed(action))
  }

  fn remove(&self, id: &str) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute("DELETE FROM offline_actions WHERE id = ?", params![id])
      .map_err(|e| eyre!("Failed to remove action {}: {}", id, e))?;
    Ok(())
  }

  fn record_failure(&self, id: &str) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute(
        "UPDATE offline_actions SET attempts = attempts + 1, claimed_until = NULL WHERE id = ?",
        params![id],
      )
      .map_err(|e| eyre!("Failed to update action {}: {}", id, e))?;
    Ok(())
  }

  /// Replay queued actions in FIFO order until the queue is empty or one fails.
  pub async fn drain(&self, network: &dyn Network) -> Result<DrainReport> {
    let _guard = self.drain_lock.lock().await;
    let mut report = DrainReport::default();

    loop {
      let action = match self.claim_head(Utc::now(), CLAIM_LEASE)? {
        Claim::Empty => break,
        Claim::Claimed(action) => action,
        Claim::Busy(id) => {
          debug!(action_id = %id, "Queue head is being replayed elsewhere");
          report.claimed_elsewhere = Some(id);
          break;
        }
      };

      let outcome = match action.to_request() {
        Ok(request) => match tokio::time::timeout(REPLAY_TIMEOUT, network.send(&request)).await {
          Ok(Ok(response)) if response.is_success() => Ok(()),
          Ok(Ok(response)) => Err(format!("status {}", response.status)),
          Ok(Err(e)) => Err(e.to_string()),
          Err(_) => Err(format!("replay timed out after {:?}", REPLAY_TIMEOUT)),
        },
        Err(e) => Err(e.to_string()),
      };

      match outcome {
        Ok(()) => {
          self.remove(&action.id)?;
          debug!(action_id = %action.id, target = %action.target, "Replayed queued action");
          report.replayed.push(action.id);
        }
        Err(reason) => {
          self.record_failure(&action.id)?;
          warn!(
            action_id = %action.id,
            target = %action.target,
            attempts = action.attempts + 1,
            reason = %reason,
            "Replay failed, leaving action at queue head"
          );
          report.blocked_on = Some(action.id);
          break;
        }
      }
    }

    report.remaining = self.len()?;
    info!(
      replayed = report.replayed.len(),
      remaining = report.remaining,
      "Drain finished"
    );

    Ok(report)
  }
}

fn read_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ActionRow> {
  Ok((
    row.get(0)?,
    row.get(1)?,
    row.get(2)?,
    row.get(3)?,
    row.get(4)?,
    row.get(5)?,
    row.get(6)?,
  ))
}

fn action_from_row(row: ActionRow) -> Result<OfflineAction> {
  let (id, target, method, headers, body, enqueued_at, attempts) = row;
  let headers: Headers =
    serde_json::from_str(&headers).map_err(|e| eyre!("Failed to deserialize headers: {}", e))?;
  let enqueued_at = parse_datetime(&enqueued_at)?;

  Ok(OfflineAction {
    id,
    target,
    method: Method::parse(&method)?,
    headers,
    body,
    enqueued_at,
    attempts,
  })
}
