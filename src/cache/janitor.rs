//! Time-based eviction of old cache entries.

use chrono::{DateTime, Duration, Utc};
use color_eyre::Result;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::traits::Store;

/// Default age after which entries are evicted (30 days).
pub const DEFAULT_HORIZON_DAYS: i64 = 30;

/// Outcome of one sweep pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
  pub scanned: usize,
  pub deleted: usize,
  pub failed: usize,
}

/// Deletes entries older than a single horizon from every generation.
///
/// The janitor has no timer of its own; `sweep` is called by whatever
/// schedules it.
pub struct Janitor {
  store: Arc<dyn Store>,
  horizon: Duration,
}

impl Janitor {
  pub fn new(store: Arc<dyn Store>) -> Self {
    Self {
      store,
      horizon: Duration::days(DEFAULT_HORIZON_DAYS),
    }
  }

  pub fn with_horizon(mut self, horizon: Duration) -> Self {
    self.horizon = horizon;
    self
  }

  pub fn sweep(&self) -> Result<SweepReport> {
    self.sweep_at(Utc::now())
  }

  /// Sweep as if the current time were `now`.
  ///
  /// Only failing to list generations is an error; per-generation and
  /// per-entry failures are counted and skipped. The age is checked again by
  /// the store at delete time, so an entry refreshed mid-sweep is kept.
  pub fn sweep_at(&self, now: DateTime<Utc>) -> Result<SweepReport> {
    let mut report = SweepReport::default();
    let cutoff = now
      .checked_sub_signed(self.horizon)
      .unwrap_or(DateTime::<Utc>::MIN_UTC);

    for generation in self.store.list_generations()? {
      let entries = match self.store.entries(&generation) {
        Ok(entries) => entries,
        Err(e) => {
          warn!(generation = %generation, error = %e, "Failed to list entries, skipping");
          report.failed += 1;
          continue;
        }
      };

      for (key, stored_at) in entries {
        report.scanned += 1;
        if stored_at >= cutoff {
          continue;
        }

        match self.store.delete_if_older(&generation, &key, cutoff) {
          Ok(true) => {
            debug!(generation = %generation, key = %key, "Evicted expired entry");
            report.deleted += 1;
          }
          Ok(false) => debug!(generation = %generation, key = %key, "Entry refreshed, kept"),
          Err(e) => {
            warn!(generation = %generation, key = %key, error = %e, "Failed to evict entry");
            report.failed += 1;
          }
        }
      }
    }

    info!(
      scanned = report.scanned,
      deleted = report.deleted,
      failed = report.failed,
      "Sweep finished"
    );

    Ok(report)
  }
}
