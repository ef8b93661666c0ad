//! External triggers for the janitor and the offline queue.
//!
//! The core components have no timers. This module turns wall-clock ticks
//! and connectivity changes into events that the run loop maps onto
//! `Janitor::sweep` and `OfflineQueue::drain`.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;
use url::Url;

use crate::http::{Method, Request};
use crate::network::Network;

/// Longest a single connectivity probe may take before it counts as offline.
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Trigger events
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
  /// Scheduled janitor run
  Sweep,
  /// Connectivity came back (or was present at startup)
  Reconnect,
}

/// Tracks online/offline transitions from successive probe results.
#[derive(Debug, Default)]
pub struct ConnectivityTracker {
  online: Option<bool>,
}

impl ConnectivityTracker {
  /// Record a probe result; returns true when this is a reconnect.
  pub fn observe(&mut self, online: bool) -> bool {
    let was_online = self.online.replace(online);
    online && was_online != Some(true)
  }
}

/// Event handler that produces events from a sweep timer and a connectivity probe
pub struct EventHandler {
  rx: mpsc::UnboundedReceiver<Event>,
}

impl EventHandler {
  pub fn new(
    sweep_interval: Duration,
    probe_interval: Duration,
    network: Arc<dyn Network>,
    probe_url: Url,
  ) -> Self {
    let (tx, rx) = mpsc::unbounded_channel();

    // Spawn sweep timer
    let sweep_tx = tx.clone();
    tokio::spawn(async move {
      let mut ticker = tokio::time::interval(sweep_interval);
      // first tick completes immediately
      ticker.tick().await;
      loop {
        ticker.tick().await;
        if sweep_tx.send(Event::Sweep).is_err() {
          break;
        }
      }
    });

    // Spawn connectivity probe
    let probe_timeout = probe_interval.min(PROBE_TIMEOUT);
    tokio::spawn(async move {
      let mut tracker = ConnectivityTracker::default();
      let mut ticker = tokio::time::interval(probe_interval);
      ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
      loop {
        ticker.tick().await;
        let probe = Request::new(Method::Head, probe_url.clone());
        let online = matches!(
          tokio::time::timeout(probe_timeout, network.send(&probe)).await,
          Ok(Ok(_))
        );
        debug!(online, "Connectivity probe");
        if tracker.observe(online) && tx.send(Event::Reconnect).is_err() {
          break;
        }
      }
    });

    Self { rx }
  }

  /// Receive the next event
  pub async fn next(&mut self) -> Option<Event> {
    self.rx.recv().await
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::http::Response;
  use crate::network::testing::FakeNetwork;

  #[test]
  fn test_tracker_reports_transitions_to_online() {
    let mut tracker = ConnectivityTracker::default();
    assert!(tracker.observe(true));
    assert!(!tracker.observe(true));
    assert!(!tracker.observe(false));
    assert!(!tracker.observe(false));
    assert!(tracker.observe(true));
  }

  #[test]
  fn test_tracker_starting_offline() {
    let mut tracker = ConnectivityTracker::default();
    assert!(!tracker.observe(false));
    assert!(tracker.observe(true));
  }

  #[tokio::test]
  async fn test_handler_emits_reconnect_and_sweep() {
    let network = Arc::new(FakeNetwork::new());
    network.respond("https://example.com/", Response::new(200, ""));
    let mut events = EventHandler::new(
      Duration::from_millis(30),
      Duration::from_millis(10),
      network,
      Url::parse("https://example.com/").unwrap(),
    );

    let mut seen = Vec::new();
    while seen.len() < 2 {
      match tokio::time::timeout(Duration::from_secs(2), events.next()).await {
        Ok(Some(event)) if !seen.contains(&event) => seen.push(event),
        Ok(Some(_)) => {}
        _ => break,
      }
    }
    assert!(seen.contains(&Event::Reconnect));
    assert!(seen.contains(&Event::Sweep));
  }

  #[tokio::test]
  async fn test_hung_check_does_not_stall_reconnect() {
    let network = Arc::new(FakeNetwork::new());
    network.respond("https://example.com/", Response::new(200, ""));
    network.set_delay(Some(Duration::from_secs(10)));
    let mut events = EventHandler::new(
      Duration::from_secs(3600),
      Duration::from_millis(50),
      network.clone(),
      Url::parse("https://example.com/").unwrap(),
    );

    tokio::time::sleep(Duration::from_millis(200)).await;
    network.set_delay(None);

    let event = tokio::time::timeout(Duration::from_secs(2), events.next()).await;
    assert_eq!(event.ok().flatten(), Some(Event::Reconnect));
  }
}
