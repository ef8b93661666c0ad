//! Push notification payloads, accepted and forwarded without interpretation.

use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

/// Title used when a payload does not carry one.
pub const DEFAULT_TITLE: &str = "intercache";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushAction {
  pub action: String,
  pub title: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub icon: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushPayload {
  #[serde(default = "default_title")]
  pub title: String,
  #[serde(default)]
  pub body: String,
  #[serde(default)]
  pub data: Value,
  #[serde(default)]
  pub actions: Vec<PushAction>,
}

fn default_title() -> String {
  DEFAULT_TITLE.to_string()
}

/// Receiver of decoded notifications (a UI layer, an OS bridge, ...).
pub trait NotificationSink: Send + Sync {
  fn deliver(&self, payload: &PushPayload) -> Result<()>;
}

/// Sink that only records the notification in the log.
pub struct LogSink;

impl NotificationSink for LogSink {
  fn deliver(&self, payload: &PushPayload) -> Result<()> {
    info!(
      title = %payload.title,
      body = %payload.body,
      actions = payload.actions.len(),
      "Notification received"
    );
    Ok(())
  }
}

/// Decodes raw push messages and hands them to a sink.
pub struct NotificationAdapter<S: NotificationSink> {
  sink: S,
}

impl<S: NotificationSink> NotificationAdapter<S> {
  pub fn new(sink: S) -> Self {
    Self { sink }
  }

  /// Accept a raw payload. An empty message yields a default notification.
  pub fn accept(&self, raw: &[u8]) -> Result<PushPayload> {
    let payload: PushPayload = if raw.iter().all(u8::is_ascii_whitespace) {
      serde_json::from_str("{}").map_err(|e| eyre!("Failed to build default payload: {}", e))?
    } else {
      serde_json::from_slice(raw).map_err(|e| eyre!("Invalid push payload: {}", e))?
    };

    self.sink.deliver(&payload)?;
    Ok(payload)
  }
}
