use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use crate::cache::DEFAULT_HORIZON_DAYS;
use crate::intercept::{
  default_rules, Rule, DEFAULT_MAX_ENTRY_BYTES, DEFAULT_NETWORK_TIMEOUT, DEFAULT_SENSITIVE,
};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  /// Base URL that relative request paths resolve against
  pub origin: Url,
  /// Version tag of the current deployment (generation suffix)
  #[serde(default = "default_version")]
  pub version: String,
  /// Cache database location (default: $XDG_DATA_HOME/intercache/cache.db)
  pub store_path: Option<PathBuf>,
  #[serde(default = "default_timeout_secs")]
  pub network_timeout_secs: u64,
  #[serde(default = "default_max_entry_bytes")]
  pub max_entry_bytes: usize,
  /// Document served to navigations while offline
  #[serde(default = "default_offline_document")]
  pub offline_document: String,
  /// Path fragments that must never be cached
  #[serde(default = "default_sensitive")]
  pub sensitive: Vec<String>,
  /// Resources fetched and stored on install
  #[serde(default)]
  pub manifest: Vec<String>,
  /// Classification rules; the built-in table is used when empty
  #[serde(default)]
  pub rules: Vec<Rule>,
  #[serde(default)]
  pub janitor: JanitorConfig,
  #[serde(default)]
  pub drain: DrainConfig,
  /// Also write logs to files in this directory
  pub log_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JanitorConfig {
  #[serde(default = "default_horizon_days")]
  pub horizon_days: i64,
  #[serde(default = "default_interval_hours")]
  pub interval_hours: u64,
}

impl Default for JanitorConfig {
  fn default() -> Self {
    Self {
      horizon_days: default_horizon_days(),
      interval_hours: default_interval_hours(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DrainConfig {
  /// How often connectivity is probed to detect a reconnect
  #[serde(default = "default_probe_interval_secs")]
  pub probe_interval_secs: u64,
}

impl Default for DrainConfig {
  fn default() -> Self {
    Self {
      probe_interval_secs: default_probe_interval_secs(),
    }
  }
}

fn default_version() -> String {
  "v1".to_string()
}

fn default_timeout_secs() -> u64 {
  DEFAULT_NETWORK_TIMEOUT.as_secs()
}

fn default_max_entry_bytes() -> usize {
  DEFAULT_MAX_ENTRY_BYTES
}

fn default_offline_document() -> String {
  "/offline.html".to_string()
}

fn default_sensitive() -> Vec<String> {
  DEFAULT_SENSITIVE.iter().map(|s| s.to_string()).collect()
}

fn default_horizon_days() -> i64 {
  DEFAULT_HORIZON_DAYS
}

fn default_interval_hours() -> u64 {
  24
}

fn default_probe_interval_secs() -> u64 {
  30
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./intercache.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/intercache/config.yaml
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Err(eyre!(
        "No configuration file found. Create one at ~/.config/intercache/config.yaml\n\
                 See config.example.yaml for the format."
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("intercache.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("intercache").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::from_yaml(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn from_yaml(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents).map_err(|e| eyre!("{}", e))?;
    config.validate()?;
    Ok(config)
  }

  /// Reject values the duration accessors cannot represent.
  fn validate(&self) -> Result<()> {
    if self.janitor.horizon_days < 0 {
      return Err(eyre!("janitor.horizon_days must not be negative"));
    }
    self.janitor_horizon()?;
    self.sweep_interval()?;
    self.probe_interval()?;
    Ok(())
  }

  /// Resolve a path or absolute URL against the origin.
  pub fn resolve(&self, target: &str) -> Result<Url> {
    self
      .origin
      .join(target)
      .map_err(|e| eyre!("Invalid URL {}: {}", target, e))
  }

  pub fn manifest_urls(&self) -> Result<Vec<Url>> {
    self.manifest.iter().map(|m| self.resolve(m)).collect()
  }

  pub fn offline_document_url(&self) -> Result<Url> {
    self.resolve(&self.offline_document)
  }

  pub fn rules(&self) -> Vec<Rule> {
    if self.rules.is_empty() {
      default_rules()
    } else {
      self.rules.clone()
    }
  }

  pub fn network_timeout(&self) -> Duration {
    Duration::from_secs(self.network_timeout_secs)
  }

  pub fn janitor_horizon(&self) -> Result<chrono::Duration> {
    chrono::Duration::try_days(self.janitor.horizon_days)
      .ok_or_else(|| eyre!("janitor.horizon_days is out of range: {}", self.janitor.horizon_days))
  }

  pub fn sweep_interval(&self) -> Result<Duration> {
    match self.janitor.interval_hours.checked_mul(3600) {
      Some(secs) if secs > 0 => Ok(Duration::from_secs(secs)),
      _ => Err(eyre!(
        "janitor.interval_hours must be between 1 and {}: {}",
        u64::MAX / 3600,
        self.janitor.interval_hours
      )),
    }
  }

  pub fn probe_interval(&self) -> Result<Duration> {
    if self.drain.probe_interval_secs == 0 {
      return Err(eyre!("drain.probe_interval_secs must be at least 1"));
    }
    Ok(Duration::from_secs(self.drain.probe_interval_secs))
  }
}
