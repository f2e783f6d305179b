use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Result, SyncError};

/// Application name used for config/data directory paths
const APP_NAME: &str = "portal-sync";

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub api: ApiConfig,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub outbox: OutboxConfig,
  #[serde(default)]
  pub agent: AgentConfig,
  #[serde(default)]
  pub log: LogConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
  /// Spreadsheet API deployment URL
  pub url: String,
  /// Per-request timeout budget
  #[serde(default = "default_timeout_secs")]
  pub timeout_secs: u64,
}

impl ApiConfig {
  pub fn timeout(&self) -> Duration {
    Duration::from_secs(self.timeout_secs)
  }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  /// Cache database location (default: $XDG_DATA_HOME/portal-sync/cache.db)
  pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OutboxConfig {
  /// Queue file location (default: $XDG_DATA_HOME/portal-sync/outbox.json)
  pub path: Option<PathBuf>,
  pub max_retries: u32,
  pub base_delay_ms: u64,
  pub bootstrap_delay_ms: u64,
  pub reconnect_delay_ms: u64,
}

impl Default for OutboxConfig {
  fn default() -> Self {
    Self {
      path: None,
      max_retries: 3,
      base_delay_ms: 3_000,
      bootstrap_delay_ms: 2_000,
      reconnect_delay_ms: 1_000,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
  /// Version identifier; caches from other versions are deleted on activation
  pub version: String,
  pub cache_prefix: String,
  /// Origin the manifest paths are resolved against
  pub origin: String,
  /// Static asset paths pre-cached at install
  pub manifest: Vec<String>,
  /// Hosts never intercepted (the data API)
  pub passthrough_hosts: Vec<String>,
  /// Hosts served cache-first
  pub cache_first_hosts: Vec<String>,
  /// Resource cache database (default: $XDG_DATA_HOME/portal-sync/agent.db)
  pub path: Option<PathBuf>,
}

impl Default for AgentConfig {
  fn default() -> Self {
    Self {
      version: "v3".to_string(),
      cache_prefix: "portal-static".to_string(),
      origin: "http://localhost:8080/".to_string(),
      manifest: [
        "/",
        "/index.html",
        "/admin.html",
        "/scores.html",
        "/css/styles.css",
        "/js/config.js",
        "/js/api.js",
        "/js/student.js",
        "/js/admin.js",
        "/manifest.json",
      ]
      .iter()
      .map(|s| s.to_string())
      .collect(),
      passthrough_hosts: vec![
        "script.google.com".to_string(),
        "script.googleusercontent.com".to_string(),
      ],
      cache_first_hosts: vec![
        "fonts.googleapis.com".to_string(),
        "fonts.gstatic.com".to_string(),
      ],
      path: None,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
  /// Default filter when RUST_LOG is not set
  pub level: String,
  /// Write daily-rolling log files here instead of stderr
  pub directory: Option<PathBuf>,
}

impl Default for LogConfig {
  fn default() -> Self {
    Self {
      level: "warn".to_string(),
      directory: None,
    }
  }
}

fn default_timeout_secs() -> u64 {
  30
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./portal-sync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/portal-sync/config.yaml
  ///
  /// `PORTAL_SYNC_API_URL` overrides `api.url`.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(SyncError::Config(format!("Config file not found: {}", p.display())));
      }
    } else {
      Self::find_config_file()
    };

    let mut config = match path {
      Some(p) => Self::load_from_path(&p)?,
      None => {
        return Err(SyncError::Config(format!(
          "No configuration file found. Create one at ~/.config/{}/config.yaml",
          APP_NAME
        )))
      }
    };

    if let Ok(url) = std::env::var("PORTAL_SYNC_API_URL") {
      config.api.url = url;
    }

    Ok(config)
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from(format!("{}.yaml", APP_NAME));
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join(APP_NAME).join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)?;

    serde_yaml::from_str(&contents).map_err(|e| {
      SyncError::Config(format!(
        "Failed to parse config file {}: {}",
        path.display(),
        e
      ))
    })
  }
}

/// Platform data directory for this application.
pub fn data_dir() -> Result<PathBuf> {
  let data_dir = dirs::data_dir()
    .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
    .ok_or_else(|| SyncError::StorageUnavailable("Could not determine data directory".into()))?;

  Ok(data_dir.join(APP_NAME))
}
