use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::cache::Expiration;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub api: ApiConfig,
}

/// Which storage backend a cache uses.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
  /// One JSON document per entity type
  #[default]
  Json,
  /// A SQLite database shared by all entity types
  Sqlite,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  pub backend: Backend,
  /// Directory holding the cache files
  pub path: PathBuf,
  /// Seconds before a cached record is stale. Unset or 0 never expires.
  pub expire_after: Option<u64>,
  /// Maximum records kept per JSON document
  pub max_length: usize,
  /// Extra seconds past expiry during which cached data is still served when
  /// the API is unreachable
  pub offline_grace: u64,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      backend: Backend::default(),
      path: default_cache_dir(),
      expire_after: None,
      max_length: 10_000,
      offline_grace: 7 * 24 * 60 * 60,
    }
  }
}

impl CacheConfig {
  pub fn expiration(&self) -> Expiration {
    Expiration::from(self.expire_after.map(std::time::Duration::from_secs))
  }

  /// Values too large to represent saturate, which in practice means cached
  /// data is always served while offline.
  pub fn offline_grace(&self) -> chrono::Duration {
    chrono::Duration::from_std(std::time::Duration::from_secs(self.offline_grace))
      .unwrap_or(chrono::Duration::MAX)
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
  pub base_url: String,
  /// Request timeout in seconds
  pub timeout: u64,
  /// Attempts repeated after a server error
  pub retries: u32,
  pub retry_delay_ms: u64,
}

impl Default for ApiConfig {
  fn default() -> Self {
    Self {
      base_url: "https://api.track.toggl.com/api/v9/".to_string(),
      timeout: 10,
      retries: 3,
      retry_delay_ms: 1_000,
    }
  }
}

fn default_cache_dir() -> PathBuf {
  dirs::data_dir()
    .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
    .unwrap_or_else(std::env::temp_dir)
    .join("toggl-cache")
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./toggl-cache.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/toggl-cache/config.yaml
  ///
  /// Without any file the defaults are used.
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
      None => Ok(Self::default()),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("toggl-cache.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("toggl-cache").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  fn parse(contents: &str) -> Result<Self, serde_yaml::Error> {
    // An empty file is a valid, all-defaults config.
    if contents.trim().is_empty() {
      return Ok(Self::default());
    }
    serde_yaml::from_str(contents)
  }

  /// Get the Toggl API token from environment variables.
  ///
  /// Checks TOGGL_API_TOKEN first, then TOGGL_TOKEN as fallback.
  pub fn get_api_token() -> Result<String> {
    std::env::var("TOGGL_API_TOKEN")
      .or_else(|_| std::env::var("TOGGL_TOKEN"))
      .map_err(|_| {
        eyre!("Toggl API token not found. Set TOGGL_API_TOKEN or TOGGL_TOKEN environment variable.")
      })
  }
}
