use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::sync::RetryPolicy;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub remote: RemoteConfig,
  #[serde(default)]
  pub sync: SyncConfig,
  /// Database file (defaults to $XDG_DATA_HOME/offsync/cache.db)
  pub database: Option<PathBuf>,
  /// Directory for log files (defaults to the database directory)
  pub log_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteConfig {
  /// Base url of the REST endpoint, e.g. https://example.supabase.co/rest/v1
  pub url: String,
  #[serde(default = "default_timeout_secs")]
  pub timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SyncConfig {
  /// Background sync timer period
  pub interval_ms: u64,
  /// Backoff base; an operation that failed r times waits base * 2^(r-1)
  pub base_delay_ms: u64,
  /// Failed attempts after which an operation is dropped
  pub max_retries: u32,
  /// How often to ping the remote to refresh the online flag
  pub probe_interval_ms: u64,
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      interval_ms: 30_000,
      base_delay_ms: 1_000,
      max_retries: 5,
      probe_interval_ms: 10_000,
    }
  }
}

impl SyncConfig {
  pub fn retry_policy(&self) -> RetryPolicy {
    RetryPolicy {
      max_retries: self.max_retries,
      base_delay: Duration::from_millis(self.base_delay_ms),
    }
  }

  pub fn interval(&self) -> Duration {
    Duration::from_millis(self.interval_ms)
  }

  pub fn probe_interval(&self) -> Duration {
    Duration::from_millis(self.probe_interval_ms)
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
  /// 2. ./offsync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/offsync/config.yaml
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
        "No configuration file found. Create one at ~/.config/offsync/config.yaml"
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("offsync.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("offsync").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    let config: Config = serde_yaml::from_str(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))?;

    Ok(config)
  }

  /// Get the remote API key from the environment, if set.
  ///
  /// Checks OFFSYNC_API_KEY.
  pub fn get_api_key() -> Option<String> {
    std::env::var("OFFSYNC_API_KEY")
      .ok()
      .filter(|key| !key.is_empty())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::io::Write;

  fn write_config(contents: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file
  }

  #[test]
  fn test_minimal_config_uses_defaults() {
    let file = write_config("remote:\n  url: https://example.com/rest/v1\n");
    let config = Config::load(Some(file.path())).unwrap();

    assert_eq!(config.remote.timeout_secs, 30);
    assert_eq!(config.sync, SyncConfig::default());
    assert_eq!(config.sync.retry_policy(), RetryPolicy::default());
    assert!(config.database.is_none());
  }

  #[test]
  fn test_sync_section_overrides() {
    let file = write_config(
      "remote:\n  url: http://localhost:3000\nsync:\n  interval_ms: 5000\n  max_retries: 3\n",
    );
    let config = Config::load(Some(file.path())).unwrap();

    assert_eq!(config.sync.interval(), Duration::from_secs(5));
    assert_eq!(config.sync.max_retries, 3);
    assert_eq!(config.sync.base_delay_ms, 1_000);
  }

  #[test]
  fn test_missing_explicit_path_is_an_error() {
    let err = Config::load(Some(Path::new("/nonexistent/offsync.yaml"))).unwrap_err();
    assert!(err.to_string().contains("not found"));
  }

  #[test]
  fn test_malformed_config_is_an_error() {
    let file = write_config("remote: [not, a, map]\n");
    assert!(Config::load(Some(file.path())).is_err());
  }
}
