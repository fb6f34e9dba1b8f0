use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cache::{QueryOptions, RetryPolicy};
use crate::manga::MangaSource;

const API_URL_ENV: &str = "YOMU_API_URL";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
  #[serde(default)]
  pub api: ApiConfig,
  /// Source used when `--source` is not given
  #[serde(default)]
  pub default_source: MangaSource,
  #[serde(default)]
  pub cache: CacheConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
  /// Base URL of the manga backend
  #[serde(default = "default_api_url")]
  pub url: String,
  #[serde(default = "default_timeout_secs")]
  pub timeout_secs: u64,
}

impl Default for ApiConfig {
  fn default() -> Self {
    Self {
      url: default_api_url(),
      timeout_secs: default_timeout_secs(),
    }
  }
}

fn default_api_url() -> String {
  "http://localhost:8080/".to_string()
}

fn default_timeout_secs() -> u64 {
  30
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
  /// Age after which data is refetched in the background
  #[serde(default = "default_stale_time_secs")]
  pub stale_time_secs: u64,
  /// Age after which entries are evicted
  #[serde(default = "default_ttl_secs")]
  pub ttl_secs: u64,
  /// Total attempts per fetch, including the first
  #[serde(default = "default_retry_attempts")]
  pub retry_attempts: u32,
  /// Delay before the first retry; doubles per retry. 0 retries immediately.
  #[serde(default)]
  pub retry_delay_ms: u64,
  /// Keep successful responses in the on-disk cache
  #[serde(default = "default_persist")]
  pub persist: bool,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      stale_time_secs: default_stale_time_secs(),
      ttl_secs: default_ttl_secs(),
      retry_attempts: default_retry_attempts(),
      retry_delay_ms: 0,
      persist: default_persist(),
    }
  }
}

fn default_stale_time_secs() -> u64 {
  60
}

fn default_ttl_secs() -> u64 {
  120
}

fn default_retry_attempts() -> u32 {
  3
}

fn default_persist() -> bool {
  true
}

impl CacheConfig {
  pub fn query_options(&self) -> QueryOptions {
    QueryOptions {
      stale_time: Duration::from_secs(self.stale_time_secs),
      ttl: Duration::from_secs(self.ttl_secs),
      retry: RetryPolicy {
        max_attempts: self.retry_attempts,
        initial_delay: Duration::from_millis(self.retry_delay_ms),
      },
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./yomu.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/yomu/config.yaml
  ///
  /// Without a config file the defaults are used. `YOMU_API_URL` overrides
  /// the configured backend URL.
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

    let mut config = match path {
      Some(p) => Self::load_from_path(&p)?,
      None => Config::default(),
    };

    if let Some(url) = Self::api_url_override() {
      config.api.url = url;
    }
    config.validate()?;
    Ok(config)
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("yomu.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("yomu").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents).map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  fn parse(contents: &str) -> Result<Self> {
    // An empty file is valid and means all defaults
    if contents.trim().is_empty() {
      return Ok(Config::default());
    }
    serde_yaml::from_str(contents).map_err(|e| eyre!("{}", e))
  }

  fn validate(&self) -> Result<()> {
    if self.cache.retry_attempts == 0 {
      return Err(eyre!("cache.retry_attempts must be at least 1"));
    }
    if self.cache.ttl_secs < self.cache.stale_time_secs {
      return Err(eyre!(
        "cache.ttl_secs ({}) must not be shorter than cache.stale_time_secs ({})",
        self.cache.ttl_secs,
        self.cache.stale_time_secs
      ));
    }
    Ok(())
  }

  /// Backend URL from the environment, if set.
  pub fn api_url_override() -> Option<String> {
    std::env::var(API_URL_ENV)
      .ok()
      .filter(|url| !url.trim().is_empty())
  }
}
