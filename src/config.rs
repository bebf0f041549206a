//! Configuration loader and validator for the Store<->Warehouse sync engine.
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Root configuration struct mirroring the YAML schema exactly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    pub app: App,
    pub store: Store,
    pub warehouse: Warehouse,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct App {
    pub data_dir: String,
    pub poll_interval_ms: u64,
    pub max_backoff_seconds: u64,
    pub workers: usize,
    /// 0 disables the periodic discovery pass.
    #[serde(default)]
    pub discover_interval_minutes: u64,
    #[serde(default = "default_http_timeout")]
    pub http_timeout_seconds: u64,
}

fn default_http_timeout() -> u64 {
    30
}

/// Storefront platform settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Store {
    pub api_base: String,
    pub token: String,
    pub default_location_id: String,
    #[serde(default = "default_vendor_tag")]
    pub vendor_tag: String,
}

fn default_vendor_tag() -> String {
    "warehouse".to_string()
}

/// Warehouse/ERP platform settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Warehouse {
    pub api_base: String,
    pub api_key: String,
    #[serde(default = "default_discover_window")]
    pub discover_window_days: i64,
}

fn default_discover_window() -> i64 {
    7
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(&self.app.data_dir)
    }

    /// Secrets may live in the environment instead of the YAML file. The
    /// environment wins when both are set.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(token) = std::env::var("STORE_API_TOKEN") {
            if !token.trim().is_empty() {
                self.store.token = token;
            }
        }
        if let Ok(key) = std::env::var("WAREHOUSE_API_KEY") {
            if !key.trim().is_empty() {
                self.warehouse.api_key = key;
            }
        }
    }
}

/// Load configuration from a YAML file, apply environment overrides and
/// validate. If `path` is None, uses `config.yaml` in the current working
/// directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let mut cfg: Config = serde_yaml::from_str(&content)?;
    cfg.apply_env_overrides();
    validate(&cfg)?;
    Ok(cfg)
}

/// Validate a configuration instance.
fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }
    if cfg.app.poll_interval_ms == 0 {
        return Err(ConfigError::Invalid("app.poll_interval_ms must be > 0"));
    }
    if cfg.app.workers == 0 {
        return Err(ConfigError::Invalid("app.workers must be > 0"));
    }
    if cfg.app.http_timeout_seconds == 0 {
        return Err(ConfigError::Invalid("app.http_timeout_seconds must be > 0"));
    }

    if cfg.store.api_base.trim().is_empty() {
        return Err(ConfigError::Invalid("store.api_base must be non-empty"));
    }
    if cfg.store.token.trim().is_empty() {
        return Err(ConfigError::Invalid("store.token must be non-empty"));
    }
    if cfg.store.default_location_id.trim().is_empty() {
        return Err(ConfigError::Invalid(
            "store.default_location_id must be non-empty",
        ));
    }

    if cfg.warehouse.api_base.trim().is_empty() {
        return Err(ConfigError::Invalid("warehouse.api_base must be non-empty"));
    }
    if cfg.warehouse.api_key.trim().is_empty() {
        return Err(ConfigError::Invalid("warehouse.api_key must be non-empty"));
    }
    if cfg.warehouse.discover_window_days <= 0 {
        return Err(ConfigError::Invalid(
            "warehouse.discover_window_days must be > 0",
        ));
    }

    Ok(())
}

/// Canonical example configuration.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"
  poll_interval_ms: 500
  max_backoff_seconds: 3600
  workers: 4
  discover_interval_minutes: 60
  http_timeout_seconds: 30

store:
  api_base: "https://store.example.com/admin/api/"
  token: "YOUR_STORE_API_TOKEN"
  default_location_id: "L1"
  vendor_tag: "warehouse"

warehouse:
  api_base: "https://warehouse.example.com/api/v2/"
  api_key: "YOUR_WAREHOUSE_API_KEY"
  discover_window_days: 7
"#
}
