//! Configuration files
//!
//! The configuration directory holds one `app_config.json` with the remote
//! service connection and one `<location>.json` per device. Values are loaded
//! once and passed explicitly into the supervisor and workers.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Application config file name
pub const APP_CONFIG_FILE: &str = "app_config.json";

/// Local configuration directory, preferred when present
pub const LOCAL_CONFIG_DIR: &str = "serial_config";

/// Hosted Fermentrack service
pub const FERMENTRACK_NET_URL: &str = "https://www.fermentrack.net:443";

/// Errors while loading or saving configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    #[error("Failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Malformed config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid config {path}: {reason}")]
    Invalid { path: PathBuf, reason: String },
}

/// Application-wide configuration (`app_config.json`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub host: String,
    #[serde(deserialize_with = "string_or_number")]
    pub port: String,
    pub use_https: bool,
    pub use_fermentrack_net: bool,
    pub fermentrack_api_key: String,
    pub username: String,
    pub api_timeout_secs: u64,
    pub log_level: String,
    pub status_update_interval_secs: u64,
    pub message_check_interval_secs: u64,
    pub full_config_update_interval_secs: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: "80".to_string(),
            use_https: false,
            use_fermentrack_net: false,
            fermentrack_api_key: String::new(),
            username: String::new(),
            api_timeout_secs: 10,
            log_level: "info".to_string(),
            status_update_interval_secs: 30,
            message_check_interval_secs: 5,
            full_config_update_interval_secs: 300,
        }
    }
}

impl AppConfig {
    /// Base URL of the remote service, without a trailing slash
    pub fn api_base_url(&self) -> String {
        if self.use_fermentrack_net {
            return FERMENTRACK_NET_URL.to_string();
        }
        let scheme = if self.use_https { "https" } else { "http" };
        format!("{}://{}:{}", scheme, self.host.trim_end_matches('/'), self.port)
    }

    pub fn api_timeout(&self) -> Duration {
        Duration::from_secs(self.api_timeout_secs.max(1))
    }

    pub fn status_update_interval(&self) -> Duration {
        Duration::from_secs(self.status_update_interval_secs.max(1))
    }

    pub fn message_check_interval(&self) -> Duration {
        Duration::from_secs(self.message_check_interval_secs.max(1))
    }

    pub fn full_config_update_interval(&self) -> Duration {
        Duration::from_secs(self.full_config_update_interval_secs.max(1))
    }

    /// Check required fields
    pub fn validate(&self, path: &Path) -> Result<(), ConfigError> {
        let invalid = |reason: &str| ConfigError::Invalid {
            path: path.to_path_buf(),
            reason: reason.to_string(),
        };
        if self.fermentrack_api_key.trim().is_empty() {
            return Err(invalid("fermentrack_api_key is required"));
        }
        if !self.use_fermentrack_net {
            if self.host.trim().is_empty() {
                return Err(invalid("host is required unless use_fermentrack_net is set"));
            }
            if self.port.trim().parse::<u16>().is_err() {
                return Err(invalid("port must be a number between 0 and 65535"));
            }
        }
        Ok(())
    }
}

/// One device (`<location>.json`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// USB location the controller is attached at
    pub location: String,

    /// Device id assigned by the remote service
    #[serde(
        default,
        deserialize_with = "optional_string_or_number",
        skip_serializing_if = "Option::is_none"
    )]
    pub fermentrack_id: Option<String>,

    /// Stable device identifier used for registration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guid: Option<String>,

    /// Remaining keys (firmware and board details written by the setup tool)
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl DeviceConfig {
    pub fn new(location: impl Into<String>) -> Self {
        Self {
            location: location.into(),
            fermentrack_id: None,
            guid: None,
            extra: Map::new(),
        }
    }

    /// Check whether the device has completed registration
    pub fn is_registered(&self) -> bool {
        self.fermentrack_id
            .as_deref()
            .map(|id| !id.is_empty())
            .unwrap_or(false)
    }
}

fn string_or_number<'de, D: Deserializer<'de>>(d: D) -> Result<String, D::Error> {
    match Value::deserialize(d)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "expected string or number, got {}",
            other
        ))),
    }
}

fn optional_string_or_number<'de, D: Deserializer<'de>>(
    d: D,
) -> Result<Option<String>, D::Error> {
    match Value::deserialize(d)? {
        Value::Null => Ok(None),
        Value::String(s) if s.is_empty() => Ok(None),
        Value::String(s) => Ok(Some(s)),
        Value::Number(n) => Ok(Some(n.to_string())),
        other => Err(serde::de::Error::custom(format!(
            "expected string or number, got {}",
            other
        ))),
    }
}

/// The configuration directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigDir {
    path: PathBuf,
}

impl ConfigDir {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Pick the configuration directory
    ///
    /// An explicit path wins; otherwise `./serial_config` if it exists, then
    /// the system config directory, then `./serial_config` again.
    pub fn discover(explicit: Option<PathBuf>) -> Self {
        if let Some(path) = explicit {
            return Self::new(path);
        }
        let local = PathBuf::from(LOCAL_CONFIG_DIR);
        if local.is_dir() {
            return Self::new(local);
        }
        match dirs::config_dir() {
            Some(base) if base.join("fermbridge").is_dir() => Self::new(base.join("fermbridge")),
            _ => Self::new(local),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn app_config_path(&self) -> PathBuf {
        self.path.join(APP_CONFIG_FILE)
    }

    pub fn device_config_path(&self, location: &str) -> PathBuf {
        self.path.join(format!("{}.json", location))
    }

    /// Load and validate `app_config.json`
    pub fn load_app_config(&self) -> Result<AppConfig, ConfigError> {
        let path = self.app_config_path();
        let config: AppConfig = read_json(&path)?;
        config.validate(&path)?;
        Ok(config)
    }

    pub fn save_app_config(&self, config: &AppConfig) -> Result<(), ConfigError> {
        write_json(&self.app_config_path(), config)
    }

    /// Store a new API key, keeping the rest of the app config untouched
    pub fn save_api_key(&self, api_key: &str) -> Result<(), ConfigError> {
        let path = self.app_config_path();
        let mut raw: Map<String, Value> = read_json(&path)?;
        raw.insert(
            "fermentrack_api_key".to_string(),
            Value::String(api_key.to_string()),
        );
        write_json(&path, &raw)
    }

    /// Load one device config; the location must match the file name
    pub fn load_device_config(&self, path: &Path) -> Result<DeviceConfig, ConfigError> {
        let config: DeviceConfig = read_json(path)?;
        let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("");
        if config.location.is_empty() || config.location != stem {
            return Err(ConfigError::Invalid {
                path: path.to_path_buf(),
                reason: format!(
                    "location '{}' does not match file name '{}'",
                    config.location, stem
                ),
            });
        }
        Ok(config)
    }

    pub fn save_device_config(&self, config: &DeviceConfig) -> Result<(), ConfigError> {
        write_json(&self.device_config_path(&config.location), config)
    }

    /// Device config files in the directory
    pub fn device_config_paths(&self) -> Result<Vec<PathBuf>, ConfigError> {
        let entries = fs::read_dir(&self.path).map_err(|source| ConfigError::Io {
            path: self.path.clone(),
            source,
        })?;
        let mut paths: Vec<PathBuf> = entries
            .flatten()
            .map(|e| e.path())
            .filter(|p| is_device_config_path(p))
            .collect();
        paths.sort();
        Ok(paths)
    }

    /// All valid device configs; invalid files are logged and skipped
    pub fn list_device_configs(&self) -> Result<Vec<DeviceConfig>, ConfigError> {
        let mut configs = Vec::new();
        for path in self.device_config_paths()? {
            match self.load_device_config(&path) {
                Ok(config) => configs.push(config),
                Err(e) => tracing::warn!("skipping device config: {}", e),
            }
        }
        Ok(configs)
    }
}

/// `*.json` other than the app config
pub fn is_device_config_path(path: &Path) -> bool {
    path.extension().map(|ext| ext == "json").unwrap_or(false)
        && path
            .file_name()
            .map(|name| name != APP_CONFIG_FILE)
            .unwrap_or(false)
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    let content = fs::read_to_string(path).map_err(|source| {
        if source.kind() == io::ErrorKind::NotFound {
            ConfigError::NotFound(path.to_path_buf())
        } else {
            ConfigError::Io {
                path: path.to_path_buf(),
                source,
            }
        }
    })?;
    serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Write through a temporary file so readers never see a partial file
fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<(), ConfigError> {
    let io_err = |source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    };
    let content = serde_json::to_string_pretty(value).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(io_err)?;
    }
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, content).map_err(io_err)?;
    fs::rename(&tmp, path).map_err(io_err)
}
