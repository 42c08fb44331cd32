//! Application configuration

use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::Path;

/// Name of the configuration file inside the config directory
pub const CONFIG_FILE: &str = "config.json";

/// Synchronization settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncConfig {
    /// Maximum number of storage operations in flight
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Delete remote objects that no longer exist locally
    #[serde(default)]
    pub remove_deleted: bool,
    /// Enumerate and read normally, but never modify either side
    #[serde(default)]
    pub dry_run: bool,
    /// Suppress progress output
    #[serde(default)]
    pub quiet: bool,
}

fn default_concurrency() -> usize {
    10
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            remove_deleted: false,
            dry_run: false,
            quiet: false,
        }
    }
}

impl SyncConfig {
    /// Load the `"sync"` section, falling back to defaults
    pub fn load(config_dir: &Path) -> Self {
        load_section(config_dir, "sync").unwrap_or_default()
    }

    /// Merge the `"sync"` section into the existing config file
    pub fn save(&self, config_dir: &Path) -> io::Result<()> {
        save_section(config_dir, "sync", self)
    }
}

/// S3-compatible target
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteConfig {
    #[serde(default)]
    pub bucket: String,
    #[serde(default = "default_region")]
    pub region: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub access_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secret_key: Option<String>,
}

fn default_region() -> String {
    "us-east-1".to_string()
}

impl RemoteConfig {
    pub fn load(config_dir: &Path) -> Self {
        load_section(config_dir, "remote").unwrap_or_else(|| Self {
            region: default_region(),
            ..Default::default()
        })
    }

    /// Prefix without surrounding slashes; empty when unset
    pub fn normalized_prefix(&self) -> String {
        self.prefix
            .as_deref()
            .unwrap_or_default()
            .replace('\\', "/")
            .trim_matches('/')
            .to_string()
    }
}

/// Read one top-level key of `config.json`
pub(crate) fn load_section<T: serde::de::DeserializeOwned>(
    config_dir: &Path,
    key: &str,
) -> Option<T> {
    let content = fs::read_to_string(config_dir.join(CONFIG_FILE)).ok()?;
    let config = serde_json::from_str::<serde_json::Value>(&content).ok()?;
    let section = config.get(key)?.clone();
    match serde_json::from_value(section) {
        Ok(value) => Some(value),
        Err(e) => {
            tracing::warn!("ignoring invalid \"{}\" section in {}: {}", key, CONFIG_FILE, e);
            None
        }
    }
}

/// Replace one top-level key of `config.json`, keeping the others
pub(crate) fn save_section<T: Serialize>(config_dir: &Path, key: &str, value: &T) -> io::Result<()> {
    fs::create_dir_all(config_dir)?;
    let config_file = config_dir.join(CONFIG_FILE);

    let mut config: serde_json::Value = if config_file.exists() {
        let content = fs::read_to_string(&config_file)?;
        serde_json::from_str(&content).unwrap_or_else(|_| serde_json::json!({}))
    } else {
        serde_json::json!({})
    };
    if !config.is_object() {
        config = serde_json::json!({});
    }

    config[key] = serde_json::to_value(value).map_err(io::Error::other)?;

    let content = serde_json::to_string_pretty(&config).map_err(io::Error::other)?;
    fs::write(&config_file, content)
}
