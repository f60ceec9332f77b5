//! Application configuration management.
//!
//! This module handles loading and saving the client configuration: API
//! endpoints, timeouts, which credential backend to use and the last used
//! username.
//!
//! Configuration is stored at `~/.config/rota/config.json`. Environment
//! variables (`ROTA_API_URL`, `ROTA_AUTH_URL`, `ROTA_STORAGE`) override
//! whatever the file says.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Application name used for config/cache directory paths
const APP_NAME: &str = "rota";

/// Config file name
const CONFIG_FILE: &str = "config.json";

const DEFAULT_API_BASE_URL: &str = "https://api.rota.example.org/api";
const DEFAULT_AUTH_BASE_URL: &str = "https://api.rota.example.org/api";

/// HTTP request timeout in seconds.
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

/// Upper bound on a single renewal exchange.
const DEFAULT_RENEWAL_TIMEOUT_SECS: u64 = 10;

/// Where credentials are persisted between runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    /// `session.json` in the cache directory
    #[default]
    File,
    /// OS keychain
    Keyring,
}

impl std::str::FromStr for StorageKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "file" => Ok(StorageKind::File),
            "keyring" => Ok(StorageKind::Keyring),
            other => Err(anyhow::anyhow!("Unknown storage kind: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub api_base_url: String,
    pub auth_base_url: String,
    pub request_timeout_secs: u64,
    pub renewal_timeout_secs: u64,
    pub storage: StorageKind,
    pub last_username: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            auth_base_url: DEFAULT_AUTH_BASE_URL.to_string(),
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            renewal_timeout_secs: DEFAULT_RENEWAL_TIMEOUT_SECS,
            storage: StorageKind::default(),
            last_username: None,
        }
    }
}

impl Config {
    /// Load the config file (or defaults) and apply environment overrides.
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from(&Self::config_path()?)?;
        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Record the last signed-in username.
    ///
    /// Works on the file as stored, so overrides in effect for this run are
    /// never written back.
    pub fn remember_username(username: &str) -> Result<()> {
        Self::remember_username_in(&Self::config_path()?, username)
    }

    fn remember_username_in(path: &Path, username: &str) -> Result<()> {
        let mut stored = Self::load_from(path)?;
        stored.last_username = Some(username.to_string());
        stored.save_to(path)
    }

    fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        serde_json::from_str(&contents).context("Failed to parse config file")
    }

    fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Apply overrides from a variable lookup. Split out from `load` so it
    /// can be driven without touching the process environment.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("ROTA_API_URL").filter(|v| !v.is_empty()) {
            self.api_base_url = url;
        }
        if let Some(url) = lookup("ROTA_AUTH_URL").filter(|v| !v.is_empty()) {
            self.auth_base_url = url;
        }
        if let Some(kind) = lookup("ROTA_STORAGE").filter(|v| !v.is_empty()) {
            self.storage = kind.parse()?;
        }
        Ok(())
    }

    fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    pub fn cache_dir(&self) -> Result<PathBuf> {
        let cache_dir = dirs::cache_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find cache directory"))?;
        Ok(cache_dir.join(APP_NAME))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn renewal_timeout(&self) -> Duration {
        Duration::from_secs(self.renewal_timeout_secs)
    }
}
