//! Client configuration.
//!
//! Stored at `~/.config/authrelay/config.json`. Environment variables
//! override file values:
//! - `AUTHRELAY_BASE_URL`
//! - `AUTHRELAY_REFRESH_URL`
//! - `AUTHRELAY_TIMEOUT_SECS`

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::auth::credentials::DEFAULT_SERVICE_NAME;

/// Application name used for the config directory path
const APP_NAME: &str = "authrelay";

/// Config file name
const CONFIG_FILE: &str = "config.json";

const DEFAULT_BASE_URL: &str = "http://localhost:8000";

const DEFAULT_LOGIN_PATH: &str = "api/login/";

/// Refresh endpoint relative to the base URL when none is configured
const DEFAULT_REFRESH_PATH: &str = "api/token/refresh/";

/// HTTP request timeout in seconds. Also bounds how long a renewal can
/// keep queued requests waiting.
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

const ENV_BASE_URL: &str = "AUTHRELAY_BASE_URL";
const ENV_REFRESH_URL: &str = "AUTHRELAY_REFRESH_URL";
const ENV_TIMEOUT_SECS: &str = "AUTHRELAY_TIMEOUT_SECS";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub base_url: String,
    pub login_path: String,
    /// Absolute refresh URL; derived from `base_url` when unset
    pub refresh_url: Option<String>,
    pub request_timeout_secs: u64,
    pub keyring_service: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            login_path: DEFAULT_LOGIN_PATH.to_string(),
            refresh_url: None,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            keyring_service: DEFAULT_SERVICE_NAME.to_string(),
        }
    }
}

impl Config {
    pub fn for_base_url(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..Self::default()
        }
    }

    /// Load the config file (if any), then apply environment overrides
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from(&Self::config_path()?)?;
        config.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            serde_json::from_str(&contents).context("Failed to parse config file")
        } else {
            Ok(Self::default())
        }
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Apply overrides from a key lookup (the process environment in `load`)
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(base_url) = lookup(ENV_BASE_URL) {
            self.base_url = base_url;
        }
        if let Some(refresh_url) = lookup(ENV_REFRESH_URL) {
            self.refresh_url = Some(refresh_url);
        }
        if let Some(timeout) = lookup(ENV_TIMEOUT_SECS) {
            self.request_timeout_secs = timeout
                .parse()
                .with_context(|| format!("{} must be a number of seconds", ENV_TIMEOUT_SECS))?;
        }
        Ok(())
    }

    pub fn refresh_url(&self) -> String {
        match self.refresh_url {
            Some(ref url) => url.clone(),
            None => format!(
                "{}/{}",
                self.base_url.trim_end_matches('/'),
                DEFAULT_REFRESH_PATH
            ),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }
}
