//! Configuration Module
//!
//! Static service configuration, loaded from a TOML file with environment
//! overrides.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, info};

use crate::auth::Credentials;
use crate::sync::DEFAULT_BASE_URL;

pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 5;
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

const CONFIG_PATH_ENV: &str = "LYNKCO_CONFIG";
const USERNAME_ENV: &str = "LYNKCO_USERNAME";
const PASSWORD_ENV: &str = "LYNKCO_PASSWORD";
const POLL_INTERVAL_ENV: &str = "LYNKCO_POLL_INTERVAL";
const API_URL_ENV: &str = "LYNKCO_API_URL";

/// Service configuration
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub username: String,
    pub password: String,
    /// Seconds between poll cycles.
    pub poll_interval_secs: u64,
    pub api_base_url: String,
    /// Upper bound on any single HTTP call.
    pub request_timeout_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            username: String::new(),
            password: String::new(),
            poll_interval_secs: DEFAULT_POLL_INTERVAL_SECS,
            api_base_url: DEFAULT_BASE_URL.to_string(),
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
        }
    }
}

impl std::fmt::Debug for SyncConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncConfig")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("poll_interval_secs", &self.poll_interval_secs)
            .field("api_base_url", &self.api_base_url)
            .field("request_timeout_secs", &self.request_timeout_secs)
            .finish()
    }
}

impl SyncConfig {
    /// Configuration from explicit values, with defaults for the rest.
    pub fn new(
        username: impl Into<String>,
        password: impl Into<String>,
        poll_interval_secs: u64,
    ) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            poll_interval_secs,
            ..Self::default()
        }
    }

    /// Load configuration from the config file (if any) and the environment.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match Self::config_path() {
            Some(path) if path.exists() => Self::from_file(&path)?,
            Some(path) => {
                debug!("No config file at {:?}, using environment only", path);
                Self::default()
            }
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML config file without validating it.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content =
            std::fs::read_to_string(path).map_err(|e| ConfigError::Io(e.to_string()))?;
        let config: Self =
            toml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        info!("Loaded configuration from {:?}", path);
        Ok(config)
    }

    /// Apply overrides from `lookup`, normally the process environment.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(username) = lookup(USERNAME_ENV) {
            self.username = username;
        }
        if let Some(password) = lookup(PASSWORD_ENV) {
            self.password = password;
        }
        if let Some(interval) = lookup(POLL_INTERVAL_ENV) {
            self.poll_interval_secs = interval.trim().parse().map_err(|_| {
                ConfigError::Invalid(format!(
                    "{} must be a whole number of seconds",
                    POLL_INTERVAL_ENV
                ))
            })?;
        }
        if let Some(url) = lookup(API_URL_ENV) {
            self.api_base_url = url;
        }
        Ok(())
    }

    /// Reject configurations the coordinator cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.username.trim().is_empty() {
            return Err(ConfigError::Invalid("username is required".into()));
        }
        if self.password.is_empty() {
            return Err(ConfigError::Invalid("password is required".into()));
        }
        if self.poll_interval_secs == 0 {
            return Err(ConfigError::Invalid("poll interval must be at least 1 second".into()));
        }
        if self.request_timeout_secs == 0 {
            return Err(ConfigError::Invalid("request timeout must be at least 1 second".into()));
        }
        if !self.api_base_url.starts_with("http://") && !self.api_base_url.starts_with("https://") {
            return Err(ConfigError::Invalid(format!(
                "api_base_url must be an http(s) URL, got {}",
                self.api_base_url
            )));
        }
        Ok(())
    }

    pub fn credentials(&self) -> Credentials {
        Credentials::new(self.username.clone(), self.password.clone())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    fn config_path() -> Option<PathBuf> {
        if let Ok(path) = std::env::var(CONFIG_PATH_ENV) {
            return Some(PathBuf::from(path));
        }
        dirs::config_dir().map(|dir| dir.join("lynkco-sync").join("config.toml"))
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
