//! Configuration loaded from `config.toml`.
//!
//! Every field has a default, so a missing file or a partial file is fine.

use crate::error::LinkError;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::info;

/// Default location of the config file.
pub const DEFAULT_CONFIG_PATH: &str = "~/.qrlink/config.toml";

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub host: HostConfig,
}

/// Where the link backend lives and how to authenticate against it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BackendConfig {
    /// API base URL, without a trailing slash.
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Sent as the `X-API-Key` header. Empty = no header.
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

/// Timer policy of a link session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionConfig {
    /// QR rotation period; also what the countdown resets to.
    /// Kept under the provider's 60s QR validity.
    #[serde(default = "default_rotation")]
    pub rotation_secs: u32,
    /// Status poll interval.
    #[serde(default = "default_poll")]
    pub poll_secs: u64,
    /// Delay before re-fetching a QR the backend is still generating.
    #[serde(default = "default_retry")]
    pub retry_secs: u64,
}

/// Terminal host behaviour.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HostConfig {
    /// How long the success screen stays up before the session is stopped.
    #[serde(default = "default_grace")]
    pub success_grace_secs: u64,
    /// Directory for rolling log files. Empty = stderr only.
    #[serde(default)]
    pub log_dir: String,
}

fn default_base_url() -> String {
    "http://localhost:5000".to_string()
}
fn default_request_timeout() -> u64 {
    30
}
fn default_rotation() -> u32 {
    50
}
fn default_poll() -> u64 {
    3
}
fn default_retry() -> u64 {
    3
}
fn default_grace() -> u64 {
    2
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            api_key: String::new(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            rotation_secs: default_rotation(),
            poll_secs: default_poll(),
            retry_secs: default_retry(),
        }
    }
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            success_grace_secs: default_grace(),
            log_dir: String::new(),
        }
    }
}

impl SessionConfig {
    pub fn rotation_period(&self) -> Duration {
        Duration::from_secs(u64::from(self.rotation_secs))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_secs)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_secs)
    }

    /// Reject periods that would spin the timers.
    pub fn validate(&self) -> Result<(), LinkError> {
        if self.rotation_secs == 0 {
            return Err(LinkError::Config("session.rotation_secs must be > 0".into()));
        }
        if self.poll_secs == 0 {
            return Err(LinkError::Config("session.poll_secs must be > 0".into()));
        }
        if self.retry_secs == 0 {
            return Err(LinkError::Config("session.retry_secs must be > 0".into()));
        }
        Ok(())
    }
}

impl Config {
    /// Load config from `path` (tilde-expanded). A missing file yields defaults.
    pub fn load(path: &str) -> Result<Self, LinkError> {
        let expanded = shellexpand(path);
        let path = Path::new(&expanded);
        if !path.exists() {
            info!("config: {} not found, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .map_err(|e| LinkError::Config(format!("failed to read {}: {e}", path.display())))?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| LinkError::Config(format!("failed to parse {}: {e}", path.display())))?;
        config.session.validate()?;
        Ok(config)
    }
}

/// Expand a leading `~` to `$HOME`.
pub fn shellexpand(path: &str) -> String {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Ok(home) = std::env::var("HOME") {
            return format!("{home}/{rest}");
        }
    } else if path == "~" {
        if let Ok(home) = std::env::var("HOME") {
            return home;
        }
    }
    path.to_string()
}
