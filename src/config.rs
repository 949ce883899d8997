//! Configuration file and derived paths

use crate::error::{Error, Result};
use crate::schedule::ScheduleSpec;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default config location when `--config` is not given
pub const DEFAULT_CONFIG_FILE: &str = "config.json";

/// Application directory name under the platform data dir
pub const APP_DIR: &str = "daily-dispatch";

/// Everything the dispatcher needs, loaded from a camelCase JSON file
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Human-readable group name, resolved through the session every connection
    pub group: String,
    pub message: String,
    /// Local time of day, "HH:MM"
    pub send_time: String,
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(default = "default_retry_interval")]
    pub retry_interval_seconds: u64,
    #[serde(default = "default_window")]
    pub window_seconds: u64,
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay_seconds: u64,
    #[serde(default = "default_send_timeout")]
    pub send_timeout_seconds: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_file: Option<PathBuf>,
    #[serde(default)]
    pub bridge: BridgeConfig,
    #[serde(default)]
    pub hooks: HooksConfig,
}

/// External bridge executable driving the messaging session
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeConfig {
    pub command: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default = "default_keepalive")]
    pub keepalive_seconds: u64,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            command: PathBuf::from("wa-bridge"),
            args: Vec::new(),
            keepalive_seconds: default_keepalive(),
        }
    }
}

/// Shell commands run after the day's outcome is known
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HooksConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_sent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_failed: Option<String>,
}

fn default_timezone() -> String {
    "UTC".to_string()
}

fn default_retry_interval() -> u64 {
    30
}

fn default_window() -> u64 {
    300
}

fn default_reconnect_delay() -> u64 {
    5
}

fn default_send_timeout() -> u64 {
    60
}

fn default_keepalive() -> u64 {
    60
}

impl Config {
    /// Read and validate a config file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configs the scheduler cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.group.trim().is_empty() {
            return Err(Error::Config("group must not be empty".to_string()));
        }
        if self.message.is_empty() {
            return Err(Error::Config("message must not be empty".to_string()));
        }
        if self.retry_interval_seconds == 0 {
            return Err(Error::Config(
                "retryIntervalSeconds must be greater than zero".to_string(),
            ));
        }
        if self.window_seconds == 0 {
            return Err(Error::Config(
                "windowSeconds must be greater than zero".to_string(),
            ));
        }
        // One day's window must close before the next day's fire
        if self.window_seconds >= 24 * 60 * 60 {
            return Err(Error::Config(
                "windowSeconds must be shorter than a day".to_string(),
            ));
        }
        self.schedule()
            .map_err(|e| Error::Config(e.to_string()))?;
        Ok(())
    }

    pub fn schedule(&self) -> Result<ScheduleSpec> {
        ScheduleSpec::parse(&self.send_time, &self.timezone)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.retry_interval_seconds)
    }

    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_seconds)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_seconds)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_secs(self.send_timeout_seconds)
    }

    /// Where the send-state record lives
    pub fn state_path(&self) -> PathBuf {
        if let Some(path) = &self.state_file {
            return path.clone();
        }
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(APP_DIR)
            .join("send_state.json")
    }

    /// Create config for testing with custom paths
    pub fn for_test(temp_dir: &Path) -> Self {
        Self {
            group: "Test Group".to_string(),
            message: "Good morning!".to_string(),
            send_time: "09:00".to_string(),
            timezone: default_timezone(),
            retry_interval_seconds: default_retry_interval(),
            window_seconds: default_window(),
            reconnect_delay_seconds: default_reconnect_delay(),
            send_timeout_seconds: default_send_timeout(),
            state_file: Some(temp_dir.join("state/send_state.json")),
            bridge: BridgeConfig {
                command: temp_dir.join("bridge"),
                args: Vec::new(),
                keepalive_seconds: default_keepalive(),
            },
            hooks: HooksConfig::default(),
        }
    }
}
