use crate::error::{Result, SinkError};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use tokio::fs;

/// Configuration for the ULog capture sink.
///
/// Loaded from a TOML file using [`Config::load`]. The MAVLink identities
/// are per-capture configuration, so one process can run captures against
/// several vehicles.
///
/// # Example
/// ```toml
/// [general]
/// bus_capacity = 1000
///
/// [capture]
/// logs_dir = "logs"
/// system_id = 2
/// target_system_id = 1
/// start_retry_ms = 1000
/// ```
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Bus and process-wide settings.
    #[serde(default)]
    pub general: GeneralConfig,
    /// Capture endpoint settings.
    pub capture: CaptureConfig,
}

/// General settings.
#[derive(Debug, Deserialize)]
pub struct GeneralConfig {
    /// Capacity of the packet bus. Typical values are 1000-10000.
    #[serde(default = "default_bus_capacity")]
    pub bus_capacity: usize,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            bus_capacity: default_bus_capacity(),
        }
    }
}

fn default_bus_capacity() -> usize {
    1000
}

/// Capture endpoint settings.
#[derive(Debug, Deserialize, Clone)]
pub struct CaptureConfig {
    /// Directory receiving the `.ulg` files.
    pub logs_dir: String,
    /// MAVLink system id this endpoint sends as.
    #[serde(default = "default_system_id")]
    pub system_id: u8,
    /// MAVLink system id of the vehicle whose log is captured.
    #[serde(default = "default_target_system_id")]
    pub target_system_id: u8,
    /// Cadence of the LOGGING_START retry, in milliseconds.
    #[serde(default = "default_start_retry_ms")]
    pub start_retry_ms: u64,
}

fn default_system_id() -> u8 {
    2
}

fn default_target_system_id() -> u8 {
    1
}

fn default_start_retry_ms() -> u64 {
    1000
}

impl CaptureConfig {
    /// The retry cadence as a `Duration`.
    pub fn start_retry(&self) -> Duration {
        Duration::from_millis(self.start_retry_ms)
    }
}

impl Config {
    /// Loads configuration from a TOML file.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path_str = path.as_ref().display().to_string();
        let content = fs::read_to_string(path.as_ref())
            .await
            .map_err(|e| SinkError::config(format!("Failed to read '{path_str}': {e}")))?;

        Self::from_str(&content)
    }

    /// Parses configuration from a TOML string.
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)
            .map_err(|e| SinkError::config(format!("Failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects configurations the capture cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.capture.logs_dir.is_empty() {
            return Err(SinkError::config("logs_dir must not be empty"));
        }
        if self.capture.system_id == 0 {
            return Err(SinkError::config("system_id 0 is the broadcast address"));
        }
        if self.capture.target_system_id == 0 {
            return Err(SinkError::config(
                "target_system_id 0 is the broadcast address",
            ));
        }
        if self.capture.start_retry_ms < 100 {
            return Err(SinkError::config(format!(
                "start_retry_ms too small: {} (must be >= 100)",
                self.capture.start_retry_ms
            )));
        }
        if self.general.bus_capacity < 10 {
            return Err(SinkError::config(format!(
                "bus_capacity too small: {}",
                self.general.bus_capacity
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::from_str("[capture]\nlogs_dir = \"logs\"").unwrap();
        assert_eq!(config.capture.system_id, 2);
        assert_eq!(config.capture.target_system_id, 1);
        assert_eq!(config.capture.start_retry_ms, 1000);
        assert_eq!(config.general.bus_capacity, 1000);
    }

    #[test]
    fn test_empty_logs_dir_rejected() {
        assert!(Config::from_str("[capture]\nlogs_dir = \"\"").is_err());
    }

    #[test]
    fn test_broadcast_ids_rejected() {
        assert!(
            Config::from_str("[capture]\nlogs_dir = \"logs\"\nsystem_id = 0").is_err()
        );
        assert!(
            Config::from_str("[capture]\nlogs_dir = \"logs\"\ntarget_system_id = 0").is_err()
        );
    }

    #[test]
    fn test_retry_cadence_floor() {
        assert!(
            Config::from_str("[capture]\nlogs_dir = \"logs\"\nstart_retry_ms = 50").is_err()
        );
    }

    #[test]
    fn test_bus_capacity_floor() {
        let toml = "[general]\nbus_capacity = 5\n[capture]\nlogs_dir = \"logs\"";
        assert!(Config::from_str(toml).is_err());
    }
}
