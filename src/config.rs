use crate::connection::{
    ConnectionSettings, DEFAULT_LINK_ATTEMPTS, DEFAULT_LINK_ATTEMPT_INTERVAL_MS, DEFAULT_RECONNECT_DELAY_MS,
    DEFAULT_REQUEST_TIMEOUT_MS,
};
use crate::ota::{
    OtaSettings, DEFAULT_CHECK_INTERVAL_MS, DEFAULT_CHUNK_RETRIES, DEFAULT_CHUNK_SIZE, DEFAULT_RESPONSE_TIMEOUT_MS,
    DEFAULT_STALL_TIMEOUT_MS, FIRMWARE_TITLE, FIRMWARE_VERSION,
};
use crate::protocol::{DEFAULT_MAX_MESSAGE_SIZE, MAX_DEVICE_FRAME_SIZE};
use crate::queue::{DEFAULT_QUEUE_CAPACITY, MAX_QUEUE_CAPACITY, MIN_QUEUE_CAPACITY};
use crate::sensors::producer::DEFAULT_SENSOR_INTERVAL_MS;
use crate::session::FirmwareIdentity;
use crate::telemetry::DEFAULT_TELEMETRY_INTERVAL_MS;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed configuration: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub ssid: String,
    pub password: String,
    pub link_attempts: u8,
    pub link_attempt_interval_ms: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            ssid: String::new(),
            password: String::new(),
            link_attempts: DEFAULT_LINK_ATTEMPTS,
            link_attempt_interval_ms: DEFAULT_LINK_ATTEMPT_INTERVAL_MS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CloudConfig {
    pub server: String,
    pub token: String,
    pub port: u16,
    pub reconnect_delay_ms: u64,
    pub request_timeout_ms: u64,
    pub max_message_size: usize,
}

impl Default for CloudConfig {
    fn default() -> Self {
        Self {
            server: "127.0.0.1".to_string(),
            token: String::new(),
            port: 1883,
            reconnect_delay_ms: DEFAULT_RECONNECT_DELAY_MS,
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FirmwareConfig {
    pub title: String,
    pub version: String,
    pub chunk_retries: u8,
    pub chunk_size: u16,
    pub check_interval_ms: u64,
    pub request_response_timeout_ms: u64,
    pub stall_timeout_ms: u64,
}

impl Default for FirmwareConfig {
    fn default() -> Self {
        Self {
            title: FIRMWARE_TITLE.to_string(),
            version: FIRMWARE_VERSION.to_string(),
            chunk_retries: DEFAULT_CHUNK_RETRIES,
            chunk_size: DEFAULT_CHUNK_SIZE,
            check_interval_ms: DEFAULT_CHECK_INTERVAL_MS,
            request_response_timeout_ms: DEFAULT_RESPONSE_TIMEOUT_MS,
            stall_timeout_ms: DEFAULT_STALL_TIMEOUT_MS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingConfig {
    pub sensor_interval_ms: u64,
    pub telemetry_interval_ms: u64,
    pub queue_capacity: usize,
    pub queue_pop_timeout_ms: u64,
    pub session_loop_delay_ms: u64,
    pub ota_loop_delay_ms: u64,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            sensor_interval_ms: DEFAULT_SENSOR_INTERVAL_MS,
            telemetry_interval_ms: DEFAULT_TELEMETRY_INTERVAL_MS,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            queue_pop_timeout_ms: 1000,
            session_loop_delay_ms: 100,
            ota_loop_delay_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Device configuration. Every section is optional in the JSON file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub network: NetworkConfig,
    pub cloud: CloudConfig,
    pub firmware: FirmwareConfig,
    pub sampling: SamplingConfig,
    pub logging: LoggingConfig,
}

impl DeviceConfig {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: DeviceConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&json)
    }

    /// Loads `path` when given, otherwise returns the defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let capacity = self.sampling.queue_capacity;
        if !(MIN_QUEUE_CAPACITY..=MAX_QUEUE_CAPACITY).contains(&capacity) {
            return Err(ConfigError::Invalid(format!(
                "sampling.queue_capacity {} outside {}..={}",
                capacity, MIN_QUEUE_CAPACITY, MAX_QUEUE_CAPACITY
            )));
        }

        let intervals = [
            ("network.link_attempt_interval_ms", self.network.link_attempt_interval_ms),
            ("cloud.reconnect_delay_ms", self.cloud.reconnect_delay_ms),
            ("cloud.request_timeout_ms", self.cloud.request_timeout_ms),
            ("firmware.check_interval_ms", self.firmware.check_interval_ms),
            ("firmware.request_response_timeout_ms", self.firmware.request_response_timeout_ms),
            ("firmware.stall_timeout_ms", self.firmware.stall_timeout_ms),
            ("sampling.sensor_interval_ms", self.sampling.sensor_interval_ms),
            ("sampling.telemetry_interval_ms", self.sampling.telemetry_interval_ms),
            ("sampling.queue_pop_timeout_ms", self.sampling.queue_pop_timeout_ms),
            ("sampling.session_loop_delay_ms", self.sampling.session_loop_delay_ms),
            ("sampling.ota_loop_delay_ms", self.sampling.ota_loop_delay_ms),
        ];
        if let Some((name, _)) = intervals.iter().find(|(_, value)| *value == 0) {
            return Err(ConfigError::Invalid(format!("{} must be non-zero", name)));
        }

        if self.network.link_attempts == 0 {
            return Err(ConfigError::Invalid("network.link_attempts must be non-zero".to_string()));
        }
        if self.firmware.chunk_size == 0 {
            return Err(ConfigError::Invalid("firmware.chunk_size must be non-zero".to_string()));
        }
        if self.cloud.max_message_size == 0 || self.cloud.max_message_size > MAX_DEVICE_FRAME_SIZE {
            return Err(ConfigError::Invalid(format!(
                "cloud.max_message_size must be within 1..={}",
                MAX_DEVICE_FRAME_SIZE
            )));
        }
        if self.cloud.port == 0 {
            return Err(ConfigError::Invalid("cloud.port must be non-zero".to_string()));
        }

        Ok(())
    }

    pub fn build_identity(&self) -> FirmwareIdentity {
        FirmwareIdentity::new(self.firmware.title.clone(), self.firmware.version.clone())
    }

    pub fn connection_settings(&self) -> ConnectionSettings {
        ConnectionSettings {
            server: self.cloud.server.clone(),
            token: self.cloud.token.clone(),
            port: self.cloud.port,
            link_attempts: self.network.link_attempts,
            link_attempt_interval_ms: self.network.link_attempt_interval_ms,
            reconnect_delay_ms: self.cloud.reconnect_delay_ms,
            request_timeout_ms: self.cloud.request_timeout_ms,
        }
    }

    /// OTA settings announcing `identity` as the running firmware.
    pub fn ota_settings(&self, identity: FirmwareIdentity) -> OtaSettings {
        OtaSettings {
            identity,
            retry_budget: self.firmware.chunk_retries,
            chunk_size: self.firmware.chunk_size,
            check_interval_ms: self.firmware.check_interval_ms,
            response_timeout_ms: self.firmware.request_response_timeout_ms,
            stall_timeout_ms: self.firmware.stall_timeout_ms,
        }
    }

    pub fn sensor_interval(&self) -> Duration {
        Duration::from_millis(self.sampling.sensor_interval_ms)
    }

    pub fn queue_pop_timeout(&self) -> Duration {
        Duration::from_millis(self.sampling.queue_pop_timeout_ms)
    }

    pub fn session_loop_delay(&self) -> Duration {
        Duration::from_millis(self.sampling.session_loop_delay_ms)
    }

    pub fn ota_loop_delay(&self) -> Duration {
        Duration::from_millis(self.sampling.ota_loop_delay_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_firmware_constants() {
        let config = DeviceConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.network.link_attempts, 20);
        assert_eq!(config.network.link_attempt_interval_ms, 500);
        assert_eq!(config.cloud.port, 1883);
        assert_eq!(config.cloud.request_timeout_ms, 5000);
        assert_eq!(config.firmware.title, "DA_TTNT");
        assert_eq!(config.firmware.chunk_retries, 12);
        assert_eq!(config.firmware.chunk_size, 4096);
        assert_eq!(config.firmware.check_interval_ms, 30_000);
        assert_eq!(config.sampling.queue_capacity, 10);
        assert_eq!(config.sampling.telemetry_interval_ms, 5000);
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = DeviceConfig::from_json(r#"{"cloud": {"server": "10.0.0.5", "token": "abc"}}"#).unwrap();
        assert_eq!(config.cloud.server, "10.0.0.5");
        assert_eq!(config.cloud.token, "abc");
        assert_eq!(config.cloud.port, 1883);
        assert_eq!(config.sampling.sensor_interval_ms, 5000);
    }

    #[test]
    fn test_rejects_bad_values() {
        assert!(matches!(
            DeviceConfig::from_json(r#"{"sampling": {"queue_capacity": 4}}"#),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            DeviceConfig::from_json(r#"{"sampling": {"telemetry_interval_ms": 0}}"#),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            DeviceConfig::from_json(r#"{"firmware": {"chunk_size": 0}}"#),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(DeviceConfig::from_json("{"), Err(ConfigError::Parse(_))));
    }
}
