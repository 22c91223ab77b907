//! Driver configuration
//!
//! Loaded from an optional TOML file overlaid with `PASSTHRU__*` environment
//! variables (e.g. `PASSTHRU__SERIAL__PORT=/dev/ttyACM0`).

use std::path::Path;
use std::time::Duration;

use config::{Config, Environment, File};
use passthru_protocol::limits::{MAX_CHANNELS, MAX_FILTERS, MAX_PERIODIC_MSGS, MAX_RX_BUFFER_SIZE};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Failed to install logging: {0}")]
    Logging(String),
}

/// Top level driver configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    pub serial: SerialConfig,

    /// How long `open` waits for the translator handshake (milliseconds)
    pub init_timeout_ms: u64,

    /// Concurrently open channels
    pub max_channels: usize,

    /// Receive buffer depth per channel
    pub rx_buffer_capacity: usize,

    /// API filters per channel
    pub max_filters: usize,

    /// Periodic messages per channel
    pub max_periodic_msgs: usize,

    /// How long a periodic firing waits for the write path before the tick
    /// counts as missed (milliseconds)
    pub periodic_lock_wait_ms: u64,

    pub iso15765: IsoTpConfig,

    pub logging: LoggingConfig,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            serial: SerialConfig::default(),
            init_timeout_ms: 2000,
            max_channels: MAX_CHANNELS,
            rx_buffer_capacity: MAX_RX_BUFFER_SIZE,
            max_filters: MAX_FILTERS,
            max_periodic_msgs: MAX_PERIODIC_MSGS,
            periodic_lock_wait_ms: 50,
            iso15765: IsoTpConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl DriverConfig {
    /// Load from an optional file plus the environment
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path).required(true));
        }
        builder = builder.add_source(
            Environment::with_prefix("PASSTHRU")
                .separator("__")
                .try_parsing(true),
        );

        let config: DriverConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the driver cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_channels == 0 {
            return Err(ConfigError::Invalid("max_channels must be at least 1".into()));
        }
        if self.rx_buffer_capacity == 0 {
            return Err(ConfigError::Invalid(
                "rx_buffer_capacity must be at least 1".into(),
            ));
        }
        if self.serial.port.is_empty() {
            return Err(ConfigError::Invalid("serial.port is empty".into()));
        }
        if self.iso15765.flow_control_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "iso15765.flow_control_timeout_ms must be non-zero".into(),
            ));
        }
        Ok(())
    }

    pub fn init_timeout(&self) -> Duration {
        Duration::from_millis(self.init_timeout_ms)
    }

    pub fn periodic_lock_wait(&self) -> Duration {
        Duration::from_millis(self.periodic_lock_wait_ms)
    }
}

/// Serial link to the translator
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    /// Port used when `open` gets no identifier
    pub port: String,
    pub baud_rate: u32,
    /// Read poll timeout (milliseconds)
    pub read_timeout_ms: u64,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: default_port().to_string(),
            baud_rate: 115_200,
            read_timeout_ms: 20,
        }
    }
}

#[cfg(windows)]
fn default_port() -> &'static str {
    "COM3"
}

#[cfg(not(windows))]
fn default_port() -> &'static str {
    "/dev/ttyUSB0"
}

/// ISO 15765 transport settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IsoTpConfig {
    /// Install flow control filters for the OBD-II physical ids on connect
    pub auto_flow_control: bool,
    /// Block size advertised in our flow control frames
    pub block_size: u8,
    /// STmin advertised in our flow control frames (raw ISO 15765-2 encoding)
    pub st_min: u8,
    /// How long a segmented write waits for the peer's flow control (N_Bs)
    pub flow_control_timeout_ms: u64,
    /// WAIT frames accepted before a segmented write gives up
    pub max_wait_frames: u32,
}

impl Default for IsoTpConfig {
    fn default() -> Self {
        Self {
            auto_flow_control: true,
            block_size: 0,
            st_min: 0,
            flow_control_timeout_ms: 1000,
            max_wait_frames: 10,
        }
    }
}

impl IsoTpConfig {
    pub fn flow_control_timeout(&self) -> Duration {
        Duration::from_millis(self.flow_control_timeout_ms)
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter directive (trace, debug, info, warn, error or a full EnvFilter)
    pub level: String,
    /// Emit JSON lines instead of human readable output
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}
