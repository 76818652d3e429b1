//! Runtime configuration, loaded from TOML. Every field has a default, so an
//! empty or missing file describes the stock Raspberry Pi wiring.
pub mod record;

pub use record::{RecordStore, RecoveryRecord};

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::gpio::{GpioBackend, PinAssignment};
use crate::serial::interface::{PROGRAMMING_BAUD_RATE, RESET_PULSE, RUNTIME_BAUD_RATE};
use crate::serial::unified::CommandTimeouts;
use crate::update::isp::DEFAULT_CRYSTAL_KHZ;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid configuration in {path}: {source}")]
    Toml {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OvenConfig {
    pub serial: SerialConfig,
    pub gpio: GpioConfig,
    pub firmware: FirmwareConfig,
    pub recovery: RecoveryConfig,
    pub commands: CommandConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    pub path: String,
    pub runtime_baud: u32,
    pub programming_baud: u32,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            path: "/dev/serial0".to_string(),
            runtime_baud: RUNTIME_BAUD_RATE,
            programming_baud: PROGRAMMING_BAUD_RATE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GpioConfig {
    pub backend: GpioBackend,
    pub boot_select_pin: u8,
    pub reset_pin: u8,
    pub uart_tx_pin: u8,
    pub uart_rx_pin: u8,
    pub reset_pulse_ms: u64,
}

impl Default for GpioConfig {
    fn default() -> Self {
        let pins = PinAssignment::default();
        Self {
            backend: GpioBackend::default(),
            boot_select_pin: pins.boot_select,
            reset_pin: pins.reset,
            uart_tx_pin: pins.uart_tx,
            uart_rx_pin: pins.uart_rx,
            reset_pulse_ms: RESET_PULSE.as_millis() as u64,
        }
    }
}

impl GpioConfig {
    pub fn assignment(&self) -> PinAssignment {
        PinAssignment {
            boot_select: self.boot_select_pin,
            reset: self.reset_pin,
            uart_tx: self.uart_tx_pin,
            uart_rx: self.uart_rx_pin,
        }
    }

    pub fn reset_pulse(&self) -> Duration {
        Duration::from_millis(self.reset_pulse_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FirmwareConfig {
    /// Release tag the oven must run, e.g. `v0.5.2`.
    pub target: String,
    /// Overrides the release download URL.
    pub url: Option<String>,
    pub sha256: Option<String>,
    pub crystal_khz: u32,
}

impl Default for FirmwareConfig {
    fn default() -> Self {
        Self {
            target: "v0.5.2".to_string(),
            url: None,
            sha256: None,
            crystal_khz: DEFAULT_CRYSTAL_KHZ,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    /// Defaults to a file in the system temp directory.
    pub record_path: Option<PathBuf>,
    pub fast_path_timeout_ms: u64,
    pub version_timeout_ms: u64,
    pub verify_timeout_ms: u64,
    pub boot_delay_ms: u64,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            record_path: None,
            fast_path_timeout_ms: 5000,
            version_timeout_ms: 1000,
            verify_timeout_ms: 5000,
            boot_delay_ms: 1000,
        }
    }
}

impl RecoveryConfig {
    pub fn record_store(&self) -> RecordStore {
        match &self.record_path {
            Some(path) => RecordStore::new(path.clone()),
            None => RecordStore::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandConfig {
    pub initial_timeout_ms: u64,
    pub idle_timeout_ms: u64,
}

impl Default for CommandConfig {
    fn default() -> Self {
        let timeouts = CommandTimeouts::default();
        Self {
            initial_timeout_ms: timeouts.initial.as_millis() as u64,
            idle_timeout_ms: timeouts.idle.as_millis() as u64,
        }
    }
}

impl CommandConfig {
    pub fn timeouts(&self) -> CommandTimeouts {
        CommandTimeouts {
            initial: Duration::from_millis(self.initial_timeout_ms),
            idle: Duration::from_millis(self.idle_timeout_ms),
        }
    }
}

/// Read `path`, falling back to defaults when the file does not exist.
pub fn load_config(path: &Path) -> Result<OvenConfig, ConfigError> {
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            log::info!("No config at {}, using defaults", path.display());
            return Ok(OvenConfig::default());
        }
        Err(source) => {
            return Err(ConfigError::Io { path: path.to_path_buf(), source });
        }
    };
    toml::from_str(&text).map_err(|source| ConfigError::Toml { path: path.to_path_buf(), source })
}
