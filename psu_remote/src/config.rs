//! Persistent settings, stored as JSON next to the binary.
//!
//! A missing file and missing fields both fall back to the defaults, so an old or hand-written
//! file keeps working.

use std::{fs, io, path::Path, time::Duration};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::SupplyModel;

/// Errors when loading or saving the configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file exists but could not be read, or could not be written.
    #[error(transparent)]
    Io(#[from] io::Error),
    /// The file is not valid JSON or a field has the wrong type.
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    /// A value is valid JSON but makes no sense, e.g., a zero poll interval.
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Saved voltage and current limit of one output.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputPreset {
    /// Programmed voltage in volts.
    pub voltage: f64,
    /// Programmed current limit in amperes.
    pub current: f64,
}

/// Application settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Serial port of the USB-to-GPIB bridge.
    pub serial_port: String,
    /// Baud rate of the bridge.
    pub baud_rate: u32,
    /// Primary GPIB address of the supply.
    pub gpib_address: u8,
    /// Time between the starts of two poll cycles.
    pub poll_interval_ms: u64,
    /// How long to wait for a reply to a single query.
    pub query_timeout_ms: u64,
    /// Consecutive poll failures after which polling is suspended.
    pub failure_threshold: u32,
    /// Readings kept per output and quantity.
    pub history_len: usize,
    /// Do not poll outputs that are switched off.
    pub skip_disabled_outputs: bool,
    /// Program the saved presets right after connecting.
    pub restore_outputs: bool,
    /// Talk to the built-in simulator instead of a serial port.
    pub simulate: bool,
    /// Saved settings, one entry per output starting with output 1.
    pub outputs: Vec<OutputPreset>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            serial_port: default_serial_port().to_string(),
            baud_rate: 9600,
            gpib_address: 5,
            poll_interval_ms: 250,
            query_timeout_ms: 1000,
            failure_threshold: 5,
            history_len: 100,
            skip_disabled_outputs: false,
            restore_outputs: true,
            simulate: false,
            outputs: Vec::new(),
        }
    }
}

#[cfg(windows)]
fn default_serial_port() -> &'static str {
    "COM3"
}

#[cfg(not(windows))]
fn default_serial_port() -> &'static str {
    "/dev/ttyUSB0"
}

impl Config {
    /// Load the configuration from `path`.
    ///
    /// If the file does not exist, the defaults are returned.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                log::info!("no configuration at {}, using defaults", path.display());
                return Ok(Config::default());
            }
            Err(err) => return Err(err.into()),
        };
        let config = Self::from_json(&content)?;
        log::debug!("loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Parse and validate a configuration from a JSON string.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Write the configuration to `path` as pretty-printed JSON.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path.as_ref(), json)?;
        log::debug!("saved configuration to {}", path.as_ref().display());
        Ok(())
    }

    /// Check values that deserialize fine but cannot be used.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "poll_interval_ms must be at least 1".to_string(),
            ));
        }
        if self.query_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "query_timeout_ms must be at least 1".to_string(),
            ));
        }
        if self.failure_threshold == 0 {
            return Err(ConfigError::Invalid(
                "failure_threshold must be at least 1".to_string(),
            ));
        }
        if self.history_len == 0 {
            return Err(ConfigError::Invalid(
                "history_len must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Poll interval as a [`Duration`].
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Query timeout as a [`Duration`].
    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }

    /// Saved preset of the given 1-based output.
    pub fn preset(&self, channel: usize) -> Option<OutputPreset> {
        channel
            .checked_sub(1)
            .and_then(|i| self.outputs.get(i))
            .copied()
    }

    /// Remember the programmed values of all outputs so they are restored next time.
    pub fn remember_outputs(&mut self, model: &SupplyModel) {
        self.outputs = model
            .channels()
            .iter()
            .map(|ch| OutputPreset {
                voltage: ch.set_voltage,
                current: ch.set_current_limit,
            })
            .collect();
    }
}
