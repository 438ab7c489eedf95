//! Updater configuration, stored as TOML.
//!
//! ```toml
//! address = 44
//! processing_timeout_ms = 1000
//!
//! [dfu]
//! max_xfer = 128
//! phase_timeout_ms = 4000
//! erase_retries = 2
//! frame_retries = 3
//! activation_poll_ms = 500
//! poll_interval_ms = 10
//! update_led = true
//! led_effect = 2
//!
//! [firmware]
//! url = "file:///lib/firmware/xvf3800.bin"
//! version = "2.0.6"
//! md5 = "5eb63bbbe01eeed093cb22bb8f5acdc3"
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::firmware::FirmwareSource;
use crate::protocol::constants::*;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Transfer policy for one DFU session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DfuSettings {
    /// Payload bytes per DNLOAD frame.
    pub max_xfer: usize,
    /// How long a phase may wait for the device before giving up.
    pub phase_timeout_ms: u64,
    /// Extra erase requests after an erase times out.
    pub erase_retries: u32,
    /// Extra writes of a request the bus rejected.
    pub frame_retries: u32,
    /// Version read interval while the device reboots.
    pub activation_poll_ms: u64,
    /// Sleep between polls when the updater drives itself.
    pub poll_interval_ms: u64,
    /// Show `led_effect` once the erase request is accepted.
    pub update_led: bool,
    pub led_effect: u8,
}

impl Default for DfuSettings {
    fn default() -> Self {
        Self {
            max_xfer: DEFAULT_XFER,
            phase_timeout_ms: DFU_TIMEOUT_MS,
            erase_retries: ERASE_RETRIES,
            frame_retries: FRAME_RETRIES,
            activation_poll_ms: ACTIVATION_POLL_MS,
            poll_interval_ms: POLL_INTERVAL_MS,
            update_led: true,
            led_effect: LED_EFFECT_UPDATING,
        }
    }
}

/// Complete updater configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DfuConfig {
    /// 7-bit bus address of the device.
    pub address: u8,
    /// Upper bound on any single wait the device asks for.
    pub processing_timeout_ms: u64,
    pub dfu: DfuSettings,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub firmware: Option<FirmwareSource>,
}

impl Default for DfuConfig {
    fn default() -> Self {
        Self {
            address: DEFAULT_I2C_ADDRESS,
            processing_timeout_ms: PROCESSING_TIMEOUT_MS,
            dfu: DfuSettings::default(),
            firmware: None,
        }
    }
}

impl DfuConfig {
    /// Load and validate configuration from a TOML file.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: DfuConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file.
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.address > 0x7F {
            return Err(ConfigError::Invalid(format!(
                "address 0x{:02X} is not a 7-bit address",
                self.address
            )));
        }
        if self.processing_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "processing_timeout_ms must be positive".into(),
            ));
        }
        let dfu = &self.dfu;
        if dfu.max_xfer == 0 || dfu.max_xfer > MAX_XFER {
            return Err(ConfigError::Invalid(format!(
                "dfu.max_xfer {} outside 1..={}",
                dfu.max_xfer, MAX_XFER
            )));
        }
        if dfu.phase_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "dfu.phase_timeout_ms must be positive".into(),
            ));
        }
        if dfu.activation_poll_ms == 0 {
            return Err(ConfigError::Invalid(
                "dfu.activation_poll_ms must be positive".into(),
            ));
        }
        if let Some(source) = &self.firmware {
            source
                .validate()
                .map_err(|e| ConfigError::Invalid(format!("firmware: {e}")))?;
        }
        Ok(())
    }
}
