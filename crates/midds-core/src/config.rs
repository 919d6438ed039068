//! Startup configuration
//!
//! The program configuration is stored as JSON. It is read once at startup and
//! turned into the channel table and the session settings.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

use crate::channel::{Channel, ModeSettings};
use crate::protocol::{ChannelMode, Message, SignalType, CHANNEL_COUNT, DEFAULT_BAUD_RATE};
use crate::recording::default_recordings_dir;

/// Smallest accepted SYNC frequency and duty cycle
const SYNC_MIN: f64 = 0.01;

/// Largest accepted SYNC frequency and duty cycle
const SYNC_MAX: f64 = 99.99;

/// Errors raised while loading the configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The file could not be read
    #[error("Could not read configuration '{}': {source}", path.display())]
    Io {
        /// File being read
        path: PathBuf,
        /// Underlying error
        #[source]
        source: io::Error,
    },

    /// The JSON is invalid
    #[error("Invalid configuration JSON: {0}")]
    Parse(#[from] serde_json::Error),

    /// A value is out of range
    #[error("Invalid value for {field}: {reason}")]
    InvalidValue {
        /// Offending field
        field: String,
        /// Accepted range or constraint
        reason: String,
    },
}

fn invalid(field: impl Into<String>, reason: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        field: field.into(),
        reason: reason.into(),
    }
}

/// Device clock and SYNC output settings
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Channel driving the SYNC output, `None` when disabled
    pub channel: Option<u8>,

    /// SYNC frequency in Hz
    pub frequency: f64,

    /// SYNC duty cycle in percent
    pub duty_cycle: f64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            channel: None,
            frequency: 1.0,
            duty_cycle: 50.0,
        }
    }
}

impl SyncConfig {
    /// SyncSettings record setting the device clock to `time` (UNIX ns)
    pub fn message(&self, time: u64) -> Message {
        Message::SyncSettings {
            channel: self.channel,
            frequency: self.frequency,
            duty_cycle: self.duty_cycle,
            time,
        }
    }
}

/// Configuration of one channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Channel number on the device
    pub number: u8,

    /// Display name
    #[serde(default)]
    pub name: String,

    /// Electrical signal standard
    #[serde(default)]
    pub signal: SignalType,

    /// Mode and mode options
    #[serde(default)]
    pub settings: ModeSettings,
}

impl ChannelConfig {
    /// A disabled TTL channel
    pub fn disabled(number: u8) -> Self {
        Self {
            number,
            name: String::new(),
            signal: SignalType::Ttl,
            settings: ModeSettings::Disabled,
        }
    }
}

/// Program configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgramConfig {
    /// Serial port of the device, chosen at connect time when unset
    #[serde(default)]
    pub serial_port: Option<String>,

    /// Baud rate of the link
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,

    /// Seconds between two rounds of recurring requests
    #[serde(default = "default_update_interval")]
    pub update_interval_s: f64,

    /// Directory recordings are written to
    #[serde(default)]
    pub recordings_dir: Option<PathBuf>,

    /// Device clock and SYNC output
    #[serde(default)]
    pub sync: SyncConfig,

    /// Channel table; missing channels are disabled
    #[serde(default)]
    pub channels: Vec<ChannelConfig>,
}

fn default_baud_rate() -> u32 {
    DEFAULT_BAUD_RATE
}

fn default_update_interval() -> f64 {
    0.5
}

impl Default for ProgramConfig {
    fn default() -> Self {
        Self {
            serial_port: None,
            baud_rate: default_baud_rate(),
            update_interval_s: default_update_interval(),
            recordings_dir: None,
            sync: SyncConfig::default(),
            channels: (0..CHANNEL_COUNT as u8).map(ChannelConfig::disabled).collect(),
        }
    }
}

impl ProgramConfig {
    /// Parse, validate and complete a JSON configuration
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let mut config: ProgramConfig = serde_json::from_str(json)?;
        config.validate()?;
        config.fill_missing_channels();
        Ok(config)
    }

    /// Load a JSON configuration file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let json = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&json)
    }

    /// Check value ranges and channel numbering
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.update_interval_s.is_finite() && self.update_interval_s > 0.0) {
            return Err(invalid("update_interval_s", "must be a positive number"));
        }
        if self.baud_rate == 0 {
            return Err(invalid("baud_rate", "must not be zero"));
        }

        for (field, value) in [
            ("sync.frequency", self.sync.frequency),
            ("sync.duty_cycle", self.sync.duty_cycle),
        ] {
            if !(SYNC_MIN..=SYNC_MAX).contains(&value) {
                return Err(invalid(
                    field,
                    format!("{} is outside {}..={}", value, SYNC_MIN, SYNC_MAX),
                ));
            }
        }

        let mut seen = HashSet::new();
        for channel in &self.channels {
            if usize::from(channel.number) >= CHANNEL_COUNT {
                return Err(invalid(
                    "channels",
                    format!("channel {} does not exist", channel.number),
                ));
            }
            if !seen.insert(channel.number) {
                return Err(invalid(
                    "channels",
                    format!("channel {} is configured twice", channel.number),
                ));
            }
        }

        if let Some(sync) = self.sync.channel {
            if usize::from(sync) >= CHANNEL_COUNT {
                return Err(invalid(
                    "sync.channel",
                    format!("channel {} does not exist", sync),
                ));
            }
            let mode = self
                .channels
                .iter()
                .find(|c| c.number == sync)
                .map(|c| c.settings.mode())
                .unwrap_or_default();
            if mode != ChannelMode::MonitorBoth {
                warn!(
                    "SYNC channel {} is configured as {}; the device only drives SYNC on MB channels",
                    sync, mode
                );
            }
        }
        Ok(())
    }

    /// Add disabled entries for unconfigured channels and order the table by number
    pub fn fill_missing_channels(&mut self) {
        for number in 0..CHANNEL_COUNT as u8 {
            if !self.channels.iter().any(|c| c.number == number) {
                self.channels.push(ChannelConfig::disabled(number));
            }
        }
        self.channels.sort_by_key(|c| c.number);
    }

    /// Interval between two rounds of recurring requests
    pub fn update_interval(&self) -> Duration {
        Duration::from_secs_f64(self.update_interval_s)
    }

    /// Directory recordings are written to
    pub fn recordings_dir(&self) -> PathBuf {
        self.recordings_dir
            .clone()
            .unwrap_or_else(default_recordings_dir)
    }

    /// Channel table built from this configuration
    pub fn build_channels(&self) -> Vec<Channel> {
        self.channels.iter().map(Channel::from_config).collect()
    }
}
