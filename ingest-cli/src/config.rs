//! Configuration file support for the ingest CLI tools
//!
//! Every section and field is optional; missing values take the library
//! defaults. Command-line arguments override what the file sets.

use ingest::{
    AdaptiveConfig, ErrorCorrectionConfig, FeederConfig, GroupConfig, ReconnectPolicy,
};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Receiving client settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ClientConfig {
    /// Identity presented to the server; generated when empty
    pub guid: String,
    pub session_token: String,
    /// -1 disables logging, 0 is the most verbose, 5 the least
    pub log_level: i32,
    pub connect_timeout_ms: u64,
    pub low_latency: bool,
    pub reconnect: bool,
    pub reconnect_window_secs: u64,
    /// Seconds between statistics lines, 0 to disable
    pub stats_interval_secs: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            guid: String::new(),
            session_token: String::new(),
            log_level: 3,
            connect_timeout_ms: 5000,
            low_latency: false,
            reconnect: true,
            reconnect_window_secs: 10,
            stats_interval_secs: 1,
        }
    }
}

impl ClientConfig {
    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            enabled: self.reconnect,
            window: Duration::from_secs(self.reconnect_window_secs),
            ..ReconnectPolicy::default()
        }
    }

    pub fn stats_interval(&self) -> Option<Duration> {
        (self.stats_interval_secs > 0).then(|| Duration::from_secs(self.stats_interval_secs))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LatencyModeSetting {
    #[default]
    Static,
    Increasing,
    Dynamic,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum FecModeSetting {
    #[default]
    Off,
    On,
    Adaptive,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ErrorCorrectionSection {
    pub max_latency_ms: u64,
    pub latency_mode: LatencyModeSetting,
    pub fec_mode: FecModeSetting,
    pub arq: bool,
    pub fec_overhead: u8,
    pub fec_block_ms: u64,
    pub content_aware: bool,
    pub stuff_null_on_unrecovered: bool,
    pub max_output_jitter_ms: u64,
    pub fixed_end_to_end_delay: bool,
}

impl Default for ErrorCorrectionSection {
    fn default() -> Self {
        let defaults = ErrorCorrectionConfig::default();
        ErrorCorrectionSection {
            max_latency_ms: defaults.max_latency.as_millis() as u64,
            latency_mode: LatencyModeSetting::Static,
            fec_mode: FecModeSetting::Off,
            arq: defaults.arq,
            fec_overhead: defaults.fec_overhead,
            fec_block_ms: defaults.fec_block.as_millis() as u64,
            content_aware: defaults.content_aware,
            stuff_null_on_unrecovered: defaults.stuff_null_on_unrecovered,
            max_output_jitter_ms: 0,
            fixed_end_to_end_delay: defaults.fixed_end_to_end_delay,
        }
    }
}

impl ErrorCorrectionSection {
    pub fn to_config(&self) -> ErrorCorrectionConfig {
        ErrorCorrectionConfig {
            max_latency: Duration::from_millis(self.max_latency_ms),
            latency_mode: match self.latency_mode {
                LatencyModeSetting::Static => ingest::LatencyMode::Static,
                LatencyModeSetting::Increasing => ingest::LatencyMode::Increasing,
                LatencyModeSetting::Dynamic => ingest::LatencyMode::Dynamic,
            },
            fec_mode: match self.fec_mode {
                FecModeSetting::Off => ingest::FecMode::Off,
                FecModeSetting::On => ingest::FecMode::On,
                FecModeSetting::Adaptive => ingest::FecMode::Adaptive,
            },
            arq: self.arq,
            fec_overhead: self.fec_overhead,
            fec_block: Duration::from_millis(self.fec_block_ms),
            content_aware: self.content_aware,
            stuff_null_on_unrecovered: self.stuff_null_on_unrecovered,
            max_output_jitter: Duration::from_millis(self.max_output_jitter_ms),
            fixed_end_to_end_delay: self.fixed_end_to_end_delay,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AdaptiveSection {
    pub enabled: bool,
    pub initial_bitrate: u32,
    pub max_bitrate: u32,
    pub down_threshold_ms: u64,
    pub loss_ceiling: f64,
    pub down_hold: u32,
    pub up_hold: u32,
    pub sample_interval_ms: u64,
}

impl Default for AdaptiveSection {
    fn default() -> Self {
        let defaults = AdaptiveConfig::default();
        AdaptiveSection {
            enabled: defaults.enabled,
            initial_bitrate: defaults.initial_bitrate,
            max_bitrate: defaults.max_bitrate,
            down_threshold_ms: defaults.down_threshold.as_millis() as u64,
            loss_ceiling: defaults.loss_ceiling,
            down_hold: defaults.down_hold,
            up_hold: defaults.up_hold,
            sample_interval_ms: defaults.sample_interval.as_millis() as u64,
        }
    }
}

impl AdaptiveSection {
    pub fn to_config(&self) -> AdaptiveConfig {
        AdaptiveConfig {
            enabled: self.enabled,
            initial_bitrate: self.initial_bitrate,
            max_bitrate: self.max_bitrate,
            down_threshold: Duration::from_millis(self.down_threshold_ms),
            loss_ceiling: self.loss_ceiling,
            down_hold: self.down_hold,
            up_hold: self.up_hold,
            sample_interval: Duration::from_millis(self.sample_interval_ms),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FailoverSection {
    pub search_window_ms: u64,
    /// 0 = none, 1 = header, 2 = content
    pub mode: u8,
    pub max_bitrate: u32,
}

impl Default for FailoverSection {
    fn default() -> Self {
        let defaults = GroupConfig::default();
        FailoverSection {
            search_window_ms: defaults.search_window.as_millis() as u64,
            mode: 1,
            max_bitrate: defaults.max_bitrate,
        }
    }
}

impl FailoverSection {
    pub fn to_config(&self) -> Result<GroupConfig, ConfigError> {
        let mode = ingest::MergeMode::from_u8(self.mode)
            .ok_or_else(|| ConfigError::Invalid(format!("merge mode {}", self.mode)))?;
        Ok(GroupConfig {
            search_window: Duration::from_millis(self.search_window_ms),
            mode,
            max_bitrate: self.max_bitrate,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FeederSection {
    pub channel: String,
    pub password: String,
    pub max_bitrate: u32,
    pub latency_ms: u64,
    pub fec_overhead: u8,
    pub fec_block_ms: u64,
    pub content_aware: bool,
    pub enforce_bitrate: bool,
}

impl Default for FeederSection {
    fn default() -> Self {
        let defaults = FeederConfig::default();
        FeederSection {
            channel: String::new(),
            password: String::new(),
            max_bitrate: defaults.max_bitrate,
            latency_ms: defaults.latency.as_millis() as u64,
            fec_overhead: defaults.fec_overhead,
            fec_block_ms: defaults.fec_block.as_millis() as u64,
            content_aware: defaults.content_aware,
            enforce_bitrate: defaults.enforce_bitrate,
        }
    }
}

impl FeederSection {
    pub fn to_config(&self) -> FeederConfig {
        FeederConfig {
            channel: self.channel.clone(),
            password: self.password.clone(),
            max_bitrate: self.max_bitrate,
            latency: Duration::from_millis(self.latency_ms),
            fec_overhead: self.fec_overhead,
            fec_block: Duration::from_millis(self.fec_block_ms),
            content_aware: self.content_aware,
            enforce_bitrate: self.enforce_bitrate,
            ..FeederConfig::default()
        }
    }
}

/// Contents of an ingest TOML file
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct IngestConfig {
    pub client: ClientConfig,
    pub error_correction: ErrorCorrectionSection,
    pub adaptive: AdaptiveSection,
    pub failover: FailoverSection,
    pub feeder: FeederSection,
}

impl IngestConfig {
    /// Load configuration from TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        let config: IngestConfig = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Save configuration to TOML file
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let contents = toml::to_string_pretty(self)?;
        fs::write(path, contents)?;
        Ok(())
    }

    /// File contents when given, defaults otherwise
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::from_file(path),
            None => Ok(IngestConfig::default()),
        }
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
