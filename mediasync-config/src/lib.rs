//! Configuration management for the media sync service
//!
//! Settings come from `MEDIASYNC_*` environment variables (a `.env` file is
//! loaded first when present), layered over built-in defaults.

use config::{Config, Environment};
use serde::Deserialize;
use std::net::SocketAddr;
use std::str::FromStr;
use thiserror::Error;

/// Prefix of all environment variables
pub const ENV_PREFIX: &str = "MEDIASYNC";

/// Largest datagram either end sends or reads
pub const MAX_DATAGRAM_SIZE: usize = 1500;

/// Fixed RTP header, no CSRCs or extension
const RTP_HEADER_SIZE: usize = 12;

/// The daemon streams interleaved S16
const BYTES_PER_SAMPLE: u32 = 2;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Which end of the stream this process runs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Sine source → RTP
    Send,
    /// RTP → playback
    Receive,
}

impl FromStr for Mode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "send" => Ok(Mode::Send),
            "receive" => Ok(Mode::Receive),
            other => Err(ConfigError::Invalid(format!("unknown mode '{}'", other))),
        }
    }
}

/// Application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub mode: String,
    pub local_addr: SocketAddr,
    pub remote_addr: SocketAddr,
    pub sample_rate: u32,
    pub channels: u32,
    /// Packet duration
    pub packet_ms: u32,
    /// Receive buffering depth
    pub latency_ms: u32,
    /// Ring size in bytes
    pub ring_size: usize,
    pub overrun_factor: u32,
    /// DLL error clamp
    pub max_error_ms: u32,
    pub dll_bandwidth: f64,
    pub dll_period: u32,
    pub direct_timestamp: bool,
    pub payload_type: u8,
    /// Random when unset
    pub ssrc: Option<u32>,
    /// Random when unset
    pub ts_offset: Option<u32>,
    pub log_level: String,
    pub log_format: String,
}

impl AppConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        // Load .env file if it exists
        let _ = dotenvy::dotenv();

        Self::from_source(Environment::with_prefix(ENV_PREFIX).try_parsing(true))
    }

    /// Load configuration from an explicit environment source
    pub fn from_source(env: Environment) -> Result<Self, ConfigError> {
        let config: AppConfig = Config::builder()
            .set_default("mode", "receive")?
            .set_default("local_addr", "0.0.0.0:46000")?
            .set_default("remote_addr", "127.0.0.1:46000")?
            .set_default("sample_rate", 48000)?
            .set_default("channels", 2)?
            .set_default("packet_ms", 4)?
            .set_default("latency_ms", 100)?
            .set_default("ring_size", 4 * 1024 * 1024)?
            .set_default("overrun_factor", 8)?
            .set_default("max_error_ms", 2)?
            .set_default("dll_bandwidth", 0.016)?
            .set_default("dll_period", 128)?
            .set_default("direct_timestamp", false)?
            .set_default("payload_type", 127)?
            .set_default("log_level", "info")?
            .set_default("log_format", "json")?
            .add_source(env)
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the engine cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.mode()?;

        if self.sample_rate == 0 {
            return Err(ConfigError::Invalid("sample_rate must be non-zero".to_string()));
        }
        if !(1..=8).contains(&self.channels) {
            return Err(ConfigError::Invalid(format!(
                "channels must be 1..=8, got {}",
                self.channels
            )));
        }
        if !self.ring_size.is_power_of_two() {
            return Err(ConfigError::Invalid(format!(
                "ring_size must be a power of two, got {}",
                self.ring_size
            )));
        }
        if self.packet_samples() == 0 {
            return Err(ConfigError::Invalid(format!(
                "packet_ms {} is shorter than one sample",
                self.packet_ms
            )));
        }
        if self.packet_bytes() > MAX_DATAGRAM_SIZE {
            return Err(ConfigError::Invalid(format!(
                "packet_ms {} gives {} byte packets, above the {} byte datagram limit",
                self.packet_ms,
                self.packet_bytes(),
                MAX_DATAGRAM_SIZE
            )));
        }
        if self.direct_timestamp && self.ts_offset.is_none() {
            return Err(ConfigError::Invalid(
                "direct_timestamp needs a ts_offset shared by both ends".to_string(),
            ));
        }
        if self.payload_type > 127 {
            return Err(ConfigError::Invalid(format!(
                "payload_type must fit in 7 bits, got {}",
                self.payload_type
            )));
        }
        if self.dll_bandwidth.is_nan() || self.dll_bandwidth <= 0.0 {
            return Err(ConfigError::Invalid("dll_bandwidth must be positive".to_string()));
        }
        if !matches!(self.log_format.as_str(), "json" | "console") {
            return Err(ConfigError::Invalid(format!(
                "log_format must be json or console, got '{}'",
                self.log_format
            )));
        }
        Ok(())
    }

    pub fn mode(&self) -> Result<Mode, ConfigError> {
        self.mode.parse()
    }

    /// Frames per packet
    pub fn packet_samples(&self) -> u32 {
        self.ms_to_samples(self.packet_ms)
    }

    /// Bytes of one packet on the wire
    pub fn packet_bytes(&self) -> usize {
        RTP_HEADER_SIZE + self.packet_samples() as usize * (self.channels * BYTES_PER_SAMPLE) as usize
    }

    /// Frames to keep buffered on the receive side
    pub fn target_occupancy(&self) -> u32 {
        self.ms_to_samples(self.latency_ms)
    }

    /// DLL error clamp in frames
    pub fn max_error(&self) -> f32 {
        self.ms_to_samples(self.max_error_ms) as f32
    }

    /// Get log level, defaulting to "info"
    pub fn log_level(&self) -> &str {
        if self.log_level.is_empty() {
            "info"
        } else {
            &self.log_level
        }
    }

    fn ms_to_samples(&self, ms: u32) -> u32 {
        (self.sample_rate as u64 * ms as u64 / 1000) as u32
    }
}
