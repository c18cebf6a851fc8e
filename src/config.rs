//! Acquisition configuration: analog channels, digital ports, triggers and
//! the per-session acquisition parameters.
//!
//! Configuration is owned by the block and mutated through its control
//! surface between `configure` and `arm`; the structs here are plain data so
//! they can be serialized into session files or sent over a control channel.

use crate::error::{DigitizerError, Result};
use serde::{Deserialize, Serialize};

/// Largest number of analog input channels any supported device exposes.
pub const MAX_AI_CHANNELS: usize = 16;

/// Largest number of digital input ports any supported device exposes.
pub const MAX_DI_PORTS: usize = 10;

/// Per-channel configuration of one analog input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelConfig {
    pub enabled: bool,
    /// Requested full-scale range in volts.
    pub range: f64,
    /// Offset applied to the input in volts.
    pub offset: f64,
    pub dc_coupled: bool,
    /// Full-scale range actually achieved, reported by the driver at
    /// configure time. Used for the trigger hysteresis band.
    pub actual_range: f64,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            range: 5.0,
            offset: 0.0,
            dc_coupled: true,
            actual_range: 5.0,
        }
    }
}

/// Per-port configuration of one digital input port.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortConfig {
    pub enabled: bool,
    /// Threshold voltage above which a pin reads as logical one.
    pub logic_level: f64,
}

impl Default for PortConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            logic_level: 1.5,
        }
    }
}

/// Edge or level the trigger fires on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerDirection {
    Rising,
    Falling,
    High,
    Low,
}

/// What the software trigger watches. Exactly one of the three is active.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerSource {
    /// Triggering disabled.
    None,
    /// Analog channel, by hardware channel index, with a threshold in volts.
    Analog { channel: usize, threshold: f64 },
    /// Digital pin, numbered across ports (port = pin / 8, bit = pin % 8).
    Digital { pin: u32 },
}

/// Trigger configuration of the block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerConfig {
    pub source: TriggerSource,
    pub direction: TriggerDirection,
}

impl Default for TriggerConfig {
    fn default() -> Self {
        Self {
            source: TriggerSource::None,
            direction: TriggerDirection::Rising,
        }
    }
}

impl TriggerConfig {
    pub fn is_enabled(&self) -> bool {
        !matches!(self.source, TriggerSource::None)
    }

    pub fn is_analog(&self) -> bool {
        matches!(self.source, TriggerSource::Analog { .. })
    }

    pub fn is_digital(&self) -> bool {
        matches!(self.source, TriggerSource::Digital { .. })
    }
}

/// Hardware downsampling applied by the driver before samples reach the
/// application buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownsamplingMode {
    None,
    MinMaxAgg,
    Decimate,
    Average,
}

/// Operating mode of the block.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AcquisitionMode {
    /// Continuous delivery at the configured rate; the poller drives the
    /// device at roughly `poll_period` seconds per poll.
    Streaming { poll_period: f64 },
    /// A fixed number of discrete waveforms triggered by the device.
    RapidBlock { nr_captures: u32 },
}

/// Acquisition parameters for one session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcquisitionConfig {
    /// Rate requested from the device, in samples per second.
    pub nominal_sample_rate: f64,
    /// Rate the device reports it will actually achieve.
    pub actual_sample_rate: f64,
    pub pre_trigger_samples: u32,
    pub post_trigger_samples: u32,
    /// Samples per chunk delivered through the application buffer.
    pub buffer_size: u32,
    /// Capacity of the application buffer, in chunks.
    pub nr_buffers: u32,
    /// Size of the driver-side sample buffer.
    pub driver_buffer_size: u32,
    pub mode: AcquisitionMode,
    pub downsampling_mode: DownsamplingMode,
    pub downsampling_factor: u32,
    pub auto_arm: bool,
    pub trigger_once: bool,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            nominal_sample_rate: 10_000.0,
            actual_sample_rate: 10_000.0,
            pre_trigger_samples: 1_000,
            post_trigger_samples: 10_000,
            buffer_size: 8_192,
            nr_buffers: 100,
            driver_buffer_size: 100_000,
            mode: AcquisitionMode::Streaming { poll_period: 0.001 },
            downsampling_mode: DownsamplingMode::None,
            downsampling_factor: 1,
            auto_arm: false,
            trigger_once: false,
        }
    }
}

impl AcquisitionConfig {
    /// Pre-trigger samples after downsampling.
    pub fn pre_trigger_samples_effective(&self) -> u32 {
        if self.downsampling_mode == DownsamplingMode::None {
            self.pre_trigger_samples
        } else {
            self.pre_trigger_samples / self.downsampling_factor
        }
    }

    /// Post-trigger samples after downsampling.
    pub fn post_trigger_samples_effective(&self) -> u32 {
        if self.downsampling_mode == DownsamplingMode::None {
            self.post_trigger_samples
        } else {
            self.post_trigger_samples / self.downsampling_factor
        }
    }

    /// Raw samples per waveform (pre + post, before downsampling).
    pub fn block_size(&self) -> u32 {
        self.pre_trigger_samples + self.post_trigger_samples
    }

    /// Samples per waveform after downsampling.
    pub fn block_size_effective(&self) -> u32 {
        self.pre_trigger_samples_effective() + self.post_trigger_samples_effective()
    }

    /// Seconds per effective sample.
    pub fn timebase(&self) -> f64 {
        if self.downsampling_mode == DownsamplingMode::None {
            1.0 / self.actual_sample_rate
        } else {
            f64::from(self.downsampling_factor) / self.actual_sample_rate
        }
    }

    /// Number of waveforms captured per arm; 1 in streaming mode.
    pub fn nr_captures(&self) -> u32 {
        match self.mode {
            AcquisitionMode::Streaming { .. } => 1,
            AcquisitionMode::RapidBlock { nr_captures } => nr_captures,
        }
    }

    /// Poll period in seconds; 0 when not streaming.
    pub fn poll_period(&self) -> f64 {
        match self.mode {
            AcquisitionMode::Streaming { poll_period } => poll_period,
            AcquisitionMode::RapidBlock { .. } => 0.0,
        }
    }
}

/// Parse an analog channel id ("A", "B", ...) into a channel index.
pub fn parse_channel_id(id: &str) -> Result<usize> {
    let mut chars = id.chars();
    let (Some(c), None) = (chars.next(), chars.next()) else {
        return Err(DigitizerError::InvalidArgument(format!(
            "analog channel id must be a single character: {id:?}"
        )));
    };
    let c = c.to_ascii_uppercase();
    let idx = (c as usize).wrapping_sub('A' as usize);
    if !c.is_ascii_uppercase() || idx >= MAX_AI_CHANNELS {
        return Err(DigitizerError::InvalidArgument(format!(
            "invalid analog channel id: {id:?}"
        )));
    }
    Ok(idx)
}

/// Parse a digital port id ("port0".."port9") into a port index.
pub fn parse_port_id(id: &str) -> Result<usize> {
    let digit = id
        .strip_prefix("port")
        .filter(|rest| rest.len() == 1)
        .and_then(|rest| rest.chars().next())
        .and_then(|c| c.to_digit(10));
    match digit {
        Some(d) if (d as usize) < MAX_DI_PORTS => Ok(d as usize),
        _ => Err(DigitizerError::InvalidArgument(format!(
            "invalid port id: {id:?}, expected 'port<digit>'"
        ))),
    }
}
