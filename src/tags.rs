//! Metadata tags attached to output streams at absolute sample offsets.

use serde::{Deserialize, Serialize};

/// Channel-related status flags (bit mask).
pub mod channel_status {
    /// Overvoltage occurred on the channel.
    pub const OVERFLOW: u32 = 0x01;
    /// Not enough pre- or post-trigger samples to perform realignment.
    pub const REALIGNMENT_ERROR: u32 = 0x02;
    /// Insufficient buffer size to extract all samples.
    pub const NOT_ALL_DATA_EXTRACTED: u32 = 0x04;
    /// Timed out waiting for the realignment event.
    pub const TIMEOUT_WAITING_WR_OR_REALIGNMENT: u32 = 0x08;
}

/// Acquisition metadata attached to every streaming chunk.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AcqInfo {
    /// UTC timestamp in nanoseconds taken when the chunk was emitted.
    pub timestamp_ns: i64,
    /// Seconds per effective sample.
    pub timebase: f64,
    pub user_delay: f64,
    pub actual_delay: f64,
    /// Samples in the annotated chunk.
    pub samples: u32,
    pub triggered: bool,
    /// -1 when the chunk is not trigger-aligned.
    pub trigger_timestamp_ns: i64,
    /// Channel status bits, see [`channel_status`].
    pub status: u32,
}

/// Per-waveform capture metadata emitted once per rapid-block waveform.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TriggerInfo {
    /// Pre-trigger samples in the waveform (after downsampling).
    pub pre_trigger_samples: u32,
    /// Post-trigger samples in the waveform (after downsampling).
    pub post_trigger_samples: u32,
    pub status: u32,
    pub timebase: f64,
    pub timestamp_ns: i64,
}

/// Tag payloads the block emits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tag {
    /// Published once per arm, on the first successful work call.
    TimebaseInfo { timebase: f64 },
    /// Streaming chunk annotation.
    AcqInfo(AcqInfo),
    /// Rapid-block waveform annotation.
    TriggerInfo(TriggerInfo),
    /// Bare trigger marker at a detected trigger offset.
    Trigger,
}

/// A tag bound to one output stream at an absolute sample offset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamTag {
    /// Output stream index in the fixed layout: streams `2i` and `2i + 1`
    /// are channel `i`'s value and error estimate, followed by one stream
    /// per digital port.
    pub stream: usize,
    /// Absolute sample offset on that stream.
    pub offset: u64,
    pub tag: Tag,
}
