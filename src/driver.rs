//! Driver capability seam between the acquisition block and concrete
//! devices.
//!
//! A device family implements [`DigitizerDriver`]; the block owns the driver
//! and serializes all calls into it. Data flows the other way through an
//! [`AcquisitionSink`] the block hands to the driver at configure time: the
//! sink holds weak references back into the block's buffers, which breaks
//! the reference cycle a callback would otherwise create (the block owns the
//! driver, the driver needs to reach the block's buffers).
//!
//! ```text
//!   block ──owns──► driver
//!     ▲                │ streaming callback / captures-complete signal
//!     └──weak──  AcquisitionSink
//! ```

use crate::app_buffer::{AppBuffer, ChunkRecord};
use crate::config::{AcquisitionConfig, ChannelConfig, PortConfig, TriggerConfig};
use crate::error::{DigitizerError, DriverFault};
use crate::estimator::RateMonitor;
use parking_lot::{Condvar, Mutex};
use std::sync::Weak;
use tracing::trace;

/// Result type for driver operations.
pub type DriverResult<T> = std::result::Result<T, DriverFault>;

/// Everything a device needs to apply one acquisition setup.
#[derive(Debug)]
pub struct DriverSetup<'a> {
    pub channels: &'a [ChannelConfig],
    pub ports: &'a [PortConfig],
    pub trigger: &'a TriggerConfig,
    pub acquisition: &'a AcquisitionConfig,
}

/// Values the device reports back from a successful configure.
#[derive(Debug, Clone)]
pub struct DriverReport {
    /// Sample rate the device will actually achieve.
    pub actual_sample_rate: f64,
    /// Achieved full-scale range per analog channel, indexed by hardware
    /// channel number.
    pub actual_ranges: Vec<f64>,
}

/// Samples fetched from one captured waveform; enabled channels and ports
/// only, in channel/port order. `status` is indexed by hardware channel
/// number.
#[derive(Debug, Clone, Default)]
pub struct RapidBlockChunk {
    pub ai: Vec<Vec<f32>>,
    pub ai_errors: Vec<Vec<f32>>,
    pub ports: Vec<Vec<u8>>,
    pub status: Vec<u32>,
}

/// Capability set implemented by concrete digitizer devices.
///
/// All methods are invoked with the block's driver lock held, so
/// implementations never see concurrent calls. `poll` runs on the poller
/// thread; everything else on the framework worker.
pub trait DigitizerDriver: Send {
    /// Open the device and allocate driver-side buffers.
    fn initialize(&mut self) -> DriverResult<()>;

    /// Apply channels, ports, trigger, rate and mode; keep the sink for
    /// later callbacks.
    fn configure(&mut self, setup: &DriverSetup<'_>, sink: AcquisitionSink)
        -> DriverResult<DriverReport>;

    /// Start sampling; streaming devices begin delivering chunks through
    /// the sink on subsequent polls.
    fn arm(&mut self) -> DriverResult<()>;

    /// Stop sampling; no callbacks after this returns.
    fn disarm(&mut self) -> DriverResult<()>;

    /// Release the device.
    fn close(&mut self) -> DriverResult<()>;

    /// Advance streaming; may deliver zero or more chunks through the sink.
    fn poll(&mut self) -> DriverResult<()>;

    /// Hint that `nsamples` of waveform `waveform_idx` are about to be
    /// fetched. Devices may ignore this.
    fn prefetch_block(&mut self, _nsamples: usize, _waveform_idx: u32) -> DriverResult<()> {
        Ok(())
    }

    /// Copy `nsamples` starting at `offset` (in effective samples) out of
    /// captured waveform `waveform_idx`.
    fn rapid_block_data(
        &mut self,
        offset: usize,
        nsamples: usize,
        waveform_idx: u32,
    ) -> DriverResult<RapidBlockChunk>;
}

#[derive(Debug, Default)]
struct ReadyState {
    ready: bool,
    error: Option<DigitizerError>,
}

/// Single-slot "captures complete" latch used in rapid-block mode.
#[derive(Debug, Default)]
pub(crate) struct DataReadySignal {
    state: Mutex<ReadyState>,
    cv: Condvar,
}

impl DataReadySignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Latch readiness (optionally carrying an error) and wake the waiter.
    pub fn notify(&self, error: Option<DigitizerError>) {
        let mut state = self.state.lock();
        state.ready = true;
        state.error = error;
        drop(state);
        self.cv.notify_one();
    }

    /// Block until readiness is latched; returns the posted error, if any.
    pub fn wait(&self) -> Option<DigitizerError> {
        let mut state = self.state.lock();
        while !state.ready {
            self.cv.wait(&mut state);
        }
        state.error.clone()
    }

    /// Reset the latch for the next capture cycle.
    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.ready = false;
        state.error = None;
    }
}

/// Callback handle handed to the driver at configure time.
///
/// Holds only weak references, so a driver keeping its sink alive past the
/// block's lifetime degrades callbacks to no-ops instead of leaking the
/// acquisition pipeline.
#[derive(Clone)]
pub struct AcquisitionSink {
    buffer: Weak<AppBuffer>,
    monitor: Weak<Mutex<RateMonitor>>,
    data_ready: Weak<DataReadySignal>,
}

impl AcquisitionSink {
    pub(crate) fn new(
        buffer: Weak<AppBuffer>,
        monitor: Weak<Mutex<RateMonitor>>,
        data_ready: Weak<DataReadySignal>,
    ) -> Self {
        Self {
            buffer,
            monitor,
            data_ready,
        }
    }

    /// Streaming callback: queue one chunk and record its arrival rate.
    ///
    /// Serialized by the caller (the driver contract); never blocks. Chunks
    /// arriving after the block is gone are silently discarded.
    pub fn push_chunk(&self, chunk: ChunkRecord) {
        if let Some(monitor) = self.monitor.upgrade() {
            monitor.lock().observe(chunk.len(), chunk.local_timestamp_ns);
        }
        if let Some(buffer) = self.buffer.upgrade() {
            trace!(samples = chunk.len(), "chunk from driver callback");
            buffer.push(chunk);
        }
    }

    /// Rapid-block callback: all requested captures are ready (or capture
    /// failed with a device fault).
    pub fn notify_captures_ready(&self, result: DriverResult<()>) {
        if let Some(signal) = self.data_ready.upgrade() {
            signal.notify(result.err().map(DigitizerError::ReadFailed));
        }
    }
}
