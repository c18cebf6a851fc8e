//! The digitizer acquisition block.
//!
//! [`DigitizerBlock`] mediates between a sampling driver and a downstream
//! pipeline: it drives the device through its lifecycle, arranges samples in
//! time, detects software triggers and annotates the output with acquisition
//! metadata. One block owns one driver and one acquisition session at a
//! time.
//!
//! # Architecture
//!
//! ```text
//!                 ┌────────────────────────────────────────────┐
//!                 │               DigitizerBlock               │
//!  control ──────►│ lifecycle FSM │ config │ error log         │
//!                 └──────┬────────────────────────▲────────────┘
//!                        │ owns                   │ work()
//!                 ┌──────▼──────┐  push   ┌───────┴────────┐
//!   poller ──poll─►   driver    ├────────►│   AppBuffer    │
//!   thread        └─────────────┘ (sink)  └────────────────┘
//! ```
//!
//! In streaming mode a dedicated poller advances the driver, the driver
//! callback queues chunks, and each `work` call delivers exactly one chunk
//! per enabled stream. In rapid-block mode `work` waits for the device to
//! capture a set of waveforms and then reads them out one by one in two
//! phases (a tagged first read, untagged remainder reads).
//!
//! # Example
//!
//! ```no_run
//! use daq_digitizer::{DigitizerBlock, SimulatedDriver, TriggerDirection, WorkOutput, WorkReturn};
//!
//! # fn main() -> daq_digitizer::Result<()> {
//! let driver = SimulatedDriver::builder().signal_frequency(1_000.0).build();
//! let mut block = DigitizerBlock::new(2, 1, Box::new(driver))?;
//! block.set_samp_rate(1_000_000.0)?;
//! block.set_aichan("A", true, 5.0, true, 0.0)?;
//! block.set_aichan_trigger("A", TriggerDirection::Rising, 0.5)?;
//! block.set_buffer_size(1024)?;
//! block.set_streaming(0.01)?;
//! block.set_auto_arm(true);
//! assert!(block.start());
//!
//! let mut out = WorkOutput::new(2, 1);
//! loop {
//!     match block.work(1024, &mut out)? {
//!         WorkReturn::Produced(_) => {
//!             // consume out.analog[0].samples and out.tags, then:
//!             out.clear();
//!         }
//!         WorkReturn::Again => continue,
//!         WorkReturn::Done => break,
//!     }
//! }
//! block.stop();
//! # Ok(())
//! # }
//! ```

use crate::app_buffer::AppBuffer;
use crate::config::{
    parse_channel_id, parse_port_id, AcquisitionConfig, AcquisitionMode, ChannelConfig,
    DownsamplingMode, PortConfig, TriggerConfig, TriggerDirection, TriggerSource,
    MAX_AI_CHANNELS, MAX_DI_PORTS,
};
use crate::driver::{AcquisitionSink, DataReadySignal, DigitizerDriver, DriverSetup};
use crate::error::{DigitizerError, ErrorEntry, ErrorLog, Result};
use crate::estimator::{RateMonitor, RATE_WINDOW};
use crate::poller::{Poller, PollerContext};
use crate::tags::{AcqInfo, StreamTag, Tag, TriggerInfo};
use crate::trigger::TriggerDetector;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Capacity of the block's error log.
const ERROR_LOG_CAPACITY: usize = 128;

/// Lifecycle state of the block, derived for introspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockState {
    Uninitialized,
    Initialized,
    Armed,
    Running,
    Stopping,
    Closed,
}

/// Outcome of one `work` invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkReturn {
    /// Samples were appended to every enabled output stream.
    Produced(usize),
    /// Nothing produced this round; call again.
    Again,
    /// End of stream; no further output will be produced.
    Done,
}

/// Value and error-estimate streams of one analog channel slot.
#[derive(Debug, Clone, Default)]
pub struct AnalogStream {
    pub samples: Vec<f32>,
    pub errors: Vec<f32>,
}

/// Byte stream of one digital port slot.
#[derive(Debug, Clone, Default)]
pub struct PortStream {
    pub samples: Vec<u8>,
}

/// Output of `work` calls: one positional slot per stream, enabled or not,
/// so downstream wiring stays static, plus the tags anchored at absolute
/// sample offsets.
///
/// Stream indices follow the fixed layout: channel `i` owns streams `2i`
/// (values) and `2i + 1` (error estimates); port `j` owns stream
/// `2 * n_channels + j`.
#[derive(Debug, Clone, Default)]
pub struct WorkOutput {
    pub analog: Vec<AnalogStream>,
    pub ports: Vec<PortStream>,
    pub tags: Vec<StreamTag>,
}

impl WorkOutput {
    pub fn new(ai_channels: usize, di_ports: usize) -> Self {
        Self {
            analog: (0..ai_channels).map(|_| AnalogStream::default()).collect(),
            ports: (0..di_ports).map(|_| PortStream::default()).collect(),
            tags: Vec::new(),
        }
    }

    /// Discard accumulated samples and tags, keeping allocations.
    pub fn clear(&mut self) {
        for stream in &mut self.analog {
            stream.samples.clear();
            stream.errors.clear();
        }
        for port in &mut self.ports {
            port.samples.clear();
        }
        self.tags.clear();
    }

    /// Total number of output streams in the fixed layout.
    pub fn stream_count(&self) -> usize {
        2 * self.analog.len() + self.ports.len()
    }

    /// Stream index of channel `i`'s value stream.
    pub fn value_stream(channel: usize) -> usize {
        2 * channel
    }

    /// Stream index of channel `i`'s error-estimate stream.
    pub fn error_stream(channel: usize) -> usize {
        2 * channel + 1
    }

    /// Stream index of port `j`'s byte stream.
    pub fn port_stream(&self, port: usize) -> usize {
        2 * self.analog.len() + port
    }
}

/// Cloneable handle requesting a cooperative stop from another thread.
///
/// The block itself is owned by one framework worker; other threads cannot
/// call [`DigitizerBlock::stop`] directly. A stop handle posts the stop
/// condition on both wait points, so a worker parked in `work` returns
/// [`WorkReturn::Done`] promptly and its owner can then tear the block down.
#[derive(Clone)]
pub struct StopHandle {
    buffer: Arc<AppBuffer>,
    data_ready: Arc<DataReadySignal>,
    stop_requested: Arc<AtomicBool>,
}

impl StopHandle {
    pub fn request_stop(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
        self.buffer.notify_data_ready(Some(DigitizerError::Stopped));
        self.data_ready.notify(Some(DigitizerError::Stopped));
    }
}

/// Read cursor within one captured waveform.
#[derive(Debug, Clone, Copy)]
struct WaveformCursor {
    waveform_idx: u32,
    offset: usize,
    samples_left: usize,
}

/// Two-phase rapid-block read state: the first read of each waveform
/// carries the tags, the rest is plain data.
#[derive(Debug, Clone, Copy)]
enum RapidBlockState {
    Waiting,
    ReadingFirst { cursor: WaveformCursor },
    ReadingRest { cursor: WaveformCursor },
}

/// Acquisition block gluing a digitizer driver to stream outputs.
pub struct DigitizerBlock {
    channels: Vec<ChannelConfig>,
    ports: Vec<PortConfig>,
    trigger_cfg: TriggerConfig,
    acq: AcquisitionConfig,

    driver: Arc<Mutex<Box<dyn DigitizerDriver>>>,
    buffer: Arc<AppBuffer>,
    monitor: Arc<Mutex<RateMonitor>>,
    data_ready: Arc<DataReadySignal>,
    errors: Arc<ErrorLog>,
    nominal_rate_bits: Arc<AtomicU64>,
    stop_requested: Arc<AtomicBool>,

    poller: Option<Poller>,

    initialized: bool,
    armed: bool,
    closed: bool,
    stopping: bool,
    was_triggered_once: bool,
    timebase_published: bool,
    start_error: Option<String>,

    detector: TriggerDetector,
    rapid: RapidBlockState,
    nitems_written: u64,
}

fn utc_now_ns() -> i64 {
    chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default()
}

impl DigitizerBlock {
    /// Create a block for a device with `ai_channels` analog inputs and
    /// `di_ports` digital ports.
    pub fn new(
        ai_channels: usize,
        di_ports: usize,
        driver: Box<dyn DigitizerDriver>,
    ) -> Result<Self> {
        if ai_channels > MAX_AI_CHANNELS {
            return Err(DigitizerError::InvalidArgument(format!(
                "at most {MAX_AI_CHANNELS} analog channels supported, got {ai_channels}"
            )));
        }
        if di_ports > MAX_DI_PORTS {
            return Err(DigitizerError::InvalidArgument(format!(
                "at most {MAX_DI_PORTS} digital ports supported, got {di_ports}"
            )));
        }

        let acq = AcquisitionConfig::default();
        Ok(Self {
            channels: vec![ChannelConfig::default(); ai_channels],
            ports: vec![PortConfig::default(); di_ports],
            trigger_cfg: TriggerConfig::default(),
            nominal_rate_bits: Arc::new(AtomicU64::new(acq.nominal_sample_rate.to_bits())),
            acq,
            driver: Arc::new(Mutex::new(driver)),
            buffer: Arc::new(AppBuffer::new()),
            monitor: Arc::new(Mutex::new(RateMonitor::new(RATE_WINDOW))),
            data_ready: Arc::new(DataReadySignal::new()),
            errors: Arc::new(ErrorLog::new(ERROR_LOG_CAPACITY)),
            stop_requested: Arc::new(AtomicBool::new(false)),
            poller: None,
            initialized: false,
            armed: false,
            closed: false,
            stopping: false,
            was_triggered_once: false,
            timebase_published: false,
            start_error: None,
            detector: TriggerDetector::new(),
            rapid: RapidBlockState::Waiting,
            nitems_written: 0,
        })
    }

    // ------------------------------------------------------------------
    // Configuration surface. Settings take effect at the next configure;
    // callers mutate them between configure and arm.
    // ------------------------------------------------------------------

    /// Set post- and pre-trigger sample counts; the chunk size becomes
    /// their sum.
    pub fn set_samples(&mut self, post_samples: u32, pre_samples: u32) -> Result<()> {
        if post_samples < 1 {
            return Err(DigitizerError::InvalidArgument(
                "post-trigger samples can't be less than one".into(),
            ));
        }
        self.acq.post_trigger_samples = post_samples;
        self.acq.pre_trigger_samples = pre_samples;
        self.acq.buffer_size = post_samples + pre_samples;
        Ok(())
    }

    pub fn set_samp_rate(&mut self, rate: f64) -> Result<()> {
        if !rate.is_finite() || rate <= 0.0 {
            return Err(DigitizerError::InvalidArgument(
                "sample rate should be greater than zero".into(),
            ));
        }
        self.acq.nominal_sample_rate = rate;
        self.acq.actual_sample_rate = rate;
        self.nominal_rate_bits.store(rate.to_bits(), Ordering::Relaxed);
        Ok(())
    }

    /// Actual sample rate, as reported by the driver after configure.
    pub fn samp_rate(&self) -> f64 {
        self.acq.actual_sample_rate
    }

    /// Samples per streaming chunk.
    pub fn set_buffer_size(&mut self, buffer_size: u32) -> Result<()> {
        self.acq.buffer_size = buffer_size;
        Ok(())
    }

    /// Application buffer capacity in chunks.
    pub fn set_nr_buffers(&mut self, nr_buffers: u32) -> Result<()> {
        if nr_buffers < 1 {
            return Err(DigitizerError::InvalidArgument(
                "number of buffers can't be zero".into(),
            ));
        }
        self.acq.nr_buffers = nr_buffers;
        Ok(())
    }

    pub fn set_driver_buffer_size(&mut self, driver_buffer_size: u32) -> Result<()> {
        if driver_buffer_size < 1 {
            return Err(DigitizerError::InvalidArgument(
                "driver buffer size can't be zero".into(),
            ));
        }
        self.acq.driver_buffer_size = driver_buffer_size;
        Ok(())
    }

    pub fn set_auto_arm(&mut self, auto_arm: bool) {
        self.acq.auto_arm = auto_arm;
    }

    pub fn set_trigger_once(&mut self, once: bool) {
        self.acq.trigger_once = once;
    }

    /// Select streaming mode with the given poll period in seconds.
    pub fn set_streaming(&mut self, poll_period: f64) -> Result<()> {
        if !poll_period.is_finite() || poll_period < 0.0 {
            return Err(DigitizerError::InvalidArgument(
                "poll period can't be negative".into(),
            ));
        }
        self.acq.mode = AcquisitionMode::Streaming { poll_period };
        Ok(())
    }

    /// Select rapid-block mode capturing `nr_captures` waveforms per arm.
    pub fn set_rapid_block(&mut self, nr_captures: u32) -> Result<()> {
        if nr_captures < 1 {
            return Err(DigitizerError::InvalidArgument(
                "nr waveforms should be at least one".into(),
            ));
        }
        self.acq.mode = AcquisitionMode::RapidBlock { nr_captures };
        Ok(())
    }

    pub fn set_downsampling(&mut self, mode: DownsamplingMode, factor: u32) -> Result<()> {
        let factor = if mode == DownsamplingMode::None {
            1
        } else if factor < 2 {
            return Err(DigitizerError::InvalidArgument(
                "downsampling factor should be at least 2".into(),
            ));
        } else {
            factor
        };
        self.acq.downsampling_mode = mode;
        self.acq.downsampling_factor = factor;
        Ok(())
    }

    /// Configure one analog channel by id ("A", "B", ...).
    pub fn set_aichan(
        &mut self,
        id: &str,
        enabled: bool,
        range: f64,
        dc_coupled: bool,
        range_offset: f64,
    ) -> Result<()> {
        let idx = self.aichan_idx(id)?;
        let channel = &mut self.channels[idx];
        channel.enabled = enabled;
        channel.range = range;
        channel.offset = range_offset;
        channel.dc_coupled = dc_coupled;
        channel.actual_range = range;
        Ok(())
    }

    pub fn set_aichan_range(&mut self, id: &str, range: f64, range_offset: f64) -> Result<()> {
        let idx = self.aichan_idx(id)?;
        self.channels[idx].range = range;
        self.channels[idx].offset = range_offset;
        Ok(())
    }

    /// Arm the software trigger on an analog channel.
    pub fn set_aichan_trigger(
        &mut self,
        id: &str,
        direction: TriggerDirection,
        threshold: f64,
    ) -> Result<()> {
        let channel = self.aichan_idx(id)?;
        self.trigger_cfg = TriggerConfig {
            source: TriggerSource::Analog { channel, threshold },
            direction,
        };
        Ok(())
    }

    /// Configure one digital port by id ("port0".."port9").
    pub fn set_diport(&mut self, id: &str, enabled: bool, logic_level: f64) -> Result<()> {
        let idx = self.diport_idx(id)?;
        self.ports[idx].enabled = enabled;
        self.ports[idx].logic_level = logic_level;
        Ok(())
    }

    /// Arm the software trigger on a digital pin (port = pin / 8).
    pub fn set_di_trigger(&mut self, pin: u32, direction: TriggerDirection) -> Result<()> {
        if pin as usize / 8 >= self.ports.len() {
            return Err(DigitizerError::InvalidArgument(format!(
                "pin {pin} is outside the available digital ports"
            )));
        }
        self.trigger_cfg = TriggerConfig {
            source: TriggerSource::Digital { pin },
            direction,
        };
        Ok(())
    }

    pub fn disable_triggers(&mut self) {
        self.trigger_cfg = TriggerConfig::default();
    }

    fn aichan_idx(&self, id: &str) -> Result<usize> {
        let idx = parse_channel_id(id)?;
        if idx >= self.channels.len() {
            return Err(DigitizerError::InvalidArgument(format!(
                "channel {id:?} not present on this device"
            )));
        }
        Ok(idx)
    }

    fn diport_idx(&self, id: &str) -> Result<usize> {
        let idx = parse_port_id(id)?;
        if idx >= self.ports.len() {
            return Err(DigitizerError::InvalidArgument(format!(
                "port {id:?} not present on this device"
            )));
        }
        Ok(idx)
    }

    // ------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------

    pub fn acquisition(&self) -> &AcquisitionConfig {
        &self.acq
    }

    pub fn acquisition_mode(&self) -> AcquisitionMode {
        self.acq.mode
    }

    pub fn is_armed(&self) -> bool {
        self.armed
    }

    pub fn state(&self) -> BlockState {
        if self.stopping {
            BlockState::Stopping
        } else if self.closed {
            BlockState::Closed
        } else if !self.initialized {
            BlockState::Uninitialized
        } else if self.armed {
            match self.acq.mode {
                AcquisitionMode::Streaming { .. } if self.poller.is_some() => BlockState::Running,
                _ => BlockState::Armed,
            }
        } else {
            BlockState::Initialized
        }
    }

    pub fn enabled_aichan_count(&self) -> usize {
        self.channels.iter().filter(|c| c.enabled).count()
    }

    pub fn enabled_diport_count(&self) -> usize {
        self.ports.iter().filter(|p| p.enabled).count()
    }

    /// Snapshot of the error log, oldest first. Does not clear the log.
    pub fn get_errors(&self) -> Vec<ErrorEntry> {
        self.errors.snapshot()
    }

    /// Message captured when the last `start` failed, if any.
    pub fn configure_error_message(&self) -> Option<&str> {
        self.start_error.as_deref()
    }

    /// Handle for requesting a stop from outside the worker thread.
    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            buffer: Arc::clone(&self.buffer),
            data_ready: Arc::clone(&self.data_ready),
            stop_requested: Arc::clone(&self.stop_requested),
        }
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Open the device. No-op when already initialized.
    pub fn initialize(&mut self) -> Result<()> {
        if self.initialized {
            return Ok(());
        }
        if let Err(fault) = self.driver.lock().initialize() {
            let err = DigitizerError::InitializeFailed(fault);
            self.errors.push(err.clone());
            return Err(err);
        }
        self.initialized = true;
        self.closed = false;
        debug!("device initialized");
        Ok(())
    }

    /// Apply the current configuration to the device and (re)shape the
    /// application buffer. Requires initialized and not armed.
    pub fn configure(&mut self) -> Result<()> {
        if !self.initialized {
            return Err(DigitizerError::InvalidState("initialize first".into()));
        }
        if self.armed {
            return Err(DigitizerError::InvalidState("disarm first".into()));
        }

        let sink = AcquisitionSink::new(
            Arc::downgrade(&self.buffer),
            Arc::downgrade(&self.monitor),
            Arc::downgrade(&self.data_ready),
        );
        let report = {
            let setup = DriverSetup {
                channels: &self.channels,
                ports: &self.ports,
                trigger: &self.trigger_cfg,
                acquisition: &self.acq,
            };
            self.driver.lock().configure(&setup, sink)
        };
        let report = match report {
            Ok(report) => report,
            Err(fault) => {
                let err = DigitizerError::ConfigureFailed(fault);
                self.errors.push(err.clone());
                return Err(err);
            }
        };

        // the achieved rate only feeds the timebase; the watchdog keeps
        // comparing against the user's nominal rate
        self.acq.actual_sample_rate = report.actual_sample_rate;
        for (channel, &range) in self.channels.iter_mut().zip(&report.actual_ranges) {
            channel.actual_range = range;
        }

        self.buffer.initialize(
            self.enabled_aichan_count(),
            self.enabled_diport_count(),
            self.acq.buffer_size as usize,
            self.acq.nr_buffers as usize,
        );

        info!(
            sample_rate = self.acq.actual_sample_rate,
            channels = self.enabled_aichan_count(),
            ports = self.enabled_diport_count(),
            buffer_size = self.acq.buffer_size,
            nr_buffers = self.acq.nr_buffers,
            "configured"
        );
        Ok(())
    }

    /// Start sampling. Idempotent when already armed.
    pub fn arm(&mut self) -> Result<()> {
        if self.armed {
            return Ok(());
        }
        if !self.initialized {
            return Err(DigitizerError::InvalidState("initialize first".into()));
        }

        // seed with the nominal rate so the watchdog cannot trip before
        // real observations displace the seed
        let nominal = self.acq.nominal_sample_rate;
        self.monitor.lock().seed(nominal);

        if let Err(fault) = self.driver.lock().arm() {
            let err = DigitizerError::ArmFailed(fault);
            self.errors.push(err.clone());
            return Err(err);
        }

        self.armed = true;
        self.timebase_published = false;
        // clear any error condition left over from the previous session
        self.buffer.notify_data_ready(None);

        if matches!(self.acq.mode, AcquisitionMode::Streaming { .. }) {
            if let Some(poller) = &self.poller {
                poller.transit_to_running();
            }
        }

        info!(sample_rate = nominal, "armed");
        Ok(())
    }

    /// Stop sampling. Errors are logged, never propagated.
    pub fn disarm(&mut self) {
        if !self.armed {
            return;
        }
        if matches!(self.acq.mode, AcquisitionMode::Streaming { .. }) {
            if let Some(poller) = &self.poller {
                poller.transit_to_idle();
            }
        }
        if let Err(fault) = self.driver.lock().disarm() {
            let err = DigitizerError::DisarmFailed(fault);
            warn!(error = %err, "disarm failed");
            self.errors.push(err);
        }
        self.armed = false;
        debug!("disarmed");
    }

    /// Release the device. Errors are logged, never propagated.
    pub fn close(&mut self) {
        if let Err(fault) = self.driver.lock().close() {
            let err = DigitizerError::CloseFailed(fault);
            warn!(error = %err, "close failed");
            self.errors.push(err);
        }
        self.initialized = false;
        self.closed = true;
    }

    /// Framework entry point: initialize, configure, start the poller and
    /// auto-arm if requested. Any failure is captured and reported through
    /// [`configure_error_message`](Self::configure_error_message); returns
    /// `false` on failure.
    pub fn start(&mut self) -> bool {
        self.stop_requested.store(false, Ordering::SeqCst);
        self.start_error = None;
        match self.start_inner() {
            Ok(()) => true,
            Err(err) => {
                error!(error = %err, "start failed");
                self.start_error = Some(err.to_string());
                false
            }
        }
    }

    fn start_inner(&mut self) -> Result<()> {
        self.initialize()?;
        self.configure()?;

        // allow a flowgraph to restart without reconstructing the block
        self.was_triggered_once = false;
        self.data_ready.clear();
        self.rapid = RapidBlockState::Waiting;

        if let AcquisitionMode::Streaming { poll_period } = self.acq.mode {
            if self.poller.is_none() {
                let ctx = PollerContext {
                    driver: Arc::clone(&self.driver),
                    buffer: Arc::clone(&self.buffer),
                    monitor: Arc::clone(&self.monitor),
                    nominal_rate_bits: Arc::clone(&self.nominal_rate_bits),
                    poll_period: Duration::from_secs_f64(poll_period),
                };
                let poller = Poller::spawn(ctx).map_err(|e| {
                    DigitizerError::InvalidState(format!("failed to spawn poller: {e}"))
                })?;
                self.poller = Some(poller);
            }
            if self.acq.auto_arm {
                self.arm()?;
            }
        }
        Ok(())
    }

    /// Framework exit point: unblock the worker, disarm and tear the poller
    /// down. Always succeeds.
    pub fn stop(&mut self) -> bool {
        self.stop_requested.store(true, Ordering::SeqCst);
        if !self.initialized {
            return true;
        }
        self.stopping = true;

        if self.armed {
            // unblock a worker parked in either wait point
            self.buffer.notify_data_ready(Some(DigitizerError::Stopped));
            self.data_ready.notify(Some(DigitizerError::Stopped));
            self.disarm();
        }

        if let Some(mut poller) = self.poller.take() {
            poller.stop();
        }

        self.start_error = None;
        self.stopping = false;
        true
    }

    // ------------------------------------------------------------------
    // Work loop
    // ------------------------------------------------------------------

    /// Produce the next round of output.
    ///
    /// `capacity` is the number of samples the caller can accept per stream
    /// this call; streaming mode requires at least one chunk's worth
    /// (`buffer_size`). Samples are appended to the enabled slots of `out`
    /// and tags to `out.tags`; the caller decides when to drain them with
    /// [`WorkOutput::clear`].
    pub fn work(&mut self, capacity: usize, out: &mut WorkOutput) -> Result<WorkReturn> {
        if out.analog.len() != self.channels.len() || out.ports.len() != self.ports.len() {
            return Err(DigitizerError::InvalidArgument(
                "output shape does not match the block's channel layout".into(),
            ));
        }

        let ret = match self.acq.mode {
            AcquisitionMode::Streaming { .. } => self.work_stream(capacity, out)?,
            AcquisitionMode::RapidBlock { .. } => self.work_rapid_block(capacity, out)?,
        };

        if let WorkReturn::Produced(n) = ret {
            if n > 0 && !self.timebase_published {
                let timebase = self.acq.timebase();
                for stream in 0..out.stream_count() {
                    out.tags.push(StreamTag {
                        stream,
                        offset: self.nitems_written,
                        tag: Tag::TimebaseInfo { timebase },
                    });
                }
                self.timebase_published = true;
            }
            self.nitems_written += n as u64;
        }
        Ok(ret)
    }

    fn work_stream(&mut self, capacity: usize, out: &mut WorkOutput) -> Result<WorkReturn> {
        let buffer_size = self.acq.buffer_size as usize;
        if capacity < buffer_size {
            return Err(DigitizerError::InvalidArgument(format!(
                "work capacity {capacity} is below the chunk size {buffer_size}"
            )));
        }

        // one chunk per invocation
        if let Err(err) = self.buffer.wait_data_ready() {
            self.errors.push(err.clone());
            match err {
                DigitizerError::Stopped => {
                    info!("stop requested");
                    return Ok(WorkReturn::Done);
                }
                DigitizerError::Watchdog => {
                    warn!("watchdog triggered, rearming device");
                    self.disarm();
                    if let Err(err) = self.arm() {
                        error!(error = %err, "rearm after watchdog failed");
                        return Ok(WorkReturn::Done);
                    }
                    return Ok(WorkReturn::Again);
                }
                err => {
                    error!(error = %err, "error reading stream data");
                    return Ok(WorkReturn::Done);
                }
            }
        }

        let Some((chunk, lost)) = self.buffer.pop() else {
            return Ok(WorkReturn::Again);
        };
        if lost > 0 {
            warn!(lost, "digitizer data chunks lost");
        }

        // bind chunk data into the enabled output slots
        let mut src = 0;
        for (i, channel) in self.channels.iter().enumerate() {
            if !channel.enabled {
                continue;
            }
            out.analog[i].samples.extend_from_slice(&chunk.ai[src]);
            out.analog[i].errors.extend_from_slice(&chunk.ai_errors[src]);
            src += 1;
        }
        let mut src = 0;
        for (j, port) in self.ports.iter().enumerate() {
            if !port.enabled {
                continue;
            }
            out.ports[j].samples.extend_from_slice(&chunk.ports[src]);
            src += 1;
        }

        // acquisition info on every enabled stream
        let info = AcqInfo {
            timestamp_ns: utc_now_ns(),
            timebase: self.acq.timebase(),
            user_delay: 0.0,
            actual_delay: 0.0,
            samples: self.acq.buffer_size,
            triggered: false,
            trigger_timestamp_ns: -1,
            status: 0,
        };
        for (i, channel) in self.channels.iter().enumerate() {
            if !channel.enabled {
                continue;
            }
            out.tags.push(StreamTag {
                stream: WorkOutput::value_stream(i),
                offset: self.nitems_written,
                tag: Tag::AcqInfo(AcqInfo {
                    status: chunk.status.get(i).copied().unwrap_or(0),
                    ..info
                }),
            });
        }
        for (j, port) in self.ports.iter().enumerate() {
            if !port.enabled {
                continue;
            }
            out.tags.push(StreamTag {
                stream: out.port_stream(j),
                offset: self.nitems_written,
                tag: Tag::AcqInfo(info),
            });
        }

        // software trigger detection on the designated source
        let direction = self.trigger_cfg.direction;
        let trigger_offsets = match self.trigger_cfg.source {
            TriggerSource::Analog { channel, threshold } => {
                match self.channels.get(channel) {
                    Some(cfg) if cfg.enabled => {
                        let band = (cfg.actual_range / 100.0) as f32;
                        let samples = &out.analog[channel].samples;
                        let window = &samples[samples.len().saturating_sub(buffer_size)..];
                        self.detector
                            .detect_analog(window, direction, threshold as f32, band)
                    }
                    _ => Vec::new(),
                }
            }
            TriggerSource::Digital { pin } => {
                let port = pin as usize / 8;
                let mask = 1u8 << (pin % 8);
                match self.ports.get(port) {
                    Some(cfg) if cfg.enabled => {
                        let samples = &out.ports[port].samples;
                        let window = &samples[samples.len().saturating_sub(buffer_size)..];
                        self.detector.detect_digital(window, direction, mask)
                    }
                    _ => Vec::new(),
                }
            }
            TriggerSource::None => Vec::new(),
        };

        for trigger_offset in trigger_offsets {
            let offset = self.nitems_written + trigger_offset as u64;
            for (i, channel) in self.channels.iter().enumerate() {
                if channel.enabled {
                    out.tags.push(StreamTag {
                        stream: WorkOutput::value_stream(i),
                        offset,
                        tag: Tag::Trigger,
                    });
                }
            }
            for (j, port) in self.ports.iter().enumerate() {
                if port.enabled {
                    out.tags.push(StreamTag {
                        stream: out.port_stream(j),
                        offset,
                        tag: Tag::Trigger,
                    });
                }
            }
        }

        Ok(WorkReturn::Produced(buffer_size))
    }

    fn work_rapid_block(&mut self, capacity: usize, out: &mut WorkOutput) -> Result<WorkReturn> {
        if capacity == 0 {
            return Err(DigitizerError::InvalidArgument(
                "work capacity can't be zero".into(),
            ));
        }

        if let RapidBlockState::Waiting = self.rapid {
            if self.acq.trigger_once && self.was_triggered_once {
                return Ok(WorkReturn::Done);
            }

            if self.acq.auto_arm {
                self.disarm();
                loop {
                    match self.arm() {
                        Ok(()) => break,
                        Err(err) => {
                            if self.stop_requested.load(Ordering::SeqCst) {
                                return Ok(WorkReturn::Done);
                            }
                            warn!(error = %err, "auto-arm failed, retrying");
                            std::thread::sleep(Duration::from_millis(1));
                        }
                    }
                }
            }

            let err = self.data_ready.wait();
            self.data_ready.clear();
            match err {
                Some(DigitizerError::Stopped) => {
                    info!("stop requested");
                    return Ok(WorkReturn::Done);
                }
                Some(err) => {
                    error!(error = %err, "error while waiting for captured data");
                    self.errors.push(err);
                    return Ok(WorkReturn::Again);
                }
                None => {}
            }

            self.rapid = RapidBlockState::ReadingFirst {
                cursor: WaveformCursor {
                    waveform_idx: 0,
                    offset: 0,
                    samples_left: self.acq.block_size_effective() as usize,
                },
            };
        }

        match self.rapid {
            RapidBlockState::ReadingFirst { cursor } => {
                self.was_triggered_once = true;

                let raw_block_size = self.acq.block_size() as usize;
                if let Err(fault) = self
                    .driver
                    .lock()
                    .prefetch_block(raw_block_size, cursor.waveform_idx)
                {
                    let err = DigitizerError::ReadFailed(fault);
                    error!(error = %err, "waveform prefetch failed");
                    self.errors.push(err);
                    return Ok(WorkReturn::Done);
                }

                let nsamples = capacity.min(cursor.samples_left);
                let chunk = match self.driver.lock().rapid_block_data(
                    cursor.offset,
                    nsamples,
                    cursor.waveform_idx,
                ) {
                    Ok(chunk) => chunk,
                    Err(fault) => {
                        let err = DigitizerError::ReadFailed(fault);
                        error!(error = %err, "waveform read failed");
                        self.errors.push(err);
                        return Ok(WorkReturn::Done);
                    }
                };
                self.bind_rapid_chunk(&chunk.ai, &chunk.ai_errors, &chunk.ports, out);

                // trigger metadata once per waveform, at its first sample;
                // the bare trigger marker sits at the pre/post boundary
                let pre = self.acq.pre_trigger_samples_effective();
                let info = TriggerInfo {
                    pre_trigger_samples: pre,
                    post_trigger_samples: self.acq.post_trigger_samples_effective(),
                    status: 0,
                    timebase: self.acq.timebase(),
                    timestamp_ns: utc_now_ns(),
                };
                let trigger_offset = self.nitems_written + u64::from(pre);
                for (i, channel) in self.channels.iter().enumerate() {
                    if !channel.enabled {
                        continue;
                    }
                    let stream = WorkOutput::value_stream(i);
                    out.tags.push(StreamTag {
                        stream,
                        offset: self.nitems_written,
                        tag: Tag::TriggerInfo(TriggerInfo {
                            status: chunk.status.get(i).copied().unwrap_or(0),
                            ..info
                        }),
                    });
                    out.tags.push(StreamTag {
                        stream,
                        offset: trigger_offset,
                        tag: Tag::Trigger,
                    });
                }
                for (j, port) in self.ports.iter().enumerate() {
                    if !port.enabled {
                        continue;
                    }
                    let stream = out.port_stream(j);
                    out.tags.push(StreamTag {
                        stream,
                        offset: self.nitems_written,
                        tag: Tag::TriggerInfo(info),
                    });
                    out.tags.push(StreamTag {
                        stream,
                        offset: trigger_offset,
                        tag: Tag::Trigger,
                    });
                }

                self.rapid = self.advance_cursor(cursor, nsamples);
                Ok(WorkReturn::Produced(nsamples))
            }
            RapidBlockState::ReadingRest { cursor } => {
                let nsamples = capacity.min(cursor.samples_left);
                let chunk = match self.driver.lock().rapid_block_data(
                    cursor.offset,
                    nsamples,
                    cursor.waveform_idx,
                ) {
                    Ok(chunk) => chunk,
                    Err(fault) => {
                        let err = DigitizerError::ReadFailed(fault);
                        error!(error = %err, "waveform read failed");
                        self.errors.push(err);
                        return Ok(WorkReturn::Done);
                    }
                };
                self.bind_rapid_chunk(&chunk.ai, &chunk.ai_errors, &chunk.ports, out);

                self.rapid = self.advance_cursor(cursor, nsamples);
                Ok(WorkReturn::Produced(nsamples))
            }
            RapidBlockState::Waiting => Ok(WorkReturn::Done),
        }
    }

    /// Append fetched waveform data to the enabled output slots.
    fn bind_rapid_chunk(
        &self,
        ai: &[Vec<f32>],
        ai_errors: &[Vec<f32>],
        ports: &[Vec<u8>],
        out: &mut WorkOutput,
    ) {
        let mut src = 0;
        for (i, channel) in self.channels.iter().enumerate() {
            if !channel.enabled {
                continue;
            }
            if let (Some(values), Some(errors)) = (ai.get(src), ai_errors.get(src)) {
                out.analog[i].samples.extend_from_slice(values);
                out.analog[i].errors.extend_from_slice(errors);
            }
            src += 1;
        }
        let mut src = 0;
        for (j, port) in self.ports.iter().enumerate() {
            if !port.enabled {
                continue;
            }
            if let Some(bytes) = ports.get(src) {
                out.ports[j].samples.extend_from_slice(bytes);
            }
            src += 1;
        }
    }

    /// Step the read cursor past `nsamples`; move to the next waveform or
    /// back to Waiting when the current one is exhausted.
    fn advance_cursor(&self, mut cursor: WaveformCursor, nsamples: usize) -> RapidBlockState {
        cursor.offset += nsamples;
        cursor.samples_left -= nsamples;
        if cursor.samples_left > 0 {
            return RapidBlockState::ReadingRest { cursor };
        }

        let next_waveform = cursor.waveform_idx + 1;
        if next_waveform >= self.acq.nr_captures() {
            RapidBlockState::Waiting
        } else {
            RapidBlockState::ReadingFirst {
                cursor: WaveformCursor {
                    waveform_idx: next_waveform,
                    offset: 0,
                    samples_left: self.acq.block_size_effective() as usize,
                },
            }
        }
    }
}
