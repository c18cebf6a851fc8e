//! Simulated digitizer device for tests and demos.
//!
//! [`SimulatedDriver`] implements the full driver capability set without
//! hardware: in streaming mode each poll delivers one chunk of a generated
//! sine wave (plus a square-wave bit pattern on digital ports), in
//! rapid-block mode arming synthesizes the requested number of waveforms and
//! signals captures-complete immediately.
//!
//! Chunk timestamps are synthetic and advance at `rate_scale` times the
//! configured sample rate, so a slow device (for watchdog scenarios) is
//! simulated deterministically instead of depending on wall-clock sleeps.

use crate::app_buffer::ChunkRecord;
use crate::config::AcquisitionMode;
use crate::driver::{
    AcquisitionSink, DigitizerDriver, DriverReport, DriverResult, DriverSetup, RapidBlockChunk,
};
use crate::error::DriverFault;
use tracing::{debug, trace};

/// Builder for [`SimulatedDriver`].
#[derive(Debug, Clone)]
pub struct SimulatedDriverBuilder {
    signal_frequency: f64,
    amplitude: f64,
    rate_scale: f64,
    fail_initialize: bool,
}

impl Default for SimulatedDriverBuilder {
    fn default() -> Self {
        Self {
            signal_frequency: 1_000.0,
            amplitude: 2.0,
            rate_scale: 1.0,
            fail_initialize: false,
        }
    }
}

impl SimulatedDriverBuilder {
    /// Frequency of the generated sine wave in Hz.
    pub fn signal_frequency(mut self, hz: f64) -> Self {
        self.signal_frequency = hz;
        self
    }

    /// Peak amplitude of the generated sine wave in volts.
    pub fn amplitude(mut self, volts: f64) -> Self {
        self.amplitude = volts;
        self
    }

    /// Ratio of achieved to nominal sample rate. Values below the watchdog
    /// threshold make the block observe a slow device.
    pub fn rate_scale(mut self, scale: f64) -> Self {
        self.rate_scale = scale;
        self
    }

    /// Make `initialize` fail with a device fault.
    pub fn fail_initialize(mut self, fail: bool) -> Self {
        self.fail_initialize = fail;
        self
    }

    pub fn build(self) -> SimulatedDriver {
        SimulatedDriver {
            signal_frequency: self.signal_frequency,
            amplitude: self.amplitude,
            rate_scale: self.rate_scale,
            fail_initialize: self.fail_initialize,
            initialized: false,
            armed: false,
            session: None,
            sink: None,
            sample_clock: 0,
            timestamp_ns: 0,
            waveforms: Vec::new(),
        }
    }
}

/// Setup snapshot taken at configure time.
#[derive(Debug, Clone)]
struct Session {
    enabled_channels: Vec<usize>,
    enabled_ports: Vec<usize>,
    n_channels: usize,
    buffer_size: usize,
    sample_rate: f64,
    mode: AcquisitionMode,
    pre_effective: usize,
    block_effective: usize,
    nr_captures: u32,
}

/// One synthesized rapid-block capture.
#[derive(Debug, Clone, Default)]
struct Waveform {
    ai: Vec<Vec<f32>>,
    ports: Vec<Vec<u8>>,
}

/// Function-generator digitizer without hardware.
pub struct SimulatedDriver {
    signal_frequency: f64,
    amplitude: f64,
    rate_scale: f64,
    fail_initialize: bool,

    initialized: bool,
    armed: bool,
    session: Option<Session>,
    sink: Option<AcquisitionSink>,
    /// Sample counter carrying the signal phase across chunks.
    sample_clock: u64,
    /// Synthetic chunk timestamp, ns.
    timestamp_ns: i64,
    waveforms: Vec<Waveform>,
}

impl SimulatedDriver {
    pub fn builder() -> SimulatedDriverBuilder {
        SimulatedDriverBuilder::default()
    }

    fn session(&self) -> DriverResult<&Session> {
        self.session
            .as_ref()
            .ok_or_else(|| DriverFault::new(-2, "simulated device not configured"))
    }

    fn sample_value(&self, n: u64, rate: f64) -> f32 {
        let t = n as f64 / rate;
        (self.amplitude * (std::f64::consts::TAU * self.signal_frequency * t).sin()) as f32
    }

    fn port_value(&self, n: u64, rate: f64) -> u8 {
        if self.sample_value(n, rate) >= 0.0 {
            0xFF
        } else {
            0x00
        }
    }

    fn synthesize_waveforms(&mut self) {
        let Some(session) = self.session.clone() else {
            return;
        };
        self.waveforms = (0..session.nr_captures)
            .map(|_| {
                // flat pre-trigger, decaying ramp after the trigger point
                let shape: Vec<f32> = (0..session.block_effective)
                    .map(|i| {
                        if i < session.pre_effective {
                            0.0
                        } else {
                            let post = (session.block_effective - session.pre_effective).max(1);
                            let k = (i - session.pre_effective) as f32 / post as f32;
                            self.amplitude as f32 * (1.0 - k)
                        }
                    })
                    .collect();
                let port_shape: Vec<u8> = (0..session.block_effective)
                    .map(|i| if i < session.pre_effective { 0x00 } else { 0xFF })
                    .collect();
                Waveform {
                    ai: session.enabled_channels.iter().map(|_| shape.clone()).collect(),
                    ports: session.enabled_ports.iter().map(|_| port_shape.clone()).collect(),
                }
            })
            .collect();
    }
}

impl DigitizerDriver for SimulatedDriver {
    fn initialize(&mut self) -> DriverResult<()> {
        if self.fail_initialize {
            return Err(DriverFault::new(-1, "simulated initialize failure"));
        }
        self.initialized = true;
        Ok(())
    }

    fn configure(
        &mut self,
        setup: &DriverSetup<'_>,
        sink: AcquisitionSink,
    ) -> DriverResult<DriverReport> {
        if !self.initialized {
            return Err(DriverFault::new(-2, "simulated device not initialized"));
        }

        let acq = setup.acquisition;
        self.session = Some(Session {
            enabled_channels: setup
                .channels
                .iter()
                .enumerate()
                .filter_map(|(i, c)| c.enabled.then_some(i))
                .collect(),
            enabled_ports: setup
                .ports
                .iter()
                .enumerate()
                .filter_map(|(i, p)| p.enabled.then_some(i))
                .collect(),
            n_channels: setup.channels.len(),
            buffer_size: acq.buffer_size as usize,
            sample_rate: acq.nominal_sample_rate,
            mode: acq.mode,
            pre_effective: acq.pre_trigger_samples_effective() as usize,
            block_effective: acq.block_size_effective() as usize,
            nr_captures: acq.nr_captures(),
        });
        self.sink = Some(sink);

        debug!(
            channels = setup.channels.iter().filter(|c| c.enabled).count(),
            sample_rate = acq.nominal_sample_rate,
            "simulated device configured"
        );
        // the simulator achieves exactly what was asked of it
        Ok(DriverReport {
            actual_sample_rate: acq.nominal_sample_rate,
            actual_ranges: setup.channels.iter().map(|c| c.range).collect(),
        })
    }

    fn arm(&mut self) -> DriverResult<()> {
        let mode = self.session()?.mode;
        self.armed = true;
        self.sample_clock = 0;
        self.timestamp_ns = 0;

        if let AcquisitionMode::RapidBlock { .. } = mode {
            // captures are instantaneous in simulation
            self.synthesize_waveforms();
            if let Some(sink) = &self.sink {
                sink.notify_captures_ready(Ok(()));
            }
        }
        Ok(())
    }

    fn disarm(&mut self) -> DriverResult<()> {
        self.armed = false;
        Ok(())
    }

    fn close(&mut self) -> DriverResult<()> {
        self.initialized = false;
        self.armed = false;
        self.session = None;
        self.sink = None;
        Ok(())
    }

    fn poll(&mut self) -> DriverResult<()> {
        if !self.armed {
            return Ok(());
        }
        let session = self.session()?.clone();
        if !matches!(session.mode, AcquisitionMode::Streaming { .. }) || session.buffer_size == 0 {
            return Ok(());
        }

        let rate = session.sample_rate;
        let start = self.sample_clock;
        let chunk = ChunkRecord {
            ai: session
                .enabled_channels
                .iter()
                .map(|_| {
                    (start..start + session.buffer_size as u64)
                        .map(|n| self.sample_value(n, rate))
                        .collect()
                })
                .collect(),
            ai_errors: session
                .enabled_channels
                .iter()
                .map(|_| vec![(self.amplitude / 256.0) as f32; session.buffer_size])
                .collect(),
            ports: session
                .enabled_ports
                .iter()
                .map(|_| {
                    (start..start + session.buffer_size as u64)
                        .map(|n| self.port_value(n, rate))
                        .collect()
                })
                .collect(),
            status: vec![0; session.n_channels],
            local_timestamp_ns: self.timestamp_ns,
        };

        self.sample_clock += session.buffer_size as u64;
        // timestamps advance at the achieved rate, not the nominal one
        let achieved = rate * self.rate_scale;
        self.timestamp_ns += (session.buffer_size as f64 / achieved * 1e9) as i64;

        trace!(samples = session.buffer_size, "simulated chunk");
        if let Some(sink) = &self.sink {
            sink.push_chunk(chunk);
        }
        Ok(())
    }

    fn rapid_block_data(
        &mut self,
        offset: usize,
        nsamples: usize,
        waveform_idx: u32,
    ) -> DriverResult<RapidBlockChunk> {
        let session = self.session()?.clone();
        let waveform = self.waveforms.get(waveform_idx as usize).ok_or_else(|| {
            DriverFault::new(-3, format!("no captured waveform {waveform_idx}"))
        })?;

        let slice = |data: &Vec<f32>| -> DriverResult<Vec<f32>> {
            data.get(offset..offset + nsamples)
                .map(<[f32]>::to_vec)
                .ok_or_else(|| DriverFault::new(-4, "read beyond captured waveform"))
        };

        Ok(RapidBlockChunk {
            ai: waveform
                .ai
                .iter()
                .map(&slice)
                .collect::<DriverResult<Vec<_>>>()?,
            ai_errors: waveform
                .ai
                .iter()
                .map(|_| vec![(self.amplitude / 256.0) as f32; nsamples])
                .collect(),
            ports: waveform
                .ports
                .iter()
                .map(|data| {
                    data.get(offset..offset + nsamples)
                        .map(<[u8]>::to_vec)
                        .ok_or_else(|| DriverFault::new(-4, "read beyond captured waveform"))
                })
                .collect::<DriverResult<Vec<_>>>()?,
            status: vec![0; session.n_channels],
        })
    }
}
