//! Digitizer acquisition block.
//!
//! This crate is the layer between a hardware sampling driver and a
//! downstream signal-processing pipeline. It accepts raw samples from a
//! device (analog channels plus digital input ports), arranges them in time,
//! detects software triggers, annotates the output with acquisition
//! metadata and hands it to consumers at a steady rate with defined failure
//! semantics.
//!
//! # Architecture
//!
//! ```text
//!             control surface                      work()
//!                  │                                 ▲
//!          ┌───────▼─────────────────────────────────┴──────┐
//!          │                DigitizerBlock                  │
//!          │  lifecycle FSM · trigger detector · error log  │
//!          └───────┬───────────────────────▲────────────────┘
//!             owns │                       │ chunks
//!          ┌───────▼────────┐   sink  ┌────┴───────┐
//!   poll ─►│ DigitizerDriver├────────►│ AppBuffer  │
//!  thread  └────────────────┘         └────────────┘
//! ```
//!
//! Two operating modes share one public contract:
//!
//! - **Streaming**: a dedicated poller thread advances the driver at a
//!   configurable period; the driver callback queues fixed-size chunks in a
//!   bounded [`AppBuffer`] (dropping the oldest on overflow, with loss
//!   accounting), and every [`DigitizerBlock::work`] call emits exactly one
//!   chunk per enabled stream together with `acq_info` tags and software
//!   trigger markers. A watchdog on the achieved sample rate forces a
//!   disarm/re-arm cycle when the device falls behind.
//! - **Rapid block**: the device captures a fixed number of discrete
//!   waveforms per arm; `work` waits for the captures-complete signal and
//!   reads each waveform out in two phases, tagging the first read with
//!   per-waveform `trigger_info` metadata.
//!
//! Concrete devices implement the [`DigitizerDriver`] capability trait; the
//! crate ships a hardware-free [`SimulatedDriver`] for tests and demos.
//!
//! # Example
//!
//! ```no_run
//! use daq_digitizer::{DigitizerBlock, SimulatedDriver, TriggerDirection, WorkOutput, WorkReturn};
//!
//! # fn main() -> daq_digitizer::Result<()> {
//! let driver = SimulatedDriver::builder().signal_frequency(1_000.0).build();
//! let mut block = DigitizerBlock::new(2, 1, Box::new(driver))?;
//!
//! block.set_samp_rate(1_000_000.0)?;
//! block.set_aichan("A", true, 5.0, true, 0.0)?;
//! block.set_aichan_trigger("A", TriggerDirection::Rising, 0.5)?;
//! block.set_buffer_size(1024)?;
//! block.set_nr_buffers(4)?;
//! block.set_streaming(0.01)?;
//! block.set_auto_arm(true);
//! assert!(block.start());
//!
//! let mut out = WorkOutput::new(2, 1);
//! for _ in 0..16 {
//!     match block.work(1024, &mut out)? {
//!         WorkReturn::Produced(n) => println!("{n} samples, {} tags", out.tags.len()),
//!         WorkReturn::Again => continue,
//!         WorkReturn::Done => break,
//!     }
//!     out.clear();
//! }
//! block.stop();
//! # Ok(())
//! # }
//! ```

pub mod app_buffer;
pub mod block;
pub mod config;
pub mod driver;
pub mod error;
pub mod estimator;
pub mod poller;
pub mod simulator;
pub mod tags;
pub mod trigger;

pub use app_buffer::{AppBuffer, ChunkRecord};
pub use block::{
    AnalogStream, BlockState, DigitizerBlock, PortStream, StopHandle, WorkOutput, WorkReturn,
};
pub use config::{
    AcquisitionConfig, AcquisitionMode, ChannelConfig, DownsamplingMode, PortConfig,
    TriggerConfig, TriggerDirection, TriggerSource, MAX_AI_CHANNELS, MAX_DI_PORTS,
};
pub use driver::{
    AcquisitionSink, DigitizerDriver, DriverReport, DriverResult, DriverSetup, RapidBlockChunk,
};
pub use error::{DigitizerError, DriverFault, ErrorCategory, ErrorEntry, ErrorLog, Result};
pub use estimator::{RateEstimator, RateMonitor};
pub use poller::WATCHDOG_RATE_THRESHOLD;
pub use simulator::{SimulatedDriver, SimulatedDriverBuilder};
pub use tags::{channel_status, AcqInfo, StreamTag, Tag, TriggerInfo};
pub use trigger::TriggerDetector;
