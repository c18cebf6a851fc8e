//! Dedicated poll thread driving streaming acquisition.
//!
//! The poller periodically calls `driver.poll()` while armed and checks the
//! sample-rate watchdog after every poll. It is controlled through a small
//! state handshake rather than being torn down between arms:
//!
//! ```text
//!   Idle ──transit_to_running──► Running
//!    ▲                             │
//!    └───── PendIdle ◄─────transit_to_idle
//!                 PendExit ──► Exit (thread returns)
//! ```
//!
//! `transit_to_idle` blocks the caller until the poller has acknowledged the
//! transition, which guarantees no poll is in flight once `disarm` proceeds
//! to the driver. Shutdown waits up to five seconds for the acknowledgement
//! before joining regardless.

use crate::app_buffer::AppBuffer;
use crate::driver::DigitizerDriver;
use crate::error::DigitizerError;
use crate::estimator::RateMonitor;
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

/// Watchdog trips when the estimated rate falls below this fraction of the
/// nominal rate.
pub const WATCHDOG_RATE_THRESHOLD: f64 = 0.9;

/// Poller states; `Pend*` are requests acknowledged by the poll thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PollerState {
    Idle,
    Running,
    PendIdle,
    PendExit,
    Exit,
}

#[derive(Debug)]
pub(crate) struct PollerControl {
    state: Mutex<PollerState>,
    cv: Condvar,
}

/// Shared context the poll thread needs.
pub(crate) struct PollerContext {
    pub driver: Arc<Mutex<Box<dyn DigitizerDriver>>>,
    pub buffer: Arc<AppBuffer>,
    pub monitor: Arc<Mutex<RateMonitor>>,
    /// Bit pattern of the f64 nominal sample rate the user requested; set
    /// by `set_samp_rate` only, never by the driver's configure report.
    pub nominal_rate_bits: Arc<AtomicU64>,
    pub poll_period: Duration,
}

/// Handle owning the poll thread.
pub(crate) struct Poller {
    control: Arc<PollerControl>,
    thread: Option<JoinHandle<()>>,
}

impl Poller {
    /// Spawn the poll thread in the Idle state.
    pub fn spawn(ctx: PollerContext) -> std::io::Result<Self> {
        let control = Arc::new(PollerControl {
            state: Mutex::new(PollerState::Idle),
            cv: Condvar::new(),
        });
        let thread_control = Arc::clone(&control);
        let thread = std::thread::Builder::new()
            .name("digitizer-poller".into())
            .spawn(move || poll_loop(ctx, thread_control))?;
        Ok(Self {
            control,
            thread: Some(thread),
        })
    }

    pub fn transit_to_running(&self) {
        let mut state = self.control.state.lock();
        *state = PollerState::Running;
        drop(state);
        self.control.cv.notify_all();
    }

    /// Request Idle and block until the poll thread acknowledges, so no poll
    /// is in flight when this returns.
    pub fn transit_to_idle(&self) {
        let mut state = self.control.state.lock();
        if *state == PollerState::Exit {
            return;
        }
        *state = PollerState::PendIdle;
        self.control.cv.notify_all();
        while *state != PollerState::Idle {
            self.control.cv.wait(&mut state);
        }
    }

    /// Request exit, wait up to five seconds for the acknowledgement, then
    /// join the thread either way.
    pub fn stop(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };
        {
            let mut state = self.control.state.lock();
            *state = PollerState::PendExit;
            self.control.cv.notify_all();
            let deadline = Instant::now() + Duration::from_secs(5);
            while *state != PollerState::Exit {
                if self.control.cv.wait_until(&mut state, deadline).timed_out() {
                    warn!("poller did not acknowledge exit within deadline");
                    break;
                }
            }
        }
        if thread.join().is_err() {
            error!("poller thread panicked");
        }
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        self.stop();
    }
}

fn poll_loop(ctx: PollerContext, control: Arc<PollerControl>) {
    // refresh the state only every few iterations to keep lock traffic off
    // the sampling path
    const CHECK_EVERY_N: u32 = 10;
    let mut check_counter = CHECK_EVERY_N;
    let mut state = PollerState::Idle;

    debug!(poll_period_us = ctx.poll_period.as_micros() as u64, "poller started");

    loop {
        check_counter += 1;
        if check_counter >= CHECK_EVERY_N {
            state = *control.state.lock();
            check_counter = 0;
        }

        match state {
            PollerState::Running => {
                let poll_start = Instant::now();
                let result = ctx.driver.lock().poll();
                if let Err(fault) = result {
                    error!(%fault, "poll failed");
                    // the worker reacts to the error and re-arms if needed
                    ctx.buffer
                        .notify_data_ready(Some(DigitizerError::PollFailed(fault)));
                }

                let estimated = ctx.monitor.lock().average();
                let nominal = f64::from_bits(ctx.nominal_rate_bits.load(Ordering::Relaxed));
                if estimated < nominal * WATCHDOG_RATE_THRESHOLD {
                    error!(
                        estimated_hz = estimated,
                        nominal_hz = nominal,
                        "watchdog: estimated sample rate below threshold"
                    );
                    ctx.buffer.notify_data_ready(Some(DigitizerError::Watchdog));
                }

                let elapsed = poll_start.elapsed();
                if let Some(remaining) = ctx.poll_period.checked_sub(elapsed) {
                    // interruptible sleep: a state transition wakes the
                    // poller before the next poll slot
                    let mut guard = control.state.lock();
                    if *guard == PollerState::Running {
                        let _ = control.cv.wait_for(&mut guard, remaining);
                    }
                    state = *guard;
                    check_counter = 0;
                }
            }
            PollerState::PendIdle => {
                let mut guard = control.state.lock();
                *guard = PollerState::Idle;
                state = PollerState::Idle;
                drop(guard);
                control.cv.notify_all();
            }
            PollerState::PendExit => {
                let mut guard = control.state.lock();
                *guard = PollerState::Exit;
                drop(guard);
                control.cv.notify_all();
                debug!("poller exiting");
                return;
            }
            PollerState::Idle | PollerState::Exit => {
                std::thread::sleep(Duration::from_micros(100));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{
        AcquisitionSink, DriverResult, DriverSetup, DriverReport, RapidBlockChunk,
    };
    use std::sync::atomic::AtomicUsize;

    struct CountingDriver {
        polls: Arc<AtomicUsize>,
    }

    impl DigitizerDriver for CountingDriver {
        fn initialize(&mut self) -> DriverResult<()> {
            Ok(())
        }
        fn configure(
            &mut self,
            _setup: &DriverSetup<'_>,
            _sink: AcquisitionSink,
        ) -> DriverResult<DriverReport> {
            Ok(DriverReport {
                actual_sample_rate: 1.0,
                actual_ranges: Vec::new(),
            })
        }
        fn arm(&mut self) -> DriverResult<()> {
            Ok(())
        }
        fn disarm(&mut self) -> DriverResult<()> {
            Ok(())
        }
        fn close(&mut self) -> DriverResult<()> {
            Ok(())
        }
        fn poll(&mut self) -> DriverResult<()> {
            self.polls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        fn rapid_block_data(
            &mut self,
            _offset: usize,
            _nsamples: usize,
            _waveform_idx: u32,
        ) -> DriverResult<RapidBlockChunk> {
            Ok(RapidBlockChunk::default())
        }
    }

    fn test_context(polls: Arc<AtomicUsize>) -> PollerContext {
        let monitor = Arc::new(Mutex::new(RateMonitor::new(16)));
        // seed well above any nominal rate so the watchdog stays quiet
        monitor.lock().seed(1.0);
        PollerContext {
            driver: Arc::new(Mutex::new(
                Box::new(CountingDriver { polls }) as Box<dyn DigitizerDriver>
            )),
            buffer: Arc::new(AppBuffer::new()),
            monitor,
            nominal_rate_bits: Arc::new(AtomicU64::new(1.0f64.to_bits())),
            poll_period: Duration::from_millis(1),
        }
    }

    #[test]
    fn test_idle_poller_does_not_poll() {
        let polls = Arc::new(AtomicUsize::new(0));
        let mut poller = Poller::spawn(test_context(Arc::clone(&polls))).unwrap();
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(polls.load(Ordering::SeqCst), 0);
        poller.stop();
    }

    #[test]
    fn test_running_polls_then_idles() {
        let polls = Arc::new(AtomicUsize::new(0));
        let mut poller = Poller::spawn(test_context(Arc::clone(&polls))).unwrap();

        poller.transit_to_running();
        std::thread::sleep(Duration::from_millis(50));
        poller.transit_to_idle();
        let after_idle = polls.load(Ordering::SeqCst);
        assert!(after_idle > 0);

        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(polls.load(Ordering::SeqCst), after_idle);

        poller.stop();
    }

    #[test]
    fn test_watchdog_posts_on_low_rate() {
        let polls = Arc::new(AtomicUsize::new(0));
        let ctx = test_context(Arc::clone(&polls));
        let buffer = Arc::clone(&ctx.buffer);
        // estimated rate 1.0 vs nominal 100.0 -> below threshold
        ctx.nominal_rate_bits
            .store(100.0f64.to_bits(), Ordering::Relaxed);

        let mut poller = Poller::spawn(ctx).unwrap();
        poller.transit_to_running();

        assert_eq!(buffer.wait_data_ready(), Err(DigitizerError::Watchdog));
        poller.stop();
    }
}
