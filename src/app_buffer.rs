//! Application-side chunk buffer between the driver callback and the work
//! loop.
//!
//! The driver callback runs on the sampling path and must never block, so
//! the buffer is a bounded queue that drops its oldest chunk on overflow and
//! counts the loss instead of stalling the producer. The consumer learns
//! about drops through the lost count returned by [`AppBuffer::pop`].
//!
//! # Architecture
//!
//! ```text
//! driver callback ──push──► [chunk][chunk][chunk][chunk] ──pop──► work loop
//!                            oldest dropped when full,
//!                            lost counter incremented
//! ```
//!
//! The buffer doubles as the worker's wakeup point: [`AppBuffer::wait_data_ready`]
//! blocks until a chunk is queued or an error condition is posted with
//! [`AppBuffer::notify_data_ready`]. Error conditions are sticky (a watchdog
//! trip or stop request stays visible until cleared at the next arm), so a
//! worker re-entering the wait cannot miss one.

use crate::error::DigitizerError;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use tracing::debug;

/// One fixed-size slice of samples for all enabled channels and ports,
/// produced atomically by the driver callback.
///
/// Sample and error vectors hold one entry per enabled analog channel, in
/// channel order; port vectors one entry per enabled port. All vectors in a
/// chunk have the same length. `status` is indexed by hardware channel
/// number, enabled or not.
#[derive(Debug, Clone, Default)]
pub struct ChunkRecord {
    pub ai: Vec<Vec<f32>>,
    pub ai_errors: Vec<Vec<f32>>,
    pub ports: Vec<Vec<u8>>,
    pub status: Vec<u32>,
    /// Nanoseconds since the UNIX epoch, stamped at the driver callback.
    pub local_timestamp_ns: i64,
}

impl ChunkRecord {
    /// Samples per channel in this chunk.
    pub fn len(&self) -> usize {
        self.ai
            .first()
            .map(Vec::len)
            .or_else(|| self.ports.first().map(Vec::len))
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Default)]
struct Inner {
    queue: VecDeque<ChunkRecord>,
    capacity: usize,
    nai: usize,
    ndi: usize,
    buffer_size: usize,
    /// Chunks dropped since the last successful pop.
    lost: u64,
    /// Sticky error condition; cleared by `notify_data_ready(None)`.
    error: Option<DigitizerError>,
}

/// Bounded multi-producer/single-consumer queue of N-channel chunks.
#[derive(Debug, Default)]
pub struct AppBuffer {
    inner: Mutex<Inner>,
    data_ready: Condvar,
}

impl AppBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// (Re)shape the buffer for a session: `nai`/`ndi` enabled channel and
    /// port counts, `buffer_size` samples per chunk, `nr_buffers` capacity.
    /// Any in-flight chunks and loss accounting are discarded; idempotent
    /// across configure calls.
    pub fn initialize(&self, nai: usize, ndi: usize, buffer_size: usize, nr_buffers: usize) {
        let mut inner = self.inner.lock();
        inner.queue.clear();
        inner.capacity = nr_buffers;
        inner.nai = nai;
        inner.ndi = ndi;
        inner.buffer_size = buffer_size;
        inner.lost = 0;
        inner.error = None;
    }

    /// Queue one chunk from the driver callback. Never blocks: when the
    /// queue is full the oldest chunk is dropped and the lost counter
    /// incremented.
    pub fn push(&self, chunk: ChunkRecord) {
        let mut inner = self.inner.lock();
        debug_assert_eq!(chunk.ai.len(), inner.nai, "chunk channel count");
        debug_assert_eq!(chunk.ports.len(), inner.ndi, "chunk port count");
        debug_assert!(
            chunk.is_empty() || chunk.len() == inner.buffer_size,
            "chunk length must match the configured buffer size"
        );
        if inner.capacity == 0 {
            // not initialized for a session; nothing can be delivered
            inner.lost += 1;
            return;
        }
        if inner.queue.len() == inner.capacity {
            inner.queue.pop_front();
            inner.lost += 1;
            debug!(lost = inner.lost, "application buffer full, dropped oldest chunk");
        }
        inner.queue.push_back(chunk);
        drop(inner);
        self.data_ready.notify_one();
    }

    /// Dequeue the oldest chunk, returning it together with the number of
    /// chunks lost since the previous successful pop. Non-blocking; pair
    /// with [`wait_data_ready`](Self::wait_data_ready).
    pub fn pop(&self) -> Option<(ChunkRecord, u64)> {
        let mut inner = self.inner.lock();
        let chunk = inner.queue.pop_front()?;
        let lost = std::mem::take(&mut inner.lost);
        Some((chunk, lost))
    }

    /// Block until a chunk is available or an error condition is posted.
    ///
    /// Error conditions take precedence over queued data and remain set
    /// until cleared, so the worker observes a watchdog or stop exactly when
    /// it next looks.
    pub fn wait_data_ready(&self) -> Result<(), DigitizerError> {
        let mut inner = self.inner.lock();
        loop {
            if let Some(error) = inner.error.clone() {
                return Err(error);
            }
            if !inner.queue.is_empty() {
                return Ok(());
            }
            self.data_ready.wait(&mut inner);
        }
    }

    /// Post an error condition (`Some`) or clear it (`None`), waking any
    /// blocked consumer either way.
    pub fn notify_data_ready(&self, error: Option<DigitizerError>) {
        let mut inner = self.inner.lock();
        inner.error = error;
        drop(inner);
        self.data_ready.notify_all();
    }

    /// Chunks currently queued.
    pub fn len(&self) -> usize {
        self.inner.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().queue.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.inner.lock().capacity
    }
}
