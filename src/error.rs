//! Error types for the acquisition block.
//!
//! Two layers are distinguished: [`DriverFault`] is what a concrete device
//! reports (an opaque code plus a message), while [`DigitizerError`] is the
//! block-level taxonomy consumed by the work loop and by clients. Driver
//! faults are always wrapped in the block-level variant naming the operation
//! that failed, so a client can tell an arm failure from a poll failure
//! without knowing anything about the device family.
//!
//! The block also keeps a bounded, lossy [`ErrorLog`] of recent errors that
//! clients can inspect after the fact; see [`DigitizerBlock::get_errors`].
//!
//! [`DigitizerBlock::get_errors`]: crate::block::DigitizerBlock::get_errors

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::VecDeque;
use thiserror::Error;

/// Result type alias for block operations.
pub type Result<T> = std::result::Result<T, DigitizerError>;

/// Fault reported by a concrete device driver.
///
/// The code is driver-specific (e.g. a vendor SDK status value); the message
/// is expected to be human-readable.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message} (driver code {code})")]
pub struct DriverFault {
    pub code: i32,
    pub message: String,
}

impl DriverFault {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Errors raised by the acquisition block.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DigitizerError {
    /// A blocking wait was cancelled.
    #[error("wait interrupted")]
    Interrupted,

    /// Shutdown was requested; surfaced once to unblock waiting workers.
    #[error("stop requested")]
    Stopped,

    /// Estimated sample rate fell below the watchdog threshold.
    #[error("watchdog: estimated sample rate below threshold")]
    Watchdog,

    #[error("initialize failed: {0}")]
    InitializeFailed(#[source] DriverFault),

    #[error("configure failed: {0}")]
    ConfigureFailed(#[source] DriverFault),

    #[error("arm failed: {0}")]
    ArmFailed(#[source] DriverFault),

    #[error("disarm failed: {0}")]
    DisarmFailed(#[source] DriverFault),

    #[error("close failed: {0}")]
    CloseFailed(#[source] DriverFault),

    #[error("poll failed: {0}")]
    PollFailed(#[source] DriverFault),

    #[error("read failed: {0}")]
    ReadFailed(#[source] DriverFault),

    /// Caller-side contract violation.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Operation called in the wrong lifecycle state.
    #[error("invalid state: {0}")]
    InvalidState(String),
}

/// Broad origin of an error: the device driver or the block itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Driver,
    Internal,
}

impl DigitizerError {
    /// Whether the error wraps a device-reported fault or originated in the
    /// block.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::InitializeFailed(_)
            | Self::ConfigureFailed(_)
            | Self::ArmFailed(_)
            | Self::DisarmFailed(_)
            | Self::CloseFailed(_)
            | Self::PollFailed(_)
            | Self::ReadFailed(_) => ErrorCategory::Driver,
            _ => ErrorCategory::Internal,
        }
    }
}

/// One timestamped entry in the error log.
#[derive(Debug, Clone)]
pub struct ErrorEntry {
    pub timestamp: DateTime<Utc>,
    pub error: DigitizerError,
}

/// Bounded, lossy ring of recent errors.
///
/// Pushing past capacity drops the oldest entry. The log is internally
/// synchronized so any thread holding a reference may record errors.
#[derive(Debug)]
pub struct ErrorLog {
    capacity: usize,
    entries: Mutex<VecDeque<ErrorEntry>>,
}

impl ErrorLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    pub fn push(&self, error: DigitizerError) {
        let mut entries = self.entries.lock();
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back(ErrorEntry {
            timestamp: Utc::now(),
            error,
        });
    }

    /// Snapshot of the log in insertion order. Does not clear the log.
    pub fn snapshot(&self) -> Vec<ErrorEntry> {
        self.entries.lock().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}
