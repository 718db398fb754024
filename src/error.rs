//! Error taxonomy for capture, buffer and control operations

use std::io;

use thiserror::Error;

use crate::capture::controls::ControlId;

/// Result type for capture operations.
pub type Result<T> = std::result::Result<T, CaptureError>;

#[derive(Debug, Error)]
pub enum CaptureError {
    /// The node could not be opened, is not a streaming capture device, or went away.
    #[error("device {path} unavailable: {reason}")]
    DeviceUnavailable { path: String, reason: String },

    #[error("format unsupported: {0}")]
    FormatUnsupported(String),

    /// The pool is empty again when this is returned.
    #[error("failed to allocate {requested} capture buffers: {reason}")]
    BufferAllocationFailed { requested: u32, reason: String },

    #[error("failed to start streaming: {0}")]
    StreamStartFailed(#[source] io::Error),

    #[error("timed out waiting for a frame")]
    Timeout,

    #[error("no frame ready")]
    WouldBlock,

    /// A blocking wait was cancelled by `interrupt()` or `close()`.
    #[error("wait for frame interrupted")]
    Interrupted,

    #[error("control {0} is not supported by the device")]
    ControlUnsupported(ControlId),

    #[error("value {value} out of range for control {id} ({minimum}..={maximum})")]
    ControlValueOutOfRange {
        id: ControlId,
        value: i64,
        minimum: i64,
        maximum: i64,
    },

    #[error("register 0x{address:x} access failed: {source}")]
    RegisterAccessFailed {
        address: u64,
        #[source]
        source: io::Error,
    },

    #[error("invalid state: {0}")]
    InvalidState(&'static str),

    #[error("ioctl failed: {0}")]
    Io(#[from] io::Error),
}

impl CaptureError {
    /// `Timeout` and `WouldBlock` mean "no frame yet"; the caller decides whether to retry.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout | Self::WouldBlock)
    }

    /// The device is gone; the handle should be closed and optionally reopened.
    pub fn is_device_lost(&self) -> bool {
        matches!(self, Self::DeviceUnavailable { .. })
    }
}

/// errno values the kernel uses once a device node has been disconnected.
pub(crate) fn is_disconnect(err: &io::Error) -> bool {
    matches!(
        err.raw_os_error(),
        Some(libc::ENODEV) | Some(libc::ENXIO) | Some(libc::ESHUTDOWN)
    )
}

/// Map a kernel error to `DeviceUnavailable` when it signals disconnection,
/// otherwise to the operation-specific error built by `otherwise`.
pub(crate) fn classify(
    path: &str,
    err: io::Error,
    otherwise: impl FnOnce(io::Error) -> CaptureError,
) -> CaptureError {
    if is_disconnect(&err) {
        CaptureError::DeviceUnavailable {
            path: path.to_owned(),
            reason: err.to_string(),
        }
    } else {
        otherwise(err)
    }
}
