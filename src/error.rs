// SPDX-License-Identifier: GPL-3.0-or-later

//! Error types.
//!
//! [`OutputError`] is what every fallible operation on the compositor, its outputs,
//! framebuffers and the rendering context returns. [`DeviceError`] is produced at the
//! device boundary by [`DisplayDevice`][crate::backend::DisplayDevice] implementations
//! and gets mapped into an [`OutputError`] by the core.

use crate::backend::ConnectorId;

/// Why the device refused an operation for now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusyReason {
    /// The compositor is asleep and does not hold the device.
    Asleep,
    /// The device rejected a page flip, usually because one is still pending.
    FlipRejected,
}

impl std::fmt::Display for BusyReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BusyReason::Asleep => write!(f, "compositor is asleep"),
            BusyReason::FlipRejected => write!(f, "page flip rejected"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum OutputError {
    /// A foreign mode, a malformed parameter, or a drawing call with bad geometry.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// The output has no framebuffer, or the context is not current.
    #[error("not active")]
    NotActive,
    /// The output was activated again with the mode it is already running.
    #[error("output is already active with this mode")]
    AlreadyActive,
    /// The device or the context behind this object is gone or suspended.
    #[error("device unavailable")]
    DeviceUnavailable,
    /// The output was removed from its compositor. Only read accessors still work.
    #[error("output has been unbound from its compositor")]
    Unbound,
    /// A transient condition; retry later.
    #[error("device busy: {0}")]
    DeviceBusy(BusyReason),
    #[error("allocation failed: {0}")]
    Allocation(String),
    #[error("device I/O error: {0}")]
    DeviceIo(#[source] DeviceError),
}

impl OutputError {
    /// Returns `true` for conditions a caller is expected to shrug off and retry
    /// on the next frame.
    pub fn is_transient(&self) -> bool {
        matches!(self, OutputError::NotActive | OutputError::DeviceBusy(_))
    }
}

/// Errors reported by a [`DisplayDevice`][crate::backend::DisplayDevice].
#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("the device is busy")]
    Busy,
    #[error("unknown connector {0}")]
    UnknownConnector(ConnectorId),
    #[error("no crtc available for connector {0}")]
    NoCrtc(ConnectorId),
    #[error("failed to allocate scanout buffer: {0}")]
    Allocation(String),
}

impl From<DeviceError> for OutputError {
    fn from(err: DeviceError) -> Self {
        match err {
            DeviceError::Busy => OutputError::DeviceBusy(BusyReason::FlipRejected),
            DeviceError::Allocation(msg) => OutputError::Allocation(msg),
            DeviceError::NoCrtc(id) => OutputError::Allocation(format!("no crtc for {id}")),
            err => OutputError::DeviceIo(err),
        }
    }
}
