//! Error types for the device-orchestration core.
//!
//! Three taxonomies, matching the layer boundaries of the system:
//!
//! - [`IoError`]: transport-level failures raised by a [`crate::channel::DeviceChannel`].
//!   A timeout is reported distinctly from a lost connection so that callers can
//!   decide between retry and teardown.
//! - [`DeviceError`]: protocol-level failures raised by a device controller or by
//!   the owning device model. `NotReady` is the deterministic rejection returned
//!   by `submit()` when a model is not in the READY state; `Cancelled` is reported
//!   when a pending command is abandoned by disable/shutdown.
//! - [`SequenceError`]: logical failures of a scheduled automation run. These
//!   always halt the run; scheduled automation fails loud, never silently.
//!
//! Transport and protocol errors are translated into state transitions at the
//! device-model boundary and never cross the worker-task boundary as panics.

use thiserror::Error;

/// Transport-level error raised by a device channel.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IoError {
    /// The endpoint (serial port, USB device) does not exist.
    #[error("endpoint not found: {0}")]
    NotFound(String),

    /// The endpoint exists but cannot be opened by this process.
    #[error("permission denied opening endpoint: {0}")]
    PermissionDenied(String),

    /// No reply arrived within the bounded receive timeout.
    #[error("transport timeout")]
    Timeout,

    /// The connection is closed or the peer vanished mid-exchange.
    #[error("transport disconnected")]
    Disconnected,
}

/// Protocol-level error raised by a device controller or its owning model.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeviceError {
    /// The device replied, but the reply could not be decoded.
    #[error("malformed reply from device: {0}")]
    Malformed(String),

    /// The device returned an explicit error code for the command.
    #[error("command rejected by device: {0}")]
    Rejected(String),

    /// The device did not answer the command in time.
    #[error("device timed out")]
    Timeout,

    /// The model is not in the READY state; the command was not sent.
    #[error("device not ready")]
    NotReady,

    /// The pending command was abandoned by disable or shutdown.
    #[error("command cancelled")]
    Cancelled,

    /// Underlying transport failure.
    #[error(transparent)]
    Io(#[from] IoError),
}

/// Logical error that halts a running schedule.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SequenceError {
    /// An action was dispatched before its prerequisite succeeded
    /// (e.g. DEFO before any REF).
    #[error("{action} requires a prior successful {prerequisite}")]
    ActionWithoutPrerequisite {
        /// The action that was refused.
        action: String,
        /// The action that must have succeeded first.
        prerequisite: String,
    },

    /// A schedule entry could not be parsed or validated.
    #[error("invalid schedule entry at line {line}: {reason}")]
    InvalidScheduleEntry {
        /// 1-based line (or entry) number.
        line: usize,
        /// Human-readable parse/validation failure.
        reason: String,
    },

    /// The device needed by the current action is not READY.
    #[error("device '{0}' is not ready")]
    DeviceNotReady(String),

    /// A device failed while executing a scheduled action.
    #[error("device failure during scheduled action: {0}")]
    Device(#[from] DeviceError),

    /// Schedule file or image file I/O failure.
    #[error("schedule i/o error: {0}")]
    Io(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_display() {
        let err = IoError::NotFound("/dev/ttyUSB7".into());
        assert_eq!(err.to_string(), "endpoint not found: /dev/ttyUSB7");
        assert_ne!(IoError::Timeout, IoError::Disconnected);
    }

    #[test]
    fn test_device_error_from_io() {
        let err: DeviceError = IoError::Disconnected.into();
        assert_eq!(err, DeviceError::Io(IoError::Disconnected));
    }

    #[test]
    fn test_sequence_error_display() {
        let err = SequenceError::ActionWithoutPrerequisite {
            action: "DEFO".into(),
            prerequisite: "REF".into(),
        };
        assert_eq!(err.to_string(), "DEFO requires a prior successful REF");
    }
}
