//! Per-device-family protocol controllers.
//!
//! A [`DeviceController`] encodes and decodes one device family's command
//! protocol over the [`crate::channel::DeviceChannel`] it owns. Controllers
//! know nothing about threading; serialization is provided by the owning
//! device model, which is the only caller.
//!
//! Families:
//!
//! - [`stage::StageController`] — motorized linear translation stage
//! - [`relay::RelayController`] — 8-channel vacuum relay card
//! - [`laser::LaserController`] — laser distance head
//! - [`camera::CameraController`] — still camera; frames stay opaque

pub mod camera;
pub mod laser;
pub mod relay;
pub mod stage;

pub use camera::CameraController;
pub use laser::LaserController;
pub use relay::RelayController;
pub use stage::StageController;

use crate::error::{DeviceError, IoError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Opaque handle to an acquired camera frame.
///
/// The core never interprets pixel data; downstream pattern-recognition
/// collaborators resolve the handle out of band.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameHandle {
    /// Device-assigned frame identifier.
    pub id: u64,
    /// Acquisition timestamp.
    pub acquired_at: DateTime<Utc>,
}

/// A request executable against a device controller.
///
/// One flat vocabulary across families; a controller rejects commands its
/// family does not implement.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceCommand {
    /// Move the stage to an absolute position (mm).
    MoveAbsolute(f64),
    /// Move the stage by a relative distance (mm).
    MoveRelative(f64),
    /// Stop stage motion immediately.
    StopMotion,
    /// Read the current stage position (mm).
    ReadPosition,
    /// Query whether the stage is still moving.
    QueryMoving,
    /// Drive relay output `channel` to `on`.
    SetOutput {
        /// Output channel, 0-7.
        channel: u8,
        /// Requested output level.
        on: bool,
    },
    /// Invert relay output `channel`.
    ToggleOutput {
        /// Output channel, 0-7.
        channel: u8,
    },
    /// Acquire one camera frame.
    AcquireFrame,
    /// Set the laser head sampling-rate mode.
    SetSamplingRate(u8),
    /// Set the laser head averaging mode.
    SetAveraging(u8),
    /// Read the laser measurement value.
    ReadValue,
}

/// Successful reply to a [`DeviceCommand`].
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceResponse {
    /// Command acknowledged, nothing to report.
    Ack,
    /// Stage position in mm.
    Position(f64),
    /// Whether the stage is still moving.
    Moving(bool),
    /// Resulting relay output level.
    OutputState {
        /// Output channel, 0-7.
        channel: u8,
        /// Output level after the command.
        on: bool,
    },
    /// Handle to the acquired frame.
    Frame(FrameHandle),
    /// Laser measurement value.
    Value(f64),
}

/// Immutable telemetry snapshot published by a device model.
#[derive(Debug, Clone, PartialEq)]
pub enum Telemetry {
    /// Stage position and motion flag.
    Motion {
        /// Position in mm.
        position: f64,
        /// Whether a move is still in progress.
        moving: bool,
    },
    /// Relay card output levels.
    Relay {
        /// Level of each of the 8 outputs.
        outputs: [bool; 8],
    },
    /// Laser distance reading.
    Laser {
        /// Measured value; the ±9999 sentinel means out of range.
        value: f64,
        /// Whether the target is inside the measurement range.
        in_range: bool,
    },
    /// Camera health reading.
    Camera {
        /// Sensor temperature in °C.
        temperature_c: f64,
    },
}

/// Protocol encoder/decoder for one device family.
///
/// `execute` has physical side effects (motion, relay switching) that are
/// irreversible from the caller's perspective once sent.
#[async_trait]
pub trait DeviceController: Send + 'static {
    /// Non-destructive liveness check used during INITIALIZING.
    ///
    /// A transport timeout means "device absent" (`Ok(false)`), not an error.
    async fn probe(&mut self) -> Result<bool, IoError>;

    /// One-time device setup after a successful probe.
    async fn init(&mut self) -> Result<(), DeviceError> {
        Ok(())
    }

    /// Execute one command against the device.
    async fn execute(&mut self, cmd: &DeviceCommand) -> Result<DeviceResponse, DeviceError>;

    /// Read the current telemetry snapshot.
    async fn poll_status(&mut self) -> Result<Telemetry, DeviceError>;

    /// Release the transport. Idempotent.
    async fn close(&mut self);
}

/// Translate a transport error into the protocol-level taxonomy.
///
/// A channel timeout surfaces as [`DeviceError::Timeout`]; everything else
/// stays a transport failure.
pub(crate) fn io_to_device(e: IoError) -> DeviceError {
    match e {
        IoError::Timeout => DeviceError::Timeout,
        other => DeviceError::Io(other),
    }
}

/// Shared reply convention for the ASCII line protocols: a reply starting
/// with "ERR" is an explicit rejection by the device.
pub(crate) fn check_rejected(reply: &str) -> Result<&str, DeviceError> {
    if reply.starts_with("ERR") {
        Err(DeviceError::Rejected(reply.to_string()))
    } else {
        Ok(reply)
    }
}

/// A command this controller's family does not implement.
pub(crate) fn unsupported(cmd: &DeviceCommand) -> DeviceError {
    DeviceError::Rejected(format!("unsupported command for this device family: {:?}", cmd))
}
