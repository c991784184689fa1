//! Device-orchestration core for the lab metrology and assembly setups.
//!
//! Wraps each physical instrument (motorized stage, still camera, vacuum
//! relay card, laser distance head) in a [`model::DeviceModel`]: a worker
//! task owning the device's transport, exposing an OFF → INITIALIZING →
//! READY lifecycle, serializing commands and telemetry polling, and
//! publishing change notifications. A [`sequence::SequenceCoordinator`]
//! drives operator-authored schedules (SET, REF, DEFO, SLEEP, …) against
//! those models with the cross-device ordering a measurement run needs.
//!
//! Layers, bottom up: [`channel`] (byte transport), [`controller`] (device
//! protocol), [`model`] (lifecycle + worker), [`sequence`] (automation).

pub mod channel;
pub mod config;
pub mod controller;
pub mod error;
pub mod model;
pub mod sequence;

pub use config::Settings;
pub use controller::{DeviceCommand, DeviceController, DeviceResponse, FrameHandle, Telemetry};
pub use error::{DeviceError, IoError, SequenceError};
pub use model::{DeviceEvent, DeviceModel, DeviceState};
pub use sequence::{Schedule, ScheduleAction, SequenceCoordinator, SequenceDevices, SequenceEvent};
