//! Transport channels to physical devices.
//!
//! A [`DeviceChannel`] is a half-duplex request/response byte channel to a
//! single serial/USB endpoint. Controllers own exactly one channel and use it
//! for their device's command protocol; the channel knows nothing about that
//! protocol, only about framing bytes and ASCII lines.
//!
//! Two implementations:
//!
//! - [`serial::SerialChannel`]: RS-232/USB-serial over the `serialport` crate,
//!   with blocking I/O confined to `tokio::task::spawn_blocking` so the owning
//!   worker task is never parked on a file descriptor.
//! - [`mock::MockChannel`]: scripted in-memory channel for tests and the demo
//!   binary; records every line sent, in order.

pub mod mock;
#[cfg(feature = "instrument_serial")]
pub mod serial;

pub use mock::MockChannel;
#[cfg(feature = "instrument_serial")]
pub use serial::{SerialChannel, SerialSettings};

use crate::error::IoError;
use async_trait::async_trait;
use std::time::Duration;

/// Half-duplex byte transport to one physical device.
///
/// All methods take `&self`; implementations serialize access internally.
/// In practice a channel is only ever driven from its controller's worker
/// task, so there is a single writer by construction.
#[async_trait]
pub trait DeviceChannel: Send + Sync {
    /// Write raw bytes to the device.
    async fn send(&self, bytes: &[u8]) -> Result<(), IoError>;

    /// Read up to `max_len` bytes, waiting at most `timeout`.
    ///
    /// Fails with [`IoError::Timeout`] when nothing arrives in time and with
    /// [`IoError::Disconnected`] when the endpoint is closed or gone.
    async fn receive(&self, max_len: usize, timeout: Duration) -> Result<Vec<u8>, IoError>;

    /// Send one ASCII command line (terminator appended by the channel).
    async fn send_line(&self, line: &str) -> Result<(), IoError>;

    /// Send one ASCII command line and read the reply line, trimmed.
    async fn query(&self, line: &str) -> Result<String, IoError>;

    /// Release the underlying endpoint. Idempotent; safe to call twice.
    async fn close(&self);
}

/// Owned, type-erased channel as stored by controllers.
pub type BoxedChannel = Box<dyn DeviceChannel>;
