//! Still camera controller.
//!
//! The camera is driven through an opaque vendor bridge speaking an ASCII
//! line protocol: `IDN?` identifies the device, `SNAP` acquires one frame and
//! replies `FRAME <id>`, `TEMP?` reports the sensor temperature. Pixel data
//! never crosses this interface; callers receive a [`FrameHandle`] token and
//! resolve it out of band.

use crate::channel::BoxedChannel;
use crate::controller::{
    check_rejected, io_to_device, unsupported, DeviceCommand, DeviceController, DeviceResponse,
    FrameHandle, Telemetry,
};
use crate::error::{DeviceError, IoError};
use async_trait::async_trait;
use chrono::Utc;
use tracing::debug;

/// Controller for the still camera.
pub struct CameraController {
    channel: BoxedChannel,
}

impl CameraController {
    /// Create a camera controller over the given channel.
    pub fn new(channel: BoxedChannel) -> Self {
        Self { channel }
    }

    async fn acquire(&mut self) -> Result<FrameHandle, DeviceError> {
        let reply = self.channel.query("SNAP").await.map_err(io_to_device)?;
        let reply = check_rejected(&reply)?;
        let id = reply
            .trim()
            .strip_prefix("FRAME ")
            .and_then(|id| id.parse().ok())
            .ok_or_else(|| DeviceError::Malformed(format!("acquire reply '{}'", reply)))?;

        debug!(frame = id, "frame acquired");
        Ok(FrameHandle {
            id,
            acquired_at: Utc::now(),
        })
    }
}

#[async_trait]
impl DeviceController for CameraController {
    async fn probe(&mut self) -> Result<bool, IoError> {
        match self.channel.query("IDN?").await {
            Ok(reply) => Ok(!reply.is_empty()),
            Err(IoError::Timeout) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn execute(&mut self, cmd: &DeviceCommand) -> Result<DeviceResponse, DeviceError> {
        match cmd {
            DeviceCommand::AcquireFrame => Ok(DeviceResponse::Frame(self.acquire().await?)),
            other => Err(unsupported(other)),
        }
    }

    async fn poll_status(&mut self) -> Result<Telemetry, DeviceError> {
        let reply = self.channel.query("TEMP?").await.map_err(io_to_device)?;
        let reply = check_rejected(&reply)?;
        let temperature_c = reply
            .trim()
            .parse()
            .map_err(|_| DeviceError::Malformed(format!("temperature reply '{}'", reply)))?;
        Ok(Telemetry::Camera { temperature_c })
    }

    async fn close(&mut self) {
        self.channel.close().await;
    }
}
