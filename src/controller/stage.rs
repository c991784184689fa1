//! Motorized linear stage controller.
//!
//! ASCII axis protocol in the Newport style: commands are prefixed with the
//! 1-indexed axis number (`1PA12.5` move absolute, `1TP?` read position,
//! `1MD?` motion done). Every command receives a single reply line; `ERR …`
//! replies are rejections.

use crate::channel::BoxedChannel;
use crate::controller::{
    check_rejected, io_to_device, unsupported, DeviceCommand, DeviceController, DeviceResponse,
    Telemetry,
};
use crate::error::{DeviceError, IoError};
use async_trait::async_trait;
use tracing::debug;

/// Soft travel limits for one axis (mm).
#[derive(Debug, Clone)]
pub struct TravelLimits {
    /// Lower soft limit.
    pub min_position: f64,
    /// Upper soft limit.
    pub max_position: f64,
}

impl Default for TravelLimits {
    fn default() -> Self {
        Self {
            min_position: 0.0,
            max_position: 300.0,
        }
    }
}

/// Controller for a single-axis motorized translation stage.
pub struct StageController {
    channel: BoxedChannel,
    axis: u8,
    limits: TravelLimits,
}

impl StageController {
    /// Create a controller for the given 1-indexed axis with default limits.
    pub fn new(channel: BoxedChannel) -> Self {
        Self::with_limits(channel, 1, TravelLimits::default())
    }

    /// Create a controller with explicit axis number and travel limits.
    pub fn with_limits(channel: BoxedChannel, axis: u8, limits: TravelLimits) -> Self {
        Self { channel, axis, limits }
    }

    fn check_limits(&self, target: f64) -> Result<(), DeviceError> {
        if target < self.limits.min_position || target > self.limits.max_position {
            return Err(DeviceError::Rejected(format!(
                "target {} outside travel limits [{}, {}]",
                target, self.limits.min_position, self.limits.max_position
            )));
        }
        Ok(())
    }

    async fn command(&mut self, cmd: String) -> Result<(), DeviceError> {
        let reply = self.channel.query(&cmd).await.map_err(io_to_device)?;
        check_rejected(&reply)?;
        Ok(())
    }

    async fn read_position(&mut self) -> Result<f64, DeviceError> {
        let cmd = format!("{}TP?", self.axis);
        let reply = self.channel.query(&cmd).await.map_err(io_to_device)?;
        let reply = check_rejected(&reply)?;
        reply
            .trim()
            .parse()
            .map_err(|_| DeviceError::Malformed(format!("position reply '{}'", reply)))
    }

    async fn motion_done(&mut self) -> Result<bool, DeviceError> {
        let cmd = format!("{}MD?", self.axis);
        let reply = self.channel.query(&cmd).await.map_err(io_to_device)?;
        match check_rejected(&reply)?.trim() {
            "0" => Ok(false),
            "1" => Ok(true),
            other => Err(DeviceError::Malformed(format!("motion-done reply '{}'", other))),
        }
    }
}

#[async_trait]
impl DeviceController for StageController {
    async fn probe(&mut self) -> Result<bool, IoError> {
        match self.channel.query(&format!("{}VE?", self.axis)).await {
            Ok(reply) => Ok(!reply.is_empty()),
            Err(IoError::Timeout) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn execute(&mut self, cmd: &DeviceCommand) -> Result<DeviceResponse, DeviceError> {
        match cmd {
            DeviceCommand::MoveAbsolute(target) => {
                self.check_limits(*target)?;
                self.command(format!("{}PA{:.4}", self.axis, target)).await?;
                debug!(axis = self.axis, target, "stage moving to absolute position");
                Ok(DeviceResponse::Ack)
            }
            DeviceCommand::MoveRelative(delta) => {
                let current = self.read_position().await?;
                self.check_limits(current + delta)?;
                self.command(format!("{}PR{:.4}", self.axis, delta)).await?;
                debug!(axis = self.axis, delta, "stage moving relative");
                Ok(DeviceResponse::Ack)
            }
            DeviceCommand::StopMotion => {
                self.command(format!("{}ST", self.axis)).await?;
                Ok(DeviceResponse::Ack)
            }
            DeviceCommand::ReadPosition => Ok(DeviceResponse::Position(self.read_position().await?)),
            DeviceCommand::QueryMoving => Ok(DeviceResponse::Moving(!self.motion_done().await?)),
            other => Err(unsupported(other)),
        }
    }

    async fn poll_status(&mut self) -> Result<Telemetry, DeviceError> {
        let position = self.read_position().await?;
        let moving = !self.motion_done().await?;
        Ok(Telemetry::Motion { position, moving })
    }

    async fn close(&mut self) {
        self.channel.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::MockChannel;

    fn stage(channel: MockChannel) -> StageController {
        StageController::new(Box::new(channel))
    }

    #[tokio::test]
    async fn test_move_absolute_encodes_axis_prefix() {
        let channel = MockChannel::new();
        let mut controller = stage(channel.clone());

        let response = controller
            .execute(&DeviceCommand::MoveAbsolute(12.5))
            .await
            .unwrap();

        assert_eq!(response, DeviceResponse::Ack);
        assert_eq!(channel.sent(), vec!["1PA12.5000".to_string()]);
    }

    #[tokio::test]
    async fn test_move_outside_limits_is_rejected_without_io() {
        let channel = MockChannel::new();
        let mut controller = stage(channel.clone());

        let err = controller
            .execute(&DeviceCommand::MoveAbsolute(500.0))
            .await
            .unwrap_err();

        assert!(matches!(err, DeviceError::Rejected(_)));
        assert_eq!(channel.sent_count(), 0);
    }

    #[tokio::test]
    async fn test_malformed_position_reply() {
        let channel = MockChannel::new().with_reply("1TP?", "garbage");
        let mut controller = stage(channel);

        let err = controller.execute(&DeviceCommand::ReadPosition).await.unwrap_err();
        assert!(matches!(err, DeviceError::Malformed(_)));
    }

    #[tokio::test]
    async fn test_device_rejection_is_surfaced() {
        let channel = MockChannel::new().with_reply("1ST", "ERR 26");
        let mut controller = stage(channel);

        let err = controller.execute(&DeviceCommand::StopMotion).await.unwrap_err();
        assert_eq!(err, DeviceError::Rejected("ERR 26".to_string()));
    }

    #[tokio::test]
    async fn test_poll_status_reads_position_and_motion() {
        let channel = MockChannel::new()
            .with_reply("1TP?", "42.0")
            .with_reply("1MD?", "1");
        let mut controller = stage(channel);

        let telemetry = controller.poll_status().await.unwrap();
        assert_eq!(
            telemetry,
            Telemetry::Motion {
                position: 42.0,
                moving: false
            }
        );
    }

    #[tokio::test]
    async fn test_probe_timeout_means_absent() {
        let channel = MockChannel::new();
        channel.push_failure(crate::error::IoError::Timeout);
        let mut controller = stage(channel);

        assert_eq!(controller.probe().await, Ok(false));
    }

    #[tokio::test]
    async fn test_foreign_command_is_unsupported() {
        let channel = MockChannel::new();
        let mut controller = stage(channel.clone());

        let err = controller.execute(&DeviceCommand::AcquireFrame).await.unwrap_err();
        assert!(matches!(err, DeviceError::Rejected(_)));
        assert_eq!(channel.sent_count(), 0);
    }
}
