//! Laser distance head controller.
//!
//! Keyence-style ASCII protocol: `SR,<mode>` sets the sampling rate,
//! `SW,OA,<head>,<mode>` the averaging, `M<head>` reads the measurement
//! value. The head reports `9999` / `-9999` when the target is outside the
//! measurement range; that is a valid reading, not a protocol error.

use crate::channel::BoxedChannel;
use crate::controller::{
    check_rejected, io_to_device, unsupported, DeviceCommand, DeviceController, DeviceResponse,
    Telemetry,
};
use crate::error::{DeviceError, IoError};
use async_trait::async_trait;
use tracing::debug;

/// Out-of-range sentinel reported by the head.
pub const OUT_OF_RANGE: f64 = 9999.0;

/// Setup applied during initialization.
#[derive(Debug, Clone)]
pub struct LaserSetup {
    /// Measurement head number (head A = 2).
    pub head: u8,
    /// Sampling-rate mode applied on init.
    pub sampling_rate: u8,
    /// Averaging mode applied on init.
    pub averaging: u8,
}

impl Default for LaserSetup {
    fn default() -> Self {
        Self {
            head: 2,
            sampling_rate: 0,
            averaging: 0,
        }
    }
}

/// Controller for the laser distance head.
pub struct LaserController {
    channel: BoxedChannel,
    setup: LaserSetup,
}

impl LaserController {
    /// Create a laser controller with the default head setup.
    pub fn new(channel: BoxedChannel) -> Self {
        Self::with_setup(channel, LaserSetup::default())
    }

    /// Create a laser controller with an explicit head setup.
    pub fn with_setup(channel: BoxedChannel, setup: LaserSetup) -> Self {
        Self { channel, setup }
    }

    async fn set_sampling_rate(&mut self, mode: u8) -> Result<(), DeviceError> {
        let reply = self
            .channel
            .query(&format!("SR,{}", mode))
            .await
            .map_err(io_to_device)?;
        check_rejected(&reply)?;
        Ok(())
    }

    async fn set_averaging(&mut self, mode: u8) -> Result<(), DeviceError> {
        let reply = self
            .channel
            .query(&format!("SW,OA,{},{}", self.setup.head, mode))
            .await
            .map_err(io_to_device)?;
        check_rejected(&reply)?;
        Ok(())
    }

    async fn read_value(&mut self) -> Result<f64, DeviceError> {
        let cmd = format!("M{}", self.setup.head);
        let reply = self.channel.query(&cmd).await.map_err(io_to_device)?;
        let reply = check_rejected(&reply)?;
        reply
            .trim()
            .parse()
            .map_err(|_| DeviceError::Malformed(format!("measurement reply '{}'", reply)))
    }
}

/// Whether a measurement value is inside the head's range.
pub fn in_range(value: f64) -> bool {
    value.abs() < OUT_OF_RANGE
}

#[async_trait]
impl DeviceController for LaserController {
    async fn probe(&mut self) -> Result<bool, IoError> {
        match self.channel.query(&format!("M{}", self.setup.head)).await {
            Ok(reply) => Ok(reply.trim().parse::<f64>().is_ok()),
            Err(IoError::Timeout) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn init(&mut self) -> Result<(), DeviceError> {
        let setup = self.setup.clone();
        self.set_sampling_rate(setup.sampling_rate).await?;
        self.set_averaging(setup.averaging).await?;
        debug!(head = setup.head, "laser head configured");
        Ok(())
    }

    async fn execute(&mut self, cmd: &DeviceCommand) -> Result<DeviceResponse, DeviceError> {
        match cmd {
            DeviceCommand::SetSamplingRate(mode) => {
                self.set_sampling_rate(*mode).await?;
                Ok(DeviceResponse::Ack)
            }
            DeviceCommand::SetAveraging(mode) => {
                self.set_averaging(*mode).await?;
                Ok(DeviceResponse::Ack)
            }
            DeviceCommand::ReadValue => Ok(DeviceResponse::Value(self.read_value().await?)),
            other => Err(unsupported(other)),
        }
    }

    async fn poll_status(&mut self) -> Result<Telemetry, DeviceError> {
        let value = self.read_value().await?;
        Ok(Telemetry::Laser {
            value,
            in_range: in_range(value),
        })
    }

    async fn close(&mut self) {
        self.channel.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::MockChannel;

    #[tokio::test]
    async fn test_init_applies_head_setup() {
        let channel = MockChannel::new();
        let mut controller = LaserController::new(Box::new(channel.clone()));

        controller.init().await.unwrap();

        assert_eq!(channel.sent(), vec!["SR,0".to_string(), "SW,OA,2,0".to_string()]);
    }

    #[tokio::test]
    async fn test_out_of_range_sentinel_is_a_valid_reading() {
        let channel = MockChannel::new().with_reply("M2", "9999");
        let mut controller = LaserController::new(Box::new(channel));

        let telemetry = controller.poll_status().await.unwrap();
        assert_eq!(
            telemetry,
            Telemetry::Laser {
                value: 9999.0,
                in_range: false
            }
        );
    }

    #[tokio::test]
    async fn test_in_range_reading() {
        let channel = MockChannel::new().with_reply("M2", "1.2345");
        let mut controller = LaserController::new(Box::new(channel));

        let response = controller.execute(&DeviceCommand::ReadValue).await.unwrap();
        assert_eq!(response, DeviceResponse::Value(1.2345));
        assert!(in_range(1.2345));
        assert!(!in_range(-9999.0));
    }

    #[tokio::test]
    async fn test_unparsable_measurement_is_malformed() {
        let channel = MockChannel::new().with_reply("M2", "??");
        let mut controller = LaserController::new(Box::new(channel));

        let err = controller.execute(&DeviceCommand::ReadValue).await.unwrap_err();
        assert!(matches!(err, DeviceError::Malformed(_)));
    }
}
