//! Vacuum relay card controller.
//!
//! 8-output relay card with an ASCII line protocol: `SET <n> <0|1>` drives an
//! output, `TOGGLE <n>` inverts it, `STATUS?` returns the eight output levels
//! as a bit string (`10010000`, output 0 first).

use crate::channel::BoxedChannel;
use crate::controller::{
    check_rejected, io_to_device, unsupported, DeviceCommand, DeviceController, DeviceResponse,
    Telemetry,
};
use crate::error::{DeviceError, IoError};
use async_trait::async_trait;
use tracing::debug;

/// Number of outputs on the relay card.
pub const RELAY_OUTPUTS: usize = 8;

/// Controller for the 8-channel vacuum relay card.
pub struct RelayController {
    channel: BoxedChannel,
}

impl RelayController {
    /// Create a relay controller over the given channel.
    pub fn new(channel: BoxedChannel) -> Self {
        Self { channel }
    }

    fn check_channel(channel: u8) -> Result<(), DeviceError> {
        if usize::from(channel) >= RELAY_OUTPUTS {
            return Err(DeviceError::Rejected(format!(
                "output channel {} out of range (0-{})",
                channel,
                RELAY_OUTPUTS - 1
            )));
        }
        Ok(())
    }

    async fn read_outputs(&mut self) -> Result<[bool; RELAY_OUTPUTS], DeviceError> {
        let reply = self.channel.query("STATUS?").await.map_err(io_to_device)?;
        let reply = check_rejected(&reply)?;
        parse_status(reply)
    }
}

fn parse_status(reply: &str) -> Result<[bool; RELAY_OUTPUTS], DeviceError> {
    let bits = reply.trim();
    if bits.len() != RELAY_OUTPUTS {
        return Err(DeviceError::Malformed(format!("status reply '{}'", bits)));
    }
    let mut outputs = [false; RELAY_OUTPUTS];
    for (i, c) in bits.chars().enumerate() {
        outputs[i] = match c {
            '0' => false,
            '1' => true,
            _ => return Err(DeviceError::Malformed(format!("status reply '{}'", bits))),
        };
    }
    Ok(outputs)
}

#[async_trait]
impl DeviceController for RelayController {
    async fn probe(&mut self) -> Result<bool, IoError> {
        match self.channel.query("STATUS?").await {
            Ok(reply) => Ok(parse_status(&reply).is_ok()),
            Err(IoError::Timeout) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn execute(&mut self, cmd: &DeviceCommand) -> Result<DeviceResponse, DeviceError> {
        match cmd {
            DeviceCommand::SetOutput { channel, on } => {
                Self::check_channel(*channel)?;
                let cmd = format!("SET {} {}", channel, u8::from(*on));
                let reply = self.channel.query(&cmd).await.map_err(io_to_device)?;
                check_rejected(&reply)?;
                debug!(channel, on, "relay output driven");
                Ok(DeviceResponse::OutputState {
                    channel: *channel,
                    on: *on,
                })
            }
            DeviceCommand::ToggleOutput { channel } => {
                Self::check_channel(*channel)?;
                let cmd = format!("TOGGLE {}", channel);
                let reply = self.channel.query(&cmd).await.map_err(io_to_device)?;
                check_rejected(&reply)?;
                let outputs = self.read_outputs().await?;
                debug!(channel, on = outputs[usize::from(*channel)], "relay output toggled");
                Ok(DeviceResponse::OutputState {
                    channel: *channel,
                    on: outputs[usize::from(*channel)],
                })
            }
            other => Err(unsupported(other)),
        }
    }

    async fn poll_status(&mut self) -> Result<Telemetry, DeviceError> {
        Ok(Telemetry::Relay {
            outputs: self.read_outputs().await?,
        })
    }

    async fn close(&mut self) {
        self.channel.close().await;
    }
}
