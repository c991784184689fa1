//! Strongly-typed application configuration.
//!
//! Settings are loaded from a TOML file with `MODLAB_`-prefixed environment
//! variables layered on top, and validated after extraction. Every field has
//! a default, so an empty (or missing) file yields a runnable configuration
//! pointing at the conventional `/dev/ttyUSB*` ports.
//!
//! ```text
//! MODLAB_APPLICATION_LOG_LEVEL=debug
//! MODLAB_STAGE_PORT=/dev/ttyUSB3
//! ```

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Configuration load/validation failure.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Extraction from file/environment failed.
    #[error("configuration load error: {0}")]
    Load(#[from] figment::Error),
    /// The extracted configuration is inconsistent.
    #[error("configuration validation error: {0}")]
    Validation(String),
}

/// Top-level settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Application-level settings.
    pub application: ApplicationSettings,
    /// Motorized stage.
    pub stage: StageSettings,
    /// Still camera.
    pub camera: CameraSettings,
    /// Vacuum relay card.
    pub relay: RelaySettings,
    /// Laser distance head.
    pub laser: LaserSettings,
}

/// Application-level settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationSettings {
    /// Application name used in logs.
    pub name: String,
    /// Logging level (trace, debug, info, warn, error).
    pub log_level: String,
    /// Directory searched for schedule files.
    #[serde(default)]
    pub schedule_dir: Option<PathBuf>,
    /// Grace period before worker tasks are force-aborted on shutdown.
    #[serde(with = "humantime_serde")]
    pub shutdown_grace: Duration,
}

/// Motorized stage settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageSettings {
    /// Serial port of the stage controller.
    pub port: String,
    /// Baud rate.
    pub baud_rate: u32,
    /// 1-indexed axis number.
    pub axis: u8,
    /// Lower soft travel limit (mm).
    pub min_position: f64,
    /// Upper soft travel limit (mm).
    pub max_position: f64,
    /// Telemetry poll interval.
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    /// Bounded receive timeout.
    #[serde(with = "humantime_serde")]
    pub io_timeout: Duration,
}

/// Still camera settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CameraSettings {
    /// Serial port of the camera bridge.
    pub port: String,
    /// Baud rate.
    pub baud_rate: u32,
    /// Telemetry poll interval.
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    /// Bounded receive timeout; frame acquisition is slow.
    #[serde(with = "humantime_serde")]
    pub io_timeout: Duration,
}

/// Vacuum relay card settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelaySettings {
    /// Serial port of the relay card.
    pub port: String,
    /// Baud rate.
    pub baud_rate: u32,
    /// Telemetry poll interval.
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    /// Bounded receive timeout.
    #[serde(with = "humantime_serde")]
    pub io_timeout: Duration,
}

/// Laser distance head settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LaserSettings {
    /// Serial port of the laser head controller.
    pub port: String,
    /// Baud rate.
    pub baud_rate: u32,
    /// Measurement head number.
    pub head: u8,
    /// Sampling-rate mode applied on enable.
    pub sampling_rate: u8,
    /// Averaging mode applied on enable.
    pub averaging: u8,
    /// Telemetry poll interval.
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    /// Bounded receive timeout.
    #[serde(with = "humantime_serde")]
    pub io_timeout: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            application: ApplicationSettings {
                name: "modlab".to_string(),
                log_level: "info".to_string(),
                schedule_dir: None,
                shutdown_grace: Duration::from_secs(2),
            },
            stage: StageSettings {
                port: "/dev/ttyUSB0".to_string(),
                baud_rate: 19200,
                axis: 1,
                min_position: 0.0,
                max_position: 300.0,
                poll_interval: Duration::from_millis(500),
                io_timeout: Duration::from_millis(1000),
            },
            camera: CameraSettings {
                port: "/dev/ttyUSB1".to_string(),
                baud_rate: 115_200,
                poll_interval: Duration::from_secs(2),
                io_timeout: Duration::from_secs(5),
            },
            relay: RelaySettings {
                port: "/dev/ttyUSB2".to_string(),
                baud_rate: 9600,
                poll_interval: Duration::from_secs(1),
                io_timeout: Duration::from_millis(1000),
            },
            laser: LaserSettings {
                port: "/dev/ttyUSB3".to_string(),
                baud_rate: 9600,
                head: 2,
                sampling_rate: 0,
                averaging: 0,
                poll_interval: Duration::from_millis(100),
                io_timeout: Duration::from_millis(500),
            },
        }
    }
}

impl Settings {
    /// Load from the conventional `modlab.toml` plus environment overrides.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from("modlab.toml")
    }

    /// Load from a specific file path plus environment overrides.
    ///
    /// Precedence, highest first: `MODLAB_` environment variables, the file,
    /// built-in defaults.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let settings: Self = Figment::new()
            .merge(Serialized::defaults(Settings::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("MODLAB_").split("_"))
            .extract()?;

        settings.validate()?;
        Ok(settings)
    }

    /// Consistency checks run after extraction.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(ConfigError::Validation(format!(
                "invalid log_level '{}', must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        if self.application.shutdown_grace.is_zero() {
            return Err(ConfigError::Validation(
                "shutdown_grace must be non-zero".to_string(),
            ));
        }

        if self.stage.min_position >= self.stage.max_position {
            return Err(ConfigError::Validation(format!(
                "stage travel limits inverted: min {} >= max {}",
                self.stage.min_position, self.stage.max_position
            )));
        }

        for (device, interval) in [
            ("stage", self.stage.poll_interval),
            ("camera", self.camera.poll_interval),
            ("relay", self.relay.poll_interval),
            ("laser", self.laser.poll_interval),
        ] {
            if interval.is_zero() {
                return Err(ConfigError::Validation(format!(
                    "{} poll_interval must be non-zero",
                    device
                )));
            }
        }

        Ok(())
    }
}

#[cfg(feature = "instrument_serial")]
mod serial_settings {
    use super::{CameraSettings, LaserSettings, RelaySettings, StageSettings};
    use crate::channel::SerialSettings;

    impl StageSettings {
        /// Serial line discipline for the stage port.
        pub fn serial(&self) -> SerialSettings {
            SerialSettings::new(&self.port, self.baud_rate).with_timeout(self.io_timeout)
        }
    }

    impl CameraSettings {
        /// Serial line discipline for the camera bridge port.
        pub fn serial(&self) -> SerialSettings {
            SerialSettings::new(&self.port, self.baud_rate).with_timeout(self.io_timeout)
        }
    }

    impl RelaySettings {
        /// Serial line discipline for the relay card port.
        pub fn serial(&self) -> SerialSettings {
            SerialSettings::new(&self.port, self.baud_rate).with_timeout(self.io_timeout)
        }
    }

    impl LaserSettings {
        /// Serial line discipline for the laser head port.
        pub fn serial(&self) -> SerialSettings {
            SerialSettings::new(&self.port, self.baud_rate).with_timeout(self.io_timeout)
        }
    }
}
