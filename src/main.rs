//! Demonstration binary for the device-orchestration core.
//!
//! Spawns the four device models (stage, camera, relay card, laser head),
//! exercises the relay, then runs a schedule against the stage/camera/laser
//! trio and streams run progress to the log. With `--mock` (or when the
//! `instrument_serial` feature is disabled) the devices are simulated
//! in-process, so the full pipeline can be demonstrated on a machine with no
//! hardware attached.
//!
//! ```bash
//! cargo run -- --mock
//! cargo run -- --mock --schedule demo.schedule
//! ```

use anyhow::{bail, Context, Result};
use clap::Parser;
use modlab::channel::{BoxedChannel, MockChannel};
use modlab::config::Settings;
use modlab::controller::{
    laser::LaserSetup, stage::TravelLimits, CameraController, DeviceCommand, LaserController,
    RelayController, StageController,
};
use modlab::model::{DeviceModel, DeviceState};
use modlab::sequence::{Schedule, ScheduleAction, SequenceCoordinator, SequenceDevices, SequenceEvent};
use rand::Rng;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser, Debug)]
#[command(name = "modlab", about = "Lab device orchestration demo")]
struct Cli {
    /// Configuration file path.
    #[arg(long, default_value = "modlab.toml")]
    config: PathBuf,

    /// Schedule file to run; a built-in demo schedule is used when omitted.
    #[arg(long)]
    schedule: Option<PathBuf>,

    /// Simulate all devices in-process instead of opening serial ports.
    #[arg(long)]
    mock: bool,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = Settings::load_from(&cli.config).context("loading configuration")?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(settings.application.log_level.clone())),
        )
        .init();

    info!(name = %settings.application.name, "starting");

    let grace = settings.application.shutdown_grace;
    let devices = if cli.mock {
        spawn_mock_devices(&settings)
    } else {
        spawn_serial_devices(&settings).await?
    };

    for model in [&devices.stage, &devices.camera, &devices.laser, &devices.relay] {
        model.enable().await;
        if !model.wait_for_state(DeviceState::Ready, Duration::from_secs(10)).await {
            warn!(device = model.id(), "device did not come up, continuing without it");
        }
    }

    exercise_relay(&devices.relay).await;

    let schedule = match &cli.schedule {
        Some(path) => Schedule::load(path)
            .await
            .with_context(|| format!("loading schedule {}", path.display()))?,
        None => demo_schedule(),
    };

    let coordinator = SequenceCoordinator::spawn(SequenceDevices {
        stage: devices.stage.clone(),
        camera: devices.camera.clone(),
        laser: devices.laser.clone(),
    });
    run_schedule(&coordinator, schedule).await?;

    coordinator.shutdown(grace).await;
    for model in [devices.stage, devices.camera, devices.laser, devices.relay] {
        model.disable().await;
        model.shutdown(grace).await;
    }
    info!("shutdown complete");
    Ok(())
}

struct Devices {
    stage: DeviceModel,
    camera: DeviceModel,
    relay: DeviceModel,
    laser: DeviceModel,
}

async fn run_schedule(coordinator: &SequenceCoordinator, schedule: Schedule) -> Result<()> {
    let mut events = coordinator.subscribe();
    coordinator.start(schedule).await;

    loop {
        match events.recv().await {
            Ok(SequenceEvent::StepStarted { index, action }) => {
                info!(index, %action, "step started");
            }
            Ok(SequenceEvent::StepCompleted { index, action }) => {
                info!(index, %action, "step completed");
            }
            Ok(SequenceEvent::Finished) => {
                info!("schedule finished");
                return Ok(());
            }
            Ok(SequenceEvent::Stopped) => {
                info!("schedule stopped");
                return Ok(());
            }
            Ok(SequenceEvent::Halted(e)) => bail!("schedule halted: {}", e),
            Ok(other) => info!(?other, "sequence event"),
            Err(_) => bail!("coordinator event stream closed"),
        }
    }
}

async fn exercise_relay(relay: &DeviceModel) {
    for cmd in [
        DeviceCommand::SetOutput { channel: 0, on: true },
        DeviceCommand::ToggleOutput { channel: 0 },
    ] {
        match relay.submit(cmd.clone()).await {
            Ok(response) => info!(?cmd, ?response, "relay command"),
            Err(e) => warn!(?cmd, error = %e, "relay command failed"),
        }
    }
}

fn demo_schedule() -> Schedule {
    Schedule::new(vec![
        ScheduleAction::Set,
        ScheduleAction::Ref,
        ScheduleAction::Sleep(1),
        ScheduleAction::Defo,
        ScheduleAction::Temp,
        ScheduleAction::End,
    ])
}

/// Spawn device models over in-process simulated hardware.
fn spawn_mock_devices(settings: &Settings) -> Devices {
    let stage_channel = mock_stage_channel();
    let camera_channel = mock_camera_channel();
    let relay_channel = mock_relay_channel();
    let laser_channel = mock_laser_channel();

    let limits = TravelLimits {
        min_position: settings.stage.min_position,
        max_position: settings.stage.max_position,
    };
    let axis = settings.stage.axis;
    let setup = LaserSetup {
        head: settings.laser.head,
        sampling_rate: settings.laser.sampling_rate,
        averaging: settings.laser.averaging,
    };

    Devices {
        stage: DeviceModel::spawn("stage", settings.stage.poll_interval, move || {
            let channel = stage_channel.clone();
            let limits = limits.clone();
            async move {
                Ok(StageController::with_limits(
                    Box::new(channel) as BoxedChannel,
                    axis,
                    limits,
                ))
            }
        }),
        camera: DeviceModel::spawn("camera", settings.camera.poll_interval, move || {
            let channel = camera_channel.clone();
            async move { Ok(CameraController::new(Box::new(channel) as BoxedChannel)) }
        }),
        relay: DeviceModel::spawn("relay", settings.relay.poll_interval, move || {
            let channel = relay_channel.clone();
            async move { Ok(RelayController::new(Box::new(channel) as BoxedChannel)) }
        }),
        laser: DeviceModel::spawn("laser", settings.laser.poll_interval, move || {
            let channel = laser_channel.clone();
            let setup = setup.clone();
            async move {
                Ok(LaserController::with_setup(
                    Box::new(channel) as BoxedChannel,
                    setup,
                ))
            }
        }),
    }
}

/// Stage simulation: moves complete after a couple of motion-done polls.
fn mock_stage_channel() -> MockChannel {
    let state = Arc::new(Mutex::new((0.0_f64, 0_u8))); // (position, polls until idle)
    MockChannel::new().with_handler(move |line| {
        let mut state = lock(&state);
        if let Some(target) = line.strip_prefix("1PA") {
            state.0 = target.parse().ok()?;
            state.1 = 2;
            Some("OK".to_string())
        } else if let Some(delta) = line.strip_prefix("1PR") {
            state.0 += delta.parse::<f64>().ok()?;
            state.1 = 2;
            Some("OK".to_string())
        } else if line == "1TP?" {
            Some(format!("{:.4}", state.0))
        } else if line == "1MD?" {
            if state.1 > 0 {
                state.1 -= 1;
                Some("0".to_string())
            } else {
                Some("1".to_string())
            }
        } else if line == "1ST" {
            state.1 = 0;
            Some("OK".to_string())
        } else if line == "1VE?" {
            Some("MOCKSTAGE 1.0".to_string())
        } else {
            None
        }
    })
}

fn mock_camera_channel() -> MockChannel {
    let frames = Arc::new(AtomicU64::new(0));
    MockChannel::new().with_handler(move |line| match line {
        "IDN?" => Some("MOCKCAM".to_string()),
        "SNAP" => Some(format!("FRAME {}", frames.fetch_add(1, Ordering::SeqCst) + 1)),
        "TEMP?" => Some(format!(
            "{:.1}",
            21.0 + rand::thread_rng().gen_range(-0.3..0.3)
        )),
        _ => None,
    })
}

fn mock_relay_channel() -> MockChannel {
    let outputs = Arc::new(Mutex::new([false; 8]));
    MockChannel::new().with_handler(move |line| {
        let mut outputs = lock(&outputs);
        if line == "STATUS?" {
            Some(outputs.iter().map(|&on| if on { '1' } else { '0' }).collect())
        } else if let Some(rest) = line.strip_prefix("SET ") {
            let mut parts = rest.split_whitespace();
            let n: usize = parts.next()?.parse().ok()?;
            let on = parts.next()? == "1";
            *outputs.get_mut(n)? = on;
            Some("OK".to_string())
        } else if let Some(n) = line.strip_prefix("TOGGLE ") {
            let n: usize = n.trim().parse().ok()?;
            let slot = outputs.get_mut(n)?;
            *slot = !*slot;
            Some("OK".to_string())
        } else {
            None
        }
    })
}

fn mock_laser_channel() -> MockChannel {
    MockChannel::new().with_handler(|line| {
        if line.starts_with('M') {
            Some(format!(
                "{:.4}",
                5.0 + rand::thread_rng().gen_range(-0.01..0.01)
            ))
        } else {
            None // SR,* / SW,* fall through to the default "OK"
        }
    })
}

#[cfg(feature = "instrument_serial")]
async fn spawn_serial_devices(settings: &Settings) -> Result<Devices> {
    use modlab::channel::SerialChannel;

    let stage_settings = settings.stage.serial();
    let camera_settings = settings.camera.serial();
    let relay_settings = settings.relay.serial();
    let laser_settings = settings.laser.serial();

    let limits = TravelLimits {
        min_position: settings.stage.min_position,
        max_position: settings.stage.max_position,
    };
    let axis = settings.stage.axis;
    let setup = LaserSetup {
        head: settings.laser.head,
        sampling_rate: settings.laser.sampling_rate,
        averaging: settings.laser.averaging,
    };

    Ok(Devices {
        stage: DeviceModel::spawn("stage", settings.stage.poll_interval, move || {
            let serial = stage_settings.clone();
            let limits = limits.clone();
            async move {
                let channel = SerialChannel::open(serial).await?;
                Ok(StageController::with_limits(
                    Box::new(channel) as BoxedChannel,
                    axis,
                    limits,
                ))
            }
        }),
        camera: DeviceModel::spawn("camera", settings.camera.poll_interval, move || {
            let serial = camera_settings.clone();
            async move {
                let channel = SerialChannel::open(serial).await?;
                Ok(CameraController::new(Box::new(channel) as BoxedChannel))
            }
        }),
        relay: DeviceModel::spawn("relay", settings.relay.poll_interval, move || {
            let serial = relay_settings.clone();
            async move {
                let channel = SerialChannel::open(serial).await?;
                Ok(RelayController::new(Box::new(channel) as BoxedChannel))
            }
        }),
        laser: DeviceModel::spawn("laser", settings.laser.poll_interval, move || {
            let serial = laser_settings.clone();
            let setup = setup.clone();
            async move {
                let channel = SerialChannel::open(serial).await?;
                Ok(LaserController::with_setup(
                    Box::new(channel) as BoxedChannel,
                    setup,
                ))
            }
        }),
    })
}

#[cfg(not(feature = "instrument_serial"))]
async fn spawn_serial_devices(_settings: &Settings) -> Result<Devices> {
    bail!("built without the instrument_serial feature; run with --mock")
}
