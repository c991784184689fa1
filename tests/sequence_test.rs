//! Schedule execution, pause/resume, and failure policy.

use modlab::channel::{BoxedChannel, MockChannel};
use modlab::controller::{CameraController, LaserController, StageController};
use modlab::model::{DeviceModel, DeviceState};
use modlab::sequence::{Schedule, ScheduleAction, SequenceCoordinator, SequenceDevices, SequenceEvent};
use modlab::SequenceError;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

struct Rig {
    devices: SequenceDevices,
    stage_channel: MockChannel,
    camera_channel: MockChannel,
    laser_channel: MockChannel,
}

/// Devices with idle-stage, counting-camera, and fixed-laser simulations.
/// Poll intervals are far beyond test duration, so device traffic is driven
/// by the coordinator alone.
fn rig() -> Rig {
    rig_with_stage(
        MockChannel::new()
            .with_reply("1TP?", "0.0")
            .with_reply("1MD?", "1")
            .with_reply("1VE?", "MOCKSTAGE 1.0"),
    )
}

fn rig_with_stage(stage_channel: MockChannel) -> Rig {
    let frames = Arc::new(AtomicU64::new(0));
    let camera_channel = MockChannel::new()
        .with_reply("IDN?", "MOCKCAM")
        .with_reply("TEMP?", "21.5")
        .with_handler(move |line| match line {
            "SNAP" => Some(format!("FRAME {}", frames.fetch_add(1, Ordering::SeqCst) + 1)),
            _ => None,
        });
    let laser_channel = MockChannel::new().with_reply("M2", "5.1234");

    let idle = Duration::from_secs(600);
    let stage = {
        let channel = stage_channel.clone();
        DeviceModel::spawn("stage", idle, move || {
            let channel = channel.clone();
            async move { Ok(StageController::new(Box::new(channel) as BoxedChannel)) }
        })
    };
    let camera = {
        let channel = camera_channel.clone();
        DeviceModel::spawn("camera", idle, move || {
            let channel = channel.clone();
            async move { Ok(CameraController::new(Box::new(channel) as BoxedChannel)) }
        })
    };
    let laser = {
        let channel = laser_channel.clone();
        DeviceModel::spawn("laser", idle, move || {
            let channel = channel.clone();
            async move { Ok(LaserController::new(Box::new(channel) as BoxedChannel)) }
        })
    };

    Rig {
        devices: SequenceDevices { stage, camera, laser },
        stage_channel,
        camera_channel,
        laser_channel,
    }
}

async fn enable_all(rig: &Rig) {
    for model in [&rig.devices.stage, &rig.devices.camera, &rig.devices.laser] {
        model.enable().await;
        assert!(model.wait_for_state(DeviceState::Ready, Duration::from_secs(1)).await);
    }
}

async fn shutdown_all(rig: Rig, coordinator: SequenceCoordinator) {
    let grace = Duration::from_secs(1);
    coordinator.shutdown(grace).await;
    for model in [rig.devices.stage, rig.devices.camera, rig.devices.laser] {
        model.shutdown(grace).await;
    }
}

async fn next_event(events: &mut tokio::sync::broadcast::Receiver<SequenceEvent>) -> SequenceEvent {
    use tokio::sync::broadcast::error::RecvError;
    loop {
        match tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("timed out waiting for sequence event")
        {
            Ok(event) => return event,
            Err(RecvError::Lagged(_)) => continue,
            Err(RecvError::Closed) => panic!("event stream closed"),
        }
    }
}

/// Wait for a terminal event, returning it.
async fn run_outcome(
    events: &mut tokio::sync::broadcast::Receiver<SequenceEvent>,
) -> SequenceEvent {
    loop {
        match next_event(events).await {
            done @ (SequenceEvent::Finished
            | SequenceEvent::Stopped
            | SequenceEvent::Halted(_)) => return done,
            _ => {}
        }
    }
}

#[tokio::test]
async fn test_full_run_acquires_in_order() {
    let rig = rig();
    enable_all(&rig).await;
    let coordinator = SequenceCoordinator::spawn(rig.devices.clone());
    let mut events = coordinator.subscribe();

    coordinator
        .start(Schedule::new(vec![
            ScheduleAction::Set,
            ScheduleAction::Ref,
            ScheduleAction::Defo,
            ScheduleAction::Temp,
            ScheduleAction::End,
        ]))
        .await;

    assert!(matches!(run_outcome(&mut events).await, SequenceEvent::Finished));

    // Three acquisitions, one per image step, and one measurement read.
    let snaps = rig
        .camera_channel
        .sent()
        .iter()
        .filter(|line| *line == "SNAP")
        .count();
    assert_eq!(snaps, 3);
    assert!(rig.laser_channel.sent().contains(&"M2".to_string()));

    shutdown_all(rig, coordinator).await;
}

#[tokio::test]
async fn test_defo_before_ref_halts_without_device_io() {
    let rig = rig();
    enable_all(&rig).await;
    let coordinator = SequenceCoordinator::spawn(rig.devices.clone());
    let mut events = coordinator.subscribe();

    let camera_baseline = rig.camera_channel.sent_count();
    let stage_baseline = rig.stage_channel.sent_count();

    // REF exists but comes after DEFO, so static validation passes and the
    // runtime prerequisite gate has to catch it.
    coordinator
        .start(Schedule::new(vec![
            ScheduleAction::Defo,
            ScheduleAction::Ref,
            ScheduleAction::End,
        ]))
        .await;

    match run_outcome(&mut events).await {
        SequenceEvent::Halted(SequenceError::ActionWithoutPrerequisite { action, prerequisite }) => {
            assert_eq!(action, "DEFO");
            assert_eq!(prerequisite, "REF");
        }
        other => panic!("expected prerequisite halt, got {:?}", other),
    }

    assert_eq!(rig.camera_channel.sent_count(), camera_baseline);
    assert_eq!(rig.stage_channel.sent_count(), stage_baseline);

    shutdown_all(rig, coordinator).await;
}

#[tokio::test]
async fn test_schedule_with_no_reference_anywhere_fails_validation() {
    let rig = rig();
    enable_all(&rig).await;
    let coordinator = SequenceCoordinator::spawn(rig.devices.clone());
    let mut events = coordinator.subscribe();

    coordinator
        .start(Schedule::new(vec![ScheduleAction::Defo, ScheduleAction::End]))
        .await;

    assert!(matches!(
        run_outcome(&mut events).await,
        SequenceEvent::Halted(SequenceError::InvalidScheduleEntry { .. })
    ));

    shutdown_all(rig, coordinator).await;
}

#[tokio::test]
async fn test_device_not_ready_halts_loud() {
    let rig = rig();
    // Stage comes up; the camera is deliberately left OFF.
    rig.devices.stage.enable().await;
    assert!(
        rig.devices
            .stage
            .wait_for_state(DeviceState::Ready, Duration::from_secs(1))
            .await
    );

    let coordinator = SequenceCoordinator::spawn(rig.devices.clone());
    let mut events = coordinator.subscribe();

    coordinator
        .start(Schedule::new(vec![ScheduleAction::Set, ScheduleAction::End]))
        .await;

    match run_outcome(&mut events).await {
        SequenceEvent::Halted(SequenceError::DeviceNotReady(device)) => {
            assert_eq!(device, "camera");
        }
        other => panic!("expected not-ready halt, got {:?}", other),
    }

    shutdown_all(rig, coordinator).await;
}

#[tokio::test]
async fn test_stop_interrupts_a_looping_schedule() {
    let rig = rig();
    enable_all(&rig).await;
    let coordinator = SequenceCoordinator::spawn(rig.devices.clone());
    let mut events = coordinator.subscribe();

    coordinator
        .start(Schedule::new(vec![
            ScheduleAction::Ref,
            ScheduleAction::Defo,
            ScheduleAction::Sleep(600),
            ScheduleAction::Goto(0),
        ]))
        .await;

    // Let the first iteration reach its SLEEP, then stop mid-wait.
    loop {
        if let SequenceEvent::StepStarted { action: ScheduleAction::Sleep(_), .. } =
            next_event(&mut events).await
        {
            break;
        }
    }
    coordinator.stop().await;
    assert!(matches!(run_outcome(&mut events).await, SequenceEvent::Stopped));

    shutdown_all(rig, coordinator).await;
}

#[tokio::test]
async fn test_stop_interrupts_motion_wait() {
    // Stage that never reports motion done, so a SET step waits forever
    // unless stop cuts the wait short.
    let rig = rig_with_stage(
        MockChannel::new()
            .with_reply("1TP?", "0.0")
            .with_reply("1MD?", "0")
            .with_reply("1VE?", "MOCKSTAGE 1.0"),
    );
    enable_all(&rig).await;
    let coordinator = SequenceCoordinator::spawn(rig.devices.clone());
    let mut events = coordinator.subscribe();

    coordinator
        .start(Schedule::new(vec![ScheduleAction::Set, ScheduleAction::End]))
        .await;

    // Let the SET step begin its motion wait, then stop.
    loop {
        if let SequenceEvent::StepStarted { action: ScheduleAction::Set, .. } =
            next_event(&mut events).await
        {
            break;
        }
    }
    coordinator.stop().await;
    assert!(matches!(run_outcome(&mut events).await, SequenceEvent::Stopped));

    // The camera never fired; the run ended inside the motion wait.
    let snaps = rig
        .camera_channel
        .sent()
        .iter()
        .filter(|line| *line == "SNAP")
        .count();
    assert_eq!(snaps, 0);

    shutdown_all(rig, coordinator).await;
}

#[tokio::test(start_paused = true)]
async fn test_sleep_pause_resume_continues_with_remaining_time() {
    let rig = rig();
    enable_all(&rig).await;
    let coordinator = SequenceCoordinator::spawn(rig.devices.clone());
    let mut events = coordinator.subscribe();

    coordinator
        .start(Schedule::new(vec![ScheduleAction::Sleep(5), ScheduleAction::End]))
        .await;

    // Sleep step underway.
    loop {
        if let SequenceEvent::StepStarted { action: ScheduleAction::Sleep(_), .. } =
            next_event(&mut events).await
        {
            break;
        }
    }

    tokio::time::advance(Duration::from_secs(2)).await;
    coordinator.pause().await;
    loop {
        if matches!(next_event(&mut events).await, SequenceEvent::Paused) {
            break;
        }
    }

    // A full minute passes while paused; the sleep must not complete.
    tokio::time::advance(Duration::from_secs(60)).await;
    tokio::task::yield_now().await;
    assert!(matches!(
        events.try_recv(),
        Err(tokio::sync::broadcast::error::TryRecvError::Empty)
    ));

    coordinator.resume().await;
    loop {
        if matches!(next_event(&mut events).await, SequenceEvent::Resumed) {
            break;
        }
    }

    // Remaining budget is 3 s, not the original 5 s: 2.9 s is not enough,
    // a further 0.2 s is.
    tokio::time::advance(Duration::from_millis(2900)).await;
    tokio::task::yield_now().await;
    assert!(matches!(
        events.try_recv(),
        Err(tokio::sync::broadcast::error::TryRecvError::Empty)
    ));

    tokio::time::advance(Duration::from_millis(200)).await;
    assert!(matches!(run_outcome(&mut events).await, SequenceEvent::Finished));

    shutdown_all(rig, coordinator).await;
}

#[tokio::test]
async fn test_single_actions_share_prerequisite_tracking() {
    let rig = rig();
    enable_all(&rig).await;
    let coordinator = SequenceCoordinator::spawn(rig.devices.clone());
    let mut events = coordinator.subscribe();

    // DEFO alone is refused.
    coordinator.run_single(ScheduleAction::Defo).await;
    assert!(matches!(
        run_outcome(&mut events).await,
        SequenceEvent::Halted(SequenceError::ActionWithoutPrerequisite { .. })
    ));

    // A REF satisfies the later single DEFO.
    coordinator.run_single(ScheduleAction::Ref).await;
    loop {
        if matches!(next_event(&mut events).await, SequenceEvent::StepCompleted { .. }) {
            break;
        }
    }
    coordinator.run_single(ScheduleAction::Defo).await;
    loop {
        match next_event(&mut events).await {
            SequenceEvent::StepCompleted { action: ScheduleAction::Defo, .. } => break,
            SequenceEvent::Halted(e) => panic!("single DEFO failed: {}", e),
            _ => {}
        }
    }

    shutdown_all(rig, coordinator).await;
}

#[tokio::test]
async fn test_schedule_file_round_trip() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("run.schedule");

    let schedule = Schedule::new(vec![
        ScheduleAction::FileRef("/data/ref.raw".into()),
        ScheduleAction::Set,
        ScheduleAction::Sleep(30),
        ScheduleAction::Defo,
        ScheduleAction::Goto(1),
        ScheduleAction::End,
    ]);

    schedule.save(&path).await.expect("save");
    let loaded = Schedule::load(&path).await.expect("load");
    assert_eq!(loaded, schedule);
}
