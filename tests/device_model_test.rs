//! Lifecycle and ordering guarantees of the device worker.

use modlab::channel::{BoxedChannel, MockChannel};
use modlab::controller::{DeviceCommand, DeviceResponse, StageController, Telemetry};
use modlab::model::{DeviceEvent, DeviceModel, DeviceState};
use modlab::DeviceError;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Stage simulation: `1PA` moves take two motion-done polls to settle.
fn stage_channel() -> MockChannel {
    let state = Arc::new(Mutex::new((0.0_f64, 0_u8)));
    MockChannel::new().with_handler(move |line| {
        let mut state = lock(&state);
        if let Some(target) = line.strip_prefix("1PA") {
            state.0 = target.parse().ok()?;
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
        } else if line == "1VE?" {
            Some("MOCKSTAGE 1.0".to_string())
        } else {
            None
        }
    })
}

fn stage_model(channel: MockChannel, poll: Duration) -> DeviceModel {
    DeviceModel::spawn("stage", poll, move || {
        let channel = channel.clone();
        async move {
            channel.reopen();
            Ok(StageController::new(Box::new(channel) as BoxedChannel))
        }
    })
}

#[tokio::test]
async fn test_submit_before_enable_fails_without_controller_io() {
    let channel = stage_channel();
    let model = stage_model(channel.clone(), Duration::from_secs(60));

    let err = model.submit(DeviceCommand::MoveAbsolute(10.0)).await.unwrap_err();
    assert_eq!(err, DeviceError::NotReady);
    assert_eq!(model.state(), DeviceState::Off);
    assert_eq!(channel.sent_count(), 0);

    model.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn test_commands_execute_in_submission_order() {
    let channel = stage_channel();
    // Poll interval far beyond the test duration, so any traffic after the
    // probe comes from submitted commands alone.
    let model = stage_model(channel.clone(), Duration::from_secs(60));

    model.enable().await;
    assert!(model.wait_for_state(DeviceState::Ready, Duration::from_secs(1)).await);
    let baseline = channel.sent_count();

    // join_all polls the futures in creation order, so the commands enter
    // the worker mailbox in exactly this order without waiting for each
    // reply first.
    let submissions = [10.0, 20.0, 30.0, 40.0]
        .into_iter()
        .map(|target| model.submit(DeviceCommand::MoveAbsolute(target)))
        .collect::<Vec<_>>();
    for result in futures::future::join_all(submissions).await {
        assert_eq!(result, Ok(DeviceResponse::Ack));
    }

    assert_eq!(
        channel.sent()[baseline..],
        [
            "1PA10.0000".to_string(),
            "1PA20.0000".to_string(),
            "1PA30.0000".to_string(),
            "1PA40.0000".to_string(),
        ]
    );

    model.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn test_disable_releases_transport() {
    let channel = stage_channel();
    let model = stage_model(channel.clone(), Duration::from_secs(60));

    model.enable().await;
    assert!(model.wait_for_state(DeviceState::Ready, Duration::from_secs(1)).await);
    assert!(channel.is_open());

    model.disable().await;
    assert!(model.wait_for_state(DeviceState::Off, Duration::from_secs(1)).await);
    assert!(!channel.is_open());

    model.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn test_shutdown_releases_transport_even_when_enabled() {
    let channel = stage_channel();
    let model = stage_model(channel.clone(), Duration::from_secs(60));

    model.enable().await;
    assert!(model.wait_for_state(DeviceState::Ready, Duration::from_secs(1)).await);

    model.shutdown(Duration::from_secs(2)).await;
    assert!(!channel.is_open());
}

#[tokio::test]
async fn test_transport_failure_drops_controller_and_enters_error() {
    let channel = stage_channel();
    let model = stage_model(channel.clone(), Duration::from_secs(60));

    model.enable().await;
    assert!(model.wait_for_state(DeviceState::Ready, Duration::from_secs(1)).await);

    channel.push_failure(modlab::IoError::Disconnected);
    let err = model.submit(DeviceCommand::ReadPosition).await.unwrap_err();
    assert_eq!(err, DeviceError::Io(modlab::IoError::Disconnected));

    assert!(model.wait_for_state(DeviceState::Error, Duration::from_secs(1)).await);
    assert!(!channel.is_open());

    // Protocol-level trouble, by contrast, keeps the model READY.
    model.reset().await;
    model.enable().await;
    assert!(model.wait_for_state(DeviceState::Ready, Duration::from_secs(1)).await);
    channel.push_reply("garbage");
    let err = model.submit(DeviceCommand::ReadPosition).await.unwrap_err();
    assert!(matches!(err, DeviceError::Malformed(_)));
    assert_eq!(model.state(), DeviceState::Ready);

    model.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn test_end_to_end_move_produces_one_settled_telemetry_event() {
    let channel = stage_channel();
    let model = stage_model(channel.clone(), Duration::from_millis(50));
    let mut events = model.subscribe();

    model.enable().await;
    assert!(model.wait_for_state(DeviceState::Ready, Duration::from_secs(1)).await);

    assert_eq!(
        model.submit(DeviceCommand::MoveAbsolute(25.0)).await,
        Ok(DeviceResponse::Ack)
    );

    // Wait for the settled reading to be published.
    let settled = Telemetry::Motion { position: 25.0, moving: false };
    let found = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            if let Ok(DeviceEvent::Telemetry { telemetry, .. }) = events.recv().await {
                if telemetry == settled {
                    return;
                }
            }
        }
    })
    .await;
    assert!(found.is_ok(), "settled telemetry never arrived");

    // Telemetry is published only on change, so several further poll cycles
    // produce no duplicate of the settled reading.
    tokio::time::sleep(Duration::from_millis(300)).await;
    while let Ok(event) = events.try_recv() {
        if let DeviceEvent::Telemetry { telemetry, .. } = event {
            assert_ne!(telemetry, settled, "settled reading published twice");
        }
    }

    model.disable().await;
    assert!(model.wait_for_state(DeviceState::Off, Duration::from_secs(1)).await);
    assert!(!channel.is_open());

    // Once OFF, polling has stopped; nothing further arrives.
    tokio::time::sleep(Duration::from_millis(300)).await;
    while let Ok(event) = events.try_recv() {
        assert!(
            !matches!(event, DeviceEvent::Telemetry { .. }),
            "unexpected telemetry after disable: {:?}",
            event
        );
    }

    model.shutdown(Duration::from_secs(1)).await;
}
