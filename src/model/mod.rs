//! Device models: one worker task per physical instrument.
//!
//! A [`DeviceModel`] wraps one device controller and is the only place its
//! transport is ever touched. The handle type is cheap to clone and
//! communicates with the worker exclusively through a bounded mailbox;
//! state and telemetry leave the worker only as immutable event payloads
//! (broadcast) and the live state value (watch). Nothing here ever blocks
//! the caller.
//!
//! # Lifecycle
//!
//! ```text
//! OFF --enable--> INITIALIZING --probe ok--> READY <--poll/submit loop
//!  ^                   |                       |
//!  |              probe failed            transport failure
//!  +-------------------+                       v
//!  +----reset---------------------------- ERROR
//! ```
//!
//! INITIALIZING is mandatory: controller construction and the device-presence
//! probe happen there, so OFF never jumps straight to READY. A model in OFF
//! or ERROR rejects `submit` with [`DeviceError::NotReady`] without touching
//! the controller.
//!
//! # Ordering
//!
//! Commands and the periodic status poll are handled by the same `select!`
//! loop, so commands execute in submission order and polling never interleaves
//! with an in-flight command. Observer notification is fire-and-forget over a
//! broadcast channel: ordered, and never able to stall the worker (slow
//! observers lag instead).

use crate::controller::{io_to_device, DeviceCommand, DeviceController, DeviceResponse, Telemetry};
use crate::error::{DeviceError, IoError};
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// Commands queued ahead of this bound apply backpressure to the caller.
const MAILBOX_CAPACITY: usize = 32;
/// Events buffered per observer before a slow observer starts lagging.
const EVENT_CAPACITY: usize = 256;

/// Lifecycle state of a device model.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceState {
    /// No controller, no transport.
    Off,
    /// Controller construction and device-presence probe in progress.
    Initializing,
    /// Connected; accepting commands and polling telemetry.
    Ready,
    /// Unrecoverable transport failure; leave only via explicit reset.
    Error,
}

/// Notification published by a device model to its observers.
#[derive(Debug, Clone)]
pub enum DeviceEvent {
    /// The lifecycle state changed.
    StateChanged {
        /// Originating device.
        device: String,
        /// New state.
        state: DeviceState,
    },
    /// The telemetry snapshot changed since the previous poll.
    Telemetry {
        /// Originating device.
        device: String,
        /// Immutable snapshot; observers never reach into live model state.
        telemetry: Telemetry,
        /// When the snapshot was taken.
        at: DateTime<Utc>,
    },
    /// An enable attempt failed; the model is back in OFF and retryable.
    EnableFailed {
        /// Originating device.
        device: String,
        /// What went wrong during INITIALIZING.
        error: DeviceError,
    },
}

enum ModelMsg {
    Enable,
    Disable,
    Reset,
    Submit {
        cmd: DeviceCommand,
        reply: oneshot::Sender<Result<DeviceResponse, DeviceError>>,
    },
    Shutdown,
}

type ControllerFactory<C> = Box<dyn FnMut() -> BoxFuture<'static, Result<C, IoError>> + Send>;

/// Handle to one device worker.
///
/// Clones share the same worker. Dropping every handle shuts the worker down
/// (its mailbox closes), but [`DeviceModel::shutdown`] should be preferred so
/// teardown is bounded in time.
#[derive(Clone)]
pub struct DeviceModel {
    id: Arc<str>,
    tx: mpsc::Sender<ModelMsg>,
    events: broadcast::Sender<DeviceEvent>,
    state_rx: watch::Receiver<DeviceState>,
    task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl DeviceModel {
    /// Spawn a worker for one device.
    ///
    /// `factory` is invoked on the worker task during every enable attempt and
    /// must yield a freshly connected controller; its transport is released
    /// again on disable, on transport failure, and on shutdown.
    pub fn spawn<C, F, Fut>(id: impl Into<String>, poll_interval: Duration, mut factory: F) -> Self
    where
        C: DeviceController,
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<C, IoError>> + Send + 'static,
    {
        let id = id.into();
        let (tx, rx) = mpsc::channel(MAILBOX_CAPACITY);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (state_tx, state_rx) = watch::channel(DeviceState::Off);

        let factory: ControllerFactory<C> = Box::new(move || Box::pin(factory()));
        let worker = Worker {
            id: id.clone(),
            factory,
            controller: None,
            state: DeviceState::Off,
            last_telemetry: None,
            events: events.clone(),
            state_tx,
        };
        let task = tokio::spawn(worker.run(rx, poll_interval));

        Self {
            id: Arc::from(id),
            tx,
            events,
            state_rx,
            task: Arc::new(Mutex::new(Some(task))),
        }
    }

    /// Device identifier.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Current lifecycle state.
    pub fn state(&self) -> DeviceState {
        *self.state_rx.borrow()
    }

    /// Subscribe to state/telemetry notifications, in production order.
    pub fn subscribe(&self) -> broadcast::Receiver<DeviceEvent> {
        self.events.subscribe()
    }

    /// Request OFF → INITIALIZING → READY. Failure is non-fatal and reported
    /// via [`DeviceEvent::EnableFailed`]; the model stays usable for retry.
    pub async fn enable(&self) {
        self.send(ModelMsg::Enable).await;
    }

    /// Stop polling, release the transport, return to OFF.
    pub async fn disable(&self) {
        self.send(ModelMsg::Disable).await;
    }

    /// Acknowledge an ERROR state, returning to OFF.
    pub async fn reset(&self) {
        self.send(ModelMsg::Reset).await;
    }

    /// Submit a command for execution on the worker.
    ///
    /// Rejects immediately with [`DeviceError::NotReady`] when the model is
    /// not READY; otherwise the command is queued FIFO behind earlier ones and
    /// never interleaved with polling. Returns [`DeviceError::Cancelled`] when
    /// the worker abandons the command during disable/shutdown.
    pub async fn submit(&self, cmd: DeviceCommand) -> Result<DeviceResponse, DeviceError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(ModelMsg::Submit {
                cmd,
                reply: reply_tx,
            })
            .await
            .map_err(|_| DeviceError::Cancelled)?;
        reply_rx.await.map_err(|_| DeviceError::Cancelled)?
    }

    /// Wait until the model reaches `target`, or `timeout` elapses.
    pub async fn wait_for_state(&self, target: DeviceState, timeout: Duration) -> bool {
        let mut rx = self.state_rx.clone();
        let reached = tokio::time::timeout(timeout, async move {
            loop {
                if *rx.borrow_and_update() == target {
                    return true;
                }
                if rx.changed().await.is_err() {
                    return false;
                }
            }
        })
        .await;
        matches!(reached, Ok(true))
    }

    /// Two-phase shutdown: ask the worker to stop, wait up to `grace`, then
    /// force-abort the task. Safe to call more than once.
    pub async fn shutdown(&self, grace: Duration) {
        let _ = tokio::time::timeout(grace, self.tx.send(ModelMsg::Shutdown)).await;

        if let Some(mut handle) = self.task.lock().await.take() {
            if tokio::time::timeout(grace, &mut handle).await.is_err() {
                warn!(device = %self.id, "graceful stop timed out, aborting worker");
                handle.abort();
                let _ = handle.await;
            }
        }
    }

    async fn send(&self, msg: ModelMsg) {
        if self.tx.send(msg).await.is_err() {
            warn!(device = %self.id, "worker is gone, request dropped");
        }
    }
}

struct Worker<C: DeviceController> {
    id: String,
    factory: ControllerFactory<C>,
    controller: Option<C>,
    state: DeviceState,
    last_telemetry: Option<Telemetry>,
    events: broadcast::Sender<DeviceEvent>,
    state_tx: watch::Sender<DeviceState>,
}

impl<C: DeviceController> Worker<C> {
    async fn run(mut self, mut rx: mpsc::Receiver<ModelMsg>, poll_interval: Duration) {
        let mut poll = tokio::time::interval(poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;

                msg = rx.recv() => match msg {
                    Some(ModelMsg::Enable) => self.handle_enable().await,
                    Some(ModelMsg::Disable) => self.handle_disable().await,
                    Some(ModelMsg::Reset) => self.handle_reset(),
                    Some(ModelMsg::Submit { cmd, reply }) => self.handle_submit(cmd, reply).await,
                    Some(ModelMsg::Shutdown) | None => break,
                },
                _ = poll.tick(), if self.state == DeviceState::Ready => self.handle_poll().await,
            }
        }

        // Transport must be released on every exit path; queued Submit
        // messages left in the mailbox resolve as Cancelled when their
        // reply senders drop.
        self.release_controller().await;
        debug!(device = %self.id, "worker stopped");
    }

    async fn handle_enable(&mut self) {
        match self.state {
            DeviceState::Off => {}
            DeviceState::Error => {
                warn!(device = %self.id, "enable ignored in ERROR state, reset first");
                return;
            }
            _ => return,
        }

        self.set_state(DeviceState::Initializing);

        let mut controller = match (self.factory)().await {
            Ok(c) => c,
            Err(e) => {
                self.set_state(DeviceState::Off);
                self.emit_enable_failed(io_to_device(e));
                return;
            }
        };

        match controller.probe().await {
            Ok(true) => {}
            Ok(false) => {
                controller.close().await;
                self.set_state(DeviceState::Off);
                self.emit_enable_failed(DeviceError::Timeout);
                return;
            }
            Err(e) => {
                controller.close().await;
                self.set_state(DeviceState::Off);
                self.emit_enable_failed(io_to_device(e));
                return;
            }
        }

        if let Err(e) = controller.init().await {
            controller.close().await;
            self.set_state(DeviceState::Off);
            self.emit_enable_failed(e);
            return;
        }

        self.controller = Some(controller);
        self.last_telemetry = None;
        self.set_state(DeviceState::Ready);
        info!(device = %self.id, "device ready");
    }

    async fn handle_disable(&mut self) {
        self.release_controller().await;
        // ERROR is only left via explicit reset; disable from any other
        // state lands in OFF.
        if self.state != DeviceState::Error {
            self.set_state(DeviceState::Off);
        }
    }

    fn handle_reset(&mut self) {
        if self.state == DeviceState::Error {
            self.set_state(DeviceState::Off);
        }
    }

    async fn handle_submit(
        &mut self,
        cmd: DeviceCommand,
        reply: oneshot::Sender<Result<DeviceResponse, DeviceError>>,
    ) {
        if self.state != DeviceState::Ready {
            let _ = reply.send(Err(DeviceError::NotReady));
            return;
        }

        let result = match self.controller.as_mut() {
            Some(controller) => controller.execute(&cmd).await,
            None => Err(DeviceError::NotReady),
        };

        if let Err(DeviceError::Io(ref io)) = result {
            error!(device = %self.id, error = %io, "transport failure, entering ERROR state");
            self.release_controller().await;
            self.set_state(DeviceState::Error);
        }

        let _ = reply.send(result);
    }

    async fn handle_poll(&mut self) {
        let result = match self.controller.as_mut() {
            Some(controller) => controller.poll_status().await,
            None => return,
        };

        match result {
            Ok(telemetry) => {
                if self.last_telemetry.as_ref() != Some(&telemetry) {
                    self.last_telemetry = Some(telemetry.clone());
                    let _ = self.events.send(DeviceEvent::Telemetry {
                        device: self.id.clone(),
                        telemetry,
                        at: Utc::now(),
                    });
                }
            }
            Err(e) => {
                error!(device = %self.id, error = %e, "status poll failed, entering ERROR state");
                self.release_controller().await;
                self.set_state(DeviceState::Error);
            }
        }
    }

    async fn release_controller(&mut self) {
        if let Some(mut controller) = self.controller.take() {
            controller.close().await;
        }
        self.last_telemetry = None;
    }

    fn set_state(&mut self, state: DeviceState) {
        if self.state == state {
            return;
        }
        debug!(device = %self.id, from = ?self.state, to = ?state, "state transition");
        self.state = state;
        self.state_tx.send_replace(state);
        let _ = self.events.send(DeviceEvent::StateChanged {
            device: self.id.clone(),
            state,
        });
    }

    fn emit_enable_failed(&self, error: DeviceError) {
        warn!(device = %self.id, error = %error, "enable failed");
        let _ = self.events.send(DeviceEvent::EnableFailed {
            device: self.id.clone(),
            error,
        });
    }
}
