//! Schedule execution against the device models.
//!
//! The coordinator runs on its own task and is driven through a handle, same
//! shape as [`DeviceModel`]: a bounded control mailbox in, a broadcast event
//! stream out. It owns the cross-device ordering the models themselves do not
//! provide: stage motion must have finished before the camera acquires, and a
//! deformation image is never taken before a reference image exists.
//!
//! A run halts loudly on the first failure. The coordinator then returns to
//! idle with the failed step reported via [`SequenceEvent::Halted`]; the
//! operator can fix the cause and start again.

use crate::controller::{DeviceCommand, DeviceResponse};
use crate::error::{DeviceError, SequenceError};
use crate::model::DeviceModel;
use crate::sequence::schedule::{Schedule, ScheduleAction};
use crate::sequence::timer::SleepTimer;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const MAILBOX_CAPACITY: usize = 16;
const EVENT_CAPACITY: usize = 256;
/// Re-check interval while waiting for stage motion to finish.
const MOTION_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// The device models a schedule runs against.
#[derive(Clone)]
pub struct SequenceDevices {
    /// Motorized translation stage.
    pub stage: DeviceModel,
    /// Still camera.
    pub camera: DeviceModel,
    /// Laser distance head, read by TEMP steps.
    pub laser: DeviceModel,
}

/// Progress notification for a schedule run.
#[derive(Debug, Clone)]
pub enum SequenceEvent {
    /// A schedule run began.
    Started,
    /// The step at `index` began executing.
    StepStarted {
        /// 0-based schedule index.
        index: usize,
        /// The action being executed.
        action: ScheduleAction,
    },
    /// The step at `index` completed.
    StepCompleted {
        /// 0-based schedule index.
        index: usize,
        /// The action that completed.
        action: ScheduleAction,
    },
    /// The run paused; a running SLEEP banked its elapsed time.
    Paused,
    /// The run resumed.
    Resumed,
    /// The run was stopped by the operator.
    Stopped,
    /// The run halted on a failure and the coordinator is idle again.
    Halted(SequenceError),
    /// The run reached END (or ran off the end of the schedule).
    Finished,
}

enum CoordMsg {
    Start(Schedule),
    RunSingle(ScheduleAction),
    Pause,
    Resume,
    Stop,
    Shutdown,
}

#[derive(Clone, Copy, PartialEq)]
enum Flow {
    Continue,
    Stopped,
}

enum Outcome {
    Finished,
    Stopped,
}

/// Handle to the sequence coordinator task.
#[derive(Clone)]
pub struct SequenceCoordinator {
    tx: mpsc::Sender<CoordMsg>,
    events: broadcast::Sender<SequenceEvent>,
    task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl SequenceCoordinator {
    /// Spawn the coordinator task over the given device models.
    pub fn spawn(devices: SequenceDevices) -> Self {
        let (tx, rx) = mpsc::channel(MAILBOX_CAPACITY);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        let worker = Worker {
            devices,
            rx,
            events: events.clone(),
            has_reference: false,
            shutting_down: false,
        };
        let task = tokio::spawn(worker.run());

        Self {
            tx,
            events,
            task: Arc::new(Mutex::new(Some(task))),
        }
    }

    /// Subscribe to run progress events, in production order.
    pub fn subscribe(&self) -> broadcast::Receiver<SequenceEvent> {
        self.events.subscribe()
    }

    /// Start executing a schedule. Ignored if a run is already in progress.
    pub async fn start(&self, schedule: Schedule) {
        self.send(CoordMsg::Start(schedule)).await;
    }

    /// Execute one operator-triggered action outside a schedule run.
    ///
    /// Prerequisite tracking is shared with scheduled runs, so a single REF
    /// satisfies a later single DEFO.
    pub async fn run_single(&self, action: ScheduleAction) {
        self.send(CoordMsg::RunSingle(action)).await;
    }

    /// Pause the current run. A running SLEEP banks its elapsed time and
    /// resumes with the remainder.
    pub async fn pause(&self) {
        self.send(CoordMsg::Pause).await;
    }

    /// Resume a paused run.
    pub async fn resume(&self) {
        self.send(CoordMsg::Resume).await;
    }

    /// Stop the current run at the next step boundary (immediately during
    /// SLEEP, pause, or a motion wait).
    pub async fn stop(&self) {
        self.send(CoordMsg::Stop).await;
    }

    /// Two-phase shutdown: graceful stop request, then abort after `grace`.
    pub async fn shutdown(&self, grace: Duration) {
        let _ = tokio::time::timeout(grace, self.tx.send(CoordMsg::Shutdown)).await;

        if let Some(mut handle) = self.task.lock().await.take() {
            if tokio::time::timeout(grace, &mut handle).await.is_err() {
                warn!("graceful stop timed out, aborting coordinator");
                handle.abort();
                let _ = handle.await;
            }
        }
    }

    async fn send(&self, msg: CoordMsg) {
        if self.tx.send(msg).await.is_err() {
            warn!("coordinator is gone, request dropped");
        }
    }
}

struct Worker {
    devices: SequenceDevices,
    rx: mpsc::Receiver<CoordMsg>,
    events: broadcast::Sender<SequenceEvent>,
    has_reference: bool,
    shutting_down: bool,
}

impl Worker {
    async fn run(mut self) {
        while !self.shutting_down {
            let Some(msg) = self.rx.recv().await else { break };
            match msg {
                CoordMsg::Start(schedule) => self.execute_schedule(schedule).await,
                CoordMsg::RunSingle(action) => self.execute_single(action).await,
                CoordMsg::Pause | CoordMsg::Resume | CoordMsg::Stop => {
                    debug!("control request ignored while idle");
                }
                CoordMsg::Shutdown => break,
            }
        }
        debug!("sequence coordinator stopped");
    }

    async fn execute_schedule(&mut self, schedule: Schedule) {
        info!(entries = schedule.len(), "schedule run started");
        self.emit(SequenceEvent::Started);
        self.has_reference = false;

        match self.run_schedule(&schedule).await {
            Ok(Outcome::Finished) => {
                info!("schedule run finished");
                self.emit(SequenceEvent::Finished);
            }
            Ok(Outcome::Stopped) => {
                info!("schedule run stopped by operator");
                self.emit(SequenceEvent::Stopped);
            }
            Err(e) => {
                error!(error = %e, "schedule run halted");
                self.emit(SequenceEvent::Halted(e));
            }
        }
    }

    async fn run_schedule(&mut self, schedule: &Schedule) -> Result<Outcome, SequenceError> {
        schedule.validate()?;

        let mut cursor = 0;
        while let Some(action) = schedule.get(cursor) {
            if self.checkpoint().await == Flow::Stopped {
                return Ok(Outcome::Stopped);
            }

            let action = action.clone();
            debug!(index = cursor, action = %action, "step started");
            self.emit(SequenceEvent::StepStarted {
                index: cursor,
                action: action.clone(),
            });

            match &action {
                ScheduleAction::Goto(target) => {
                    let target = *target;
                    self.emit(SequenceEvent::StepCompleted {
                        index: cursor,
                        action,
                    });
                    cursor = target;
                    continue;
                }
                ScheduleAction::End => {
                    self.emit(SequenceEvent::StepCompleted {
                        index: cursor,
                        action,
                    });
                    return Ok(Outcome::Finished);
                }
                ScheduleAction::Sleep(secs) => {
                    if self.run_sleep(Duration::from_secs(*secs)).await == Flow::Stopped {
                        return Ok(Outcome::Stopped);
                    }
                }
                other => {
                    if self.run_action(other).await? == Flow::Stopped {
                        return Ok(Outcome::Stopped);
                    }
                }
            }

            self.emit(SequenceEvent::StepCompleted {
                index: cursor,
                action,
            });
            cursor += 1;
        }
        Ok(Outcome::Finished)
    }

    async fn execute_single(&mut self, action: ScheduleAction) {
        info!(action = %action, "single action");
        self.emit(SequenceEvent::StepStarted {
            index: 0,
            action: action.clone(),
        });

        let result = match &action {
            // Cursor control is meaningless outside a run.
            ScheduleAction::Goto(_) | ScheduleAction::End => Ok(Flow::Continue),
            ScheduleAction::Sleep(secs) => {
                if self.run_sleep(Duration::from_secs(*secs)).await == Flow::Stopped {
                    self.emit(SequenceEvent::Stopped);
                    return;
                }
                Ok(Flow::Continue)
            }
            other => self.run_action(other).await,
        };

        match result {
            Ok(Flow::Stopped) => self.emit(SequenceEvent::Stopped),
            Ok(Flow::Continue) => self.emit(SequenceEvent::StepCompleted { index: 0, action }),
            Err(e) => {
                error!(error = %e, "single action failed");
                self.emit(SequenceEvent::Halted(e));
            }
        }
    }

    async fn run_action(&mut self, action: &ScheduleAction) -> Result<Flow, SequenceError> {
        match action {
            ScheduleAction::Set => {
                return self.acquire_frame().await;
            }
            ScheduleAction::Ref => {
                if self.acquire_frame().await? == Flow::Stopped {
                    return Ok(Flow::Stopped);
                }
                self.has_reference = true;
            }
            ScheduleAction::Defo => {
                self.require_reference("DEFO")?;
                return self.acquire_frame().await;
            }
            ScheduleAction::FileSet(path) => {
                self.check_image_file(path).await?;
            }
            ScheduleAction::FileRef(path) => {
                self.check_image_file(path).await?;
                self.has_reference = true;
            }
            ScheduleAction::FileDefo(path) => {
                self.require_reference("FILE_DEFO")?;
                self.check_image_file(path).await?;
            }
            ScheduleAction::Temp => {
                let value = self.read_measurement().await?;
                info!(value, "measurement value recorded");
            }
            // Handled by the caller.
            ScheduleAction::Sleep(_) | ScheduleAction::Goto(_) | ScheduleAction::End => {}
        }
        Ok(Flow::Continue)
    }

    /// Prerequisite gate for deformation images; checked before any device
    /// I/O so a refused DEFO leaves the camera and stage untouched.
    fn require_reference(&self, action: &str) -> Result<(), SequenceError> {
        if self.has_reference {
            Ok(())
        } else {
            Err(SequenceError::ActionWithoutPrerequisite {
                action: action.to_string(),
                prerequisite: "REF".to_string(),
            })
        }
    }

    async fn acquire_frame(&mut self) -> Result<Flow, SequenceError> {
        if self.wait_motion_idle().await? == Flow::Stopped {
            return Ok(Flow::Stopped);
        }
        match self.devices.camera.submit(DeviceCommand::AcquireFrame).await {
            Ok(DeviceResponse::Frame(frame)) => {
                info!(frame = frame.id, "frame acquired");
                Ok(Flow::Continue)
            }
            Ok(other) => Err(SequenceError::Device(DeviceError::Malformed(format!(
                "unexpected acquire response {:?}",
                other
            )))),
            Err(e) => Err(device_failure("camera", e)),
        }
    }

    /// Poll the stage until motion is done, re-checking the control mailbox
    /// between polls so an operator stop or pause is honored even while the
    /// stage keeps reporting motion.
    async fn wait_motion_idle(&mut self) -> Result<Flow, SequenceError> {
        loop {
            match self.devices.stage.submit(DeviceCommand::QueryMoving).await {
                Ok(DeviceResponse::Moving(false)) => return Ok(Flow::Continue),
                Ok(DeviceResponse::Moving(true)) => {
                    tokio::select! {
                        _ = tokio::time::sleep(MOTION_POLL_INTERVAL) => {}
                        msg = self.rx.recv() => match msg {
                            Some(CoordMsg::Pause) => {
                                self.emit(SequenceEvent::Paused);
                                if !self.wait_for_resume().await {
                                    return Ok(Flow::Stopped);
                                }
                            }
                            Some(CoordMsg::Stop) => return Ok(Flow::Stopped),
                            Some(CoordMsg::Shutdown) | None => {
                                self.shutting_down = true;
                                return Ok(Flow::Stopped);
                            }
                            Some(CoordMsg::Resume) => {}
                            Some(_) => {
                                warn!("start request ignored while a schedule is running");
                            }
                        }
                    }
                }
                Ok(other) => {
                    return Err(SequenceError::Device(DeviceError::Malformed(format!(
                        "unexpected motion response {:?}",
                        other
                    ))));
                }
                Err(e) => return Err(device_failure("stage", e)),
            }
        }
    }

    async fn read_measurement(&mut self) -> Result<f64, SequenceError> {
        match self.devices.laser.submit(DeviceCommand::ReadValue).await {
            Ok(DeviceResponse::Value(value)) => Ok(value),
            Ok(other) => Err(SequenceError::Device(DeviceError::Malformed(format!(
                "unexpected measurement response {:?}",
                other
            )))),
            Err(e) => Err(device_failure("laser", e)),
        }
    }

    async fn check_image_file(&self, path: &Path) -> Result<(), SequenceError> {
        tokio::fs::metadata(path)
            .await
            .map_err(|e| SequenceError::Io(format!("{}: {}", path.display(), e)))?;
        Ok(())
    }

    /// Drain pending control requests between steps.
    async fn checkpoint(&mut self) -> Flow {
        loop {
            match self.rx.try_recv() {
                Ok(CoordMsg::Pause) => {
                    self.emit(SequenceEvent::Paused);
                    if !self.wait_for_resume().await {
                        return Flow::Stopped;
                    }
                }
                Ok(CoordMsg::Stop) => return Flow::Stopped,
                Ok(CoordMsg::Shutdown) => {
                    self.shutting_down = true;
                    return Flow::Stopped;
                }
                Ok(CoordMsg::Resume) => {}
                Ok(CoordMsg::Start(_) | CoordMsg::RunSingle(_)) => {
                    warn!("start request ignored while a schedule is running");
                }
                Err(TryRecvError::Empty) => return Flow::Continue,
                Err(TryRecvError::Disconnected) => {
                    self.shutting_down = true;
                    return Flow::Stopped;
                }
            }
        }
    }

    async fn wait_for_resume(&mut self) -> bool {
        loop {
            match self.rx.recv().await {
                Some(CoordMsg::Resume) => {
                    self.emit(SequenceEvent::Resumed);
                    return true;
                }
                Some(CoordMsg::Stop) => return false,
                Some(CoordMsg::Shutdown) | None => {
                    self.shutting_down = true;
                    return false;
                }
                Some(CoordMsg::Pause) => {}
                Some(_) => warn!("request ignored while paused"),
            }
        }
    }

    async fn run_sleep(&mut self, total: Duration) -> Flow {
        let mut timer = SleepTimer::new(total);
        timer.start();

        loop {
            tokio::select! {
                _ = tokio::time::sleep(timer.remaining()), if timer.is_running() => {
                    return Flow::Continue;
                }
                msg = self.rx.recv() => match msg {
                    Some(CoordMsg::Pause) => {
                        if timer.is_running() {
                            timer.pause();
                            debug!(remaining = ?timer.remaining(), "sleep paused");
                            self.emit(SequenceEvent::Paused);
                        }
                    }
                    Some(CoordMsg::Resume) => {
                        if !timer.is_running() {
                            timer.resume();
                            debug!(remaining = ?timer.remaining(), "sleep resumed");
                            self.emit(SequenceEvent::Resumed);
                        }
                    }
                    Some(CoordMsg::Stop) => return Flow::Stopped,
                    Some(CoordMsg::Shutdown) | None => {
                        self.shutting_down = true;
                        return Flow::Stopped;
                    }
                    Some(_) => warn!("request ignored during SLEEP"),
                }
            }
        }
    }

    fn emit(&self, event: SequenceEvent) {
        let _ = self.events.send(event);
    }
}

fn device_failure(device: &str, e: DeviceError) -> SequenceError {
    match e {
        DeviceError::NotReady => SequenceError::DeviceNotReady(device.to_string()),
        other => SequenceError::Device(other),
    }
}
