//! Calibration of the brake.
//!
//! A calibration run walks the brake through a fixed sequence of states
//! reported in its status packets: the rider spins up to calibration speed,
//! coasts down until the wheel stops, resumes pedalling, and the brake then
//! hands out its calibration value. [`CalibrationStateMachine`] holds the
//! sequence as data; [`Calibration`] drives one run against the radio and
//! reports progress through a [`CalibrationCallback`].

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{
    sync::Mutex,
    task::JoinHandle,
    time::{self, Instant},
};
use tracing::{debug, error, info, warn};

use crate::{
    error::{BrakeError, Result},
    protocol::{self, Packet},
    radio::SendCondition,
    sender::{MessageSender, PauseGuard, Priority, RetryBudget},
    types::{CalibrationState, SessionConfig},
};

/// Legal transitions, one successor per state
const TRANSITIONS: [(CalibrationState, CalibrationState); 7] = [
    (
        CalibrationState::CalibrationMode,
        CalibrationState::CalibrationRequested,
    ),
    (
        CalibrationState::CalibrationRequested,
        CalibrationState::UpToSpeed,
    ),
    (CalibrationState::UpToSpeed, CalibrationState::NoError),
    (CalibrationState::NoError, CalibrationState::Stopped),
    (
        CalibrationState::Stopped,
        CalibrationState::NonCalibrationMode,
    ),
    (
        CalibrationState::NonCalibrationMode,
        CalibrationState::CalibrationValueReady,
    ),
    (
        CalibrationState::CalibrationValueReady,
        CalibrationState::Calibrated,
    ),
];

/// Every calibration state
pub const ALL_STATES: [CalibrationState; 8] = [
    CalibrationState::CalibrationMode,
    CalibrationState::CalibrationRequested,
    CalibrationState::UpToSpeed,
    CalibrationState::NoError,
    CalibrationState::Stopped,
    CalibrationState::NonCalibrationMode,
    CalibrationState::CalibrationValueReady,
    CalibrationState::Calibrated,
];

const START_SEND_CAP: Duration = Duration::from_secs(2);
const RESUME_SEND_CAP: Duration = Duration::from_secs(10);
const RESUME_SEND_ATTEMPTS: u32 = 5;
const MIN_SEND_SLICE: Duration = Duration::from_secs(1);
const VALUE_SEND_CAP: Duration = Duration::from_secs(2);

/// The single legal successor of `state`
#[must_use]
pub fn successor(state: CalibrationState) -> Option<CalibrationState> {
    TRANSITIONS
        .iter()
        .find(|(from, _)| *from == state)
        .map(|(_, to)| *to)
}

/// Outcome of a transition request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Already in the requested state
    Unchanged,
    /// The brake is in normal mode and must be told to enter calibration
    RequestCalibrationMode,
    /// Moved into the state
    Entered(CalibrationState),
}

/// Calibration sequence, `None` while uninitialized
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CalibrationStateMachine {
    current: Option<CalibrationState>,
}

impl CalibrationStateMachine {
    /// Create an uninitialized machine
    #[must_use]
    pub const fn new() -> Self {
        Self { current: None }
    }

    /// Current state
    #[must_use]
    pub const fn current(&self) -> Option<CalibrationState> {
        self.current
    }

    /// Back to uninitialized
    pub fn reset(&mut self) {
        self.current = None;
    }

    /// Request a move to `target`
    ///
    /// # Errors
    ///
    /// Returns [`BrakeError::IllegalTransition`] if `target` is not the legal
    /// successor of the current state. The state is left unchanged.
    pub fn request(&mut self, target: CalibrationState) -> Result<Transition> {
        if self.current == Some(target) {
            return Ok(Transition::Unchanged);
        }

        let legal = match self.current {
            None if target == CalibrationState::NonCalibrationMode => {
                return Ok(Transition::RequestCalibrationMode);
            }
            None => target == CalibrationState::CalibrationMode,
            Some(from) => successor(from) == Some(target),
        };

        if !legal {
            return Err(BrakeError::IllegalTransition {
                from: self.current,
                to: target,
            });
        }

        self.current = Some(target);
        Ok(Transition::Entered(target))
    }
}

/// Progress of a calibration run
///
/// Methods are called from the session's tasks and must not block.
pub trait CalibrationCallback: Send + Sync {
    /// Rider should start pedalling towards calibration speed
    fn on_request_start_pedalling(&self);

    /// Calibration speed reached, rider should stop pedalling
    fn on_reached_calibration_speed(&self) {}

    /// Still below calibration speed
    fn on_below_speed_reminder(&self, _speed: f64) {}

    /// Wheel stopped, rider should pedal again
    fn on_request_resume_pedalling(&self) {}

    /// Calibration finished with `value`
    fn on_success(&self, value: f64);

    /// Calibration failed, called at most once per run
    fn on_failure(&self, error: BrakeError);
}

/// Timing and bounds of calibration runs
#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationConfig {
    /// Status silence after which the wheel counts as stopped
    pub radio_silence: Duration,
    /// Speed the rider must reach in km/h
    pub calibration_speed_kmh: f64,
    /// Restarts allowed after illegal transitions
    pub max_restarts: u32,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self::from(&SessionConfig::default())
    }
}

impl From<&SessionConfig> for CalibrationConfig {
    fn from(config: &SessionConfig) -> Self {
        Self {
            radio_silence: config.radio_silence(),
            calibration_speed_kmh: config.calibration_speed_kmh,
            max_restarts: config.max_calibration_restarts,
        }
    }
}

enum Event {
    StartPedalling,
    ReachedSpeed,
    BelowSpeed(f64),
    ResumePedalling,
    Success(f64),
    Failure(BrakeError),
}

/// Callback invocation taken out of the locked run
struct Notice {
    callback: Arc<dyn CalibrationCallback>,
    event: Event,
}

impl Notice {
    fn new(attempt: &Attempt, event: Event) -> Self {
        Self {
            callback: Arc::clone(&attempt.callback),
            event,
        }
    }

    fn deliver(notice: Option<Self>) {
        if let Some(notice) = notice {
            notice.deliver_now();
        }
    }

    fn deliver_now(self) {
        let callback = self.callback.as_ref();
        match self.event {
            Event::StartPedalling => callback.on_request_start_pedalling(),
            Event::ReachedSpeed => callback.on_reached_calibration_speed(),
            Event::BelowSpeed(speed) => callback.on_below_speed_reminder(speed),
            Event::ResumePedalling => callback.on_request_resume_pedalling(),
            Event::Success(value) => callback.on_success(value),
            Event::Failure(error) => callback.on_failure(error),
        }
    }
}

struct Attempt {
    run: u64,
    id: u64,
    machine: CalibrationStateMachine,
    callback: Arc<dyn CalibrationCallback>,
    deadline: Instant,
    restarts: u32,
    start_in_flight: bool,
    watching_speed: bool,
    reached_speed: bool,
    deadline_task: Option<JoinHandle<()>>,
    silence_task: Option<JoinHandle<()>>,
    _pause: PauseGuard,
}

impl Attempt {
    fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    fn disarm_silence(&mut self) {
        if let Some(task) = self.silence_task.take() {
            task.abort();
        }
    }

    fn teardown(mut self) -> Arc<dyn CalibrationCallback> {
        self.disarm_silence();
        if let Some(task) = self.deadline_task.take() {
            task.abort();
        }
        self.callback
    }
}

/// Drives calibration runs for one session
pub struct Calibration {
    sender: Arc<MessageSender>,
    config: CalibrationConfig,
    attempt: Mutex<Option<Attempt>>,
    next_id: AtomicU64,
}

impl Calibration {
    /// Create an idle orchestrator sending through `sender`
    #[must_use]
    pub fn new(sender: Arc<MessageSender>, config: CalibrationConfig) -> Self {
        Self {
            sender,
            config,
            attempt: Mutex::new(None),
            next_id: AtomicU64::new(1),
        }
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Start a run reporting to `callback`, failing once `timeout` has elapsed
    ///
    /// Polling is paused until the run ends.
    ///
    /// # Errors
    ///
    /// Returns [`BrakeError::CalibrationInProgress`] if a run is active, or
    /// [`BrakeError::InvalidParameters`] if `timeout` is too large to
    /// schedule.
    pub async fn start(
        self: &Arc<Self>,
        callback: Arc<dyn CalibrationCallback>,
        timeout: Duration,
    ) -> Result<()> {
        let deadline = Instant::now().checked_add(timeout).ok_or_else(|| {
            BrakeError::InvalidParameters(format!(
                "Calibration timeout of {}s is out of range",
                timeout.as_secs()
            ))
        })?;

        let mut slot = self.attempt.lock().await;
        if slot.is_some() {
            return Err(BrakeError::CalibrationInProgress);
        }

        let run = self.next_id();
        let deadline_task = self.spawn_deadline(run, deadline);

        info!("Calibration started, {:?} to complete", timeout);
        *slot = Some(Attempt {
            run,
            id: self.next_id(),
            machine: CalibrationStateMachine::new(),
            callback: Arc::clone(&callback),
            deadline,
            restarts: 0,
            start_in_flight: false,
            watching_speed: false,
            reached_speed: false,
            deadline_task: Some(deadline_task),
            silence_task: None,
            _pause: self.sender.pause(),
        });
        drop(slot);

        callback.on_request_start_pedalling();
        Ok(())
    }

    /// Stop the active run without reporting, returns whether one was active
    pub async fn stop(&self) -> bool {
        let attempt = self.attempt.lock().await.take();
        attempt.map_or(false, |attempt| {
            info!("Calibration stopped");
            attempt.teardown();
            true
        })
    }

    /// Stop the active run from synchronous code, unless the run is busy
    ///
    /// Callbacks are invoked without the run locked, so this succeeds from
    /// inside a [`CalibrationCallback`].
    pub fn try_stop(&self) -> bool {
        self.attempt
            .try_lock()
            .ok()
            .and_then(|mut slot| slot.take())
            .map(Attempt::teardown)
            .is_some()
    }

    /// Whether a run is active
    pub async fn is_active(&self) -> bool {
        self.attempt.lock().await.is_some()
    }

    /// State of the active run
    pub async fn state(&self) -> Option<CalibrationState> {
        self.attempt
            .lock()
            .await
            .as_ref()
            .and_then(|attempt| attempt.machine.current())
    }

    /// Feed a status packet
    pub async fn on_status(self: &Arc<Self>, packet: Packet) {
        let notice = {
            let mut slot = self.attempt.lock().await;
            let Some(attempt) = slot.as_mut() else {
                return;
            };

            if attempt.silence_task.is_some() {
                attempt.disarm_silence();
                attempt.silence_task = Some(self.spawn_silence(attempt.id));
            }

            let Some(target) = protocol::classify_status(&packet) else {
                warn!("Unknown status packet: {}", packet);
                return;
            };

            self.apply(&mut slot, target, Some(packet))
        };
        Notice::deliver(notice);
    }

    /// Feed a measured speed in km/h
    pub async fn on_speed(&self, speed: f64) {
        let notice = {
            let mut slot = self.attempt.lock().await;
            let Some(attempt) = slot.as_mut() else {
                return;
            };
            if !attempt.watching_speed || attempt.reached_speed {
                return;
            }

            if speed >= self.config.calibration_speed_kmh {
                attempt.reached_speed = true;
                info!("Calibration speed reached at {:.1} km/h", speed);
                Notice::new(attempt, Event::ReachedSpeed)
            } else {
                Notice::new(attempt, Event::BelowSpeed(speed))
            }
        };
        notice.deliver_now();
    }

    fn apply(
        self: &Arc<Self>,
        slot: &mut Option<Attempt>,
        target: CalibrationState,
        packet: Option<Packet>,
    ) -> Option<Notice> {
        let attempt = slot.as_mut()?;

        match attempt.machine.request(target) {
            Ok(Transition::Unchanged) => None,
            Ok(Transition::RequestCalibrationMode) => {
                if !attempt.start_in_flight {
                    attempt.start_in_flight = true;
                    debug!("Brake in normal mode, requesting calibration mode");
                    let budget = RetryBudget::single(attempt.remaining().min(START_SEND_CAP));
                    self.send_control(attempt.id, &protocol::PACKET_START_CALIBRATION, budget);
                }
                None
            }
            Ok(Transition::Entered(state)) => {
                info!("Calibration state: {}", state);
                self.enter(slot, state, packet)
            }
            Err(error) => self.restart(slot, error),
        }
    }

    fn enter(
        self: &Arc<Self>,
        slot: &mut Option<Attempt>,
        state: CalibrationState,
        packet: Option<Packet>,
    ) -> Option<Notice> {
        let attempt = slot.as_mut()?;

        match state {
            CalibrationState::CalibrationMode | CalibrationState::UpToSpeed => None,
            CalibrationState::CalibrationRequested => {
                attempt.watching_speed = true;
                None
            }
            CalibrationState::NoError => {
                attempt.watching_speed = false;
                attempt.disarm_silence();
                attempt.silence_task = Some(self.spawn_silence(attempt.id));
                None
            }
            CalibrationState::Stopped => {
                attempt.disarm_silence();
                Some(Notice::new(attempt, Event::ResumePedalling))
            }
            CalibrationState::NonCalibrationMode => {
                let budget = RetryBudget::split(
                    attempt.remaining().min(RESUME_SEND_CAP),
                    RESUME_SEND_ATTEMPTS,
                    MIN_SEND_SLICE,
                    START_SEND_CAP,
                );
                self.send_control(attempt.id, &protocol::PACKET_RESUME_AFTER_RESTART, budget);
                None
            }
            CalibrationState::CalibrationValueReady => {
                let budget = RetryBudget::single(attempt.remaining().min(VALUE_SEND_CAP));
                self.send_control(
                    attempt.id,
                    &protocol::PACKET_REQUEST_CALIBRATION_VALUE,
                    budget,
                );
                None
            }
            CalibrationState::Calibrated => {
                let value = packet.as_ref().map_or(0.0, protocol::decode_calibration_value);
                let attempt = slot.take()?;
                info!("Calibration complete: {:.1}", value);
                Some(Notice {
                    callback: attempt.teardown(),
                    event: Event::Success(value),
                })
            }
        }
    }

    fn restart(self: &Arc<Self>, slot: &mut Option<Attempt>, error: BrakeError) -> Option<Notice> {
        let attempt = slot.as_mut()?;

        if attempt.restarts >= self.config.max_restarts || attempt.remaining().is_zero() {
            error!(
                "Calibration failed after {} restarts: {}",
                attempt.restarts, error
            );
            return Self::fail(slot, error);
        }

        attempt.restarts += 1;
        warn!(
            "{}, restarting calibration ({}/{}) with {:?} left",
            error,
            attempt.restarts,
            self.config.max_restarts,
            attempt.remaining()
        );

        attempt.disarm_silence();
        attempt.id = self.next_id();
        attempt.machine.reset();
        attempt.start_in_flight = false;
        attempt.watching_speed = false;
        attempt.reached_speed = false;
        Some(Notice::new(attempt, Event::StartPedalling))
    }

    fn fail(slot: &mut Option<Attempt>, error: BrakeError) -> Option<Notice> {
        slot.take().map(|attempt| Notice {
            callback: attempt.teardown(),
            event: Event::Failure(error),
        })
    }

    async fn finish_send(&self, id: u64, result: Result<()>) {
        let notice = {
            let mut slot = self.attempt.lock().await;
            let Some(attempt) = slot.as_mut().filter(|attempt| attempt.id == id) else {
                debug!("Discarding late result of calibration attempt {}", id);
                return;
            };

            match result {
                Ok(()) => {
                    attempt.start_in_flight = false;
                    None
                }
                Err(error) => {
                    warn!("Calibration send failed: {}", error);
                    Self::fail(&mut slot, error)
                }
            }
        };
        Notice::deliver(notice);
    }

    fn send_control(self: &Arc<Self>, id: u64, opcode: &[u8], budget: RetryBudget) {
        let this = Arc::clone(self);
        let packet = match protocol::encode(opcode) {
            Ok(packet) => packet,
            Err(error) => {
                tokio::spawn(async move { this.finish_send(id, Err(error)).await });
                return;
            }
        };

        // broadcast data, never acknowledged by the brake
        let done = self.sender.submit(
            packet,
            SendCondition::ChannelTx,
            budget,
            Priority::Control,
        );
        tokio::spawn(async move {
            let result = done.await.unwrap_or(Err(BrakeError::Interrupted));
            this.finish_send(id, result).await;
        });
    }

    fn spawn_deadline(self: &Arc<Self>, run: u64, deadline: Instant) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            time::sleep_until(deadline).await;

            let notice = {
                let mut slot = this.attempt.lock().await;
                let Some(attempt) = slot.as_mut().filter(|attempt| attempt.run == run) else {
                    return;
                };
                // the handle is ours, keep teardown from aborting this task
                attempt.deadline_task.take();
                error!("Calibration deadline expired");
                Self::fail(&mut slot, BrakeError::CalibrationTimeout)
            };
            Notice::deliver(notice);
        })
    }

    fn spawn_silence(self: &Arc<Self>, id: u64) -> JoinHandle<()> {
        let this = Arc::clone(self);
        let silence = self.config.radio_silence;
        tokio::spawn(async move {
            time::sleep(silence).await;

            let notice = {
                let mut slot = this.attempt.lock().await;
                let Some(attempt) = slot.as_mut().filter(|attempt| attempt.id == id) else {
                    return;
                };
                attempt.silence_task.take();
                debug!("No status for {:?}, wheel stopped", silence);
                this.apply(&mut slot, CalibrationState::Stopped, None)
            };
            Notice::deliver(notice);
        })
    }
}
