use futures::future::join_all;
use std::{future::Future, sync::Arc, time::Duration};
use tokio::{
    sync::{mpsc, Mutex},
    task::JoinHandle,
    time::{self, Instant},
};
use tracing::{debug, error, info, warn};

use crate::{
    calibration::{Calibration, CalibrationCallback},
    controller::{default_controller, ResistanceController, SharedController},
    correlator::RequestCorrelator,
    error::{BrakeError, Result},
    listener::{TelemetryListener, TelemetryListeners},
    model::{BrakeModel, SharedModel},
    protocol::{self, BrakePacket, Packet},
    radio::{
        ChannelId, ListenerId, MessageKind, NetworkKey, RadioChannel, RadioNode, SendCondition,
    },
    sender::{MessageSender, Priority, RetryBudget},
    types::{
        CadenceReset, CalibrationState, Mode, Parameters, SessionConfig, TelemetryKind,
        TelemetrySample,
    },
    watchdog::{ResetValue, WatchdogUpdater},
};

type VersionCallback = Box<dyn FnOnce(String) + Send>;
type VersionSlot = Arc<Mutex<Option<VersionCallback>>>;

struct Watchdogs {
    speed: WatchdogUpdater,
    power: WatchdogUpdater,
    cadence: WatchdogUpdater,
}

impl Watchdogs {
    fn new(
        config: &SessionConfig,
        model: &SharedModel,
        sink: &mpsc::UnboundedSender<TelemetrySample>,
    ) -> Self {
        let cadence_reset = match config.cadence_reset {
            CadenceReset::LastHeartRate => {
                info!("Stale cadence resets to the last heart rate");
                ResetValue::HeartRate(Arc::clone(model))
            }
            CadenceReset::Zero => ResetValue::Fixed(0.0),
        };
        let watchdog = |kind, reset_value| {
            WatchdogUpdater::new(
                kind,
                config.update_period(),
                config.reset_period(),
                reset_value,
                sink.clone(),
            )
        };

        Self {
            speed: watchdog(TelemetryKind::Speed, ResetValue::Fixed(0.0)),
            power: watchdog(TelemetryKind::Power, ResetValue::Fixed(0.0)),
            cadence: watchdog(TelemetryKind::Cadence, cadence_reset),
        }
    }

    async fn start(&self) {
        self.speed.start().await;
        self.power.start().await;
        self.cadence.start().await;
    }

    async fn stop(&self) {
        self.speed.stop().await;
        self.power.stop().await;
        self.cadence.stop().await;
    }
}

struct Running {
    channel: Arc<dyn RadioChannel>,
    rx_listener: ListenerId,
    controller: SharedController,
    overridden: bool,
    sender: Arc<MessageSender>,
    calibration: Arc<Calibration>,
    watchdogs: Arc<Watchdogs>,
    tasks: Vec<JoinHandle<()>>,
}

/// Everything the dispatch task needs to route inbound packets
struct Dispatcher {
    model: SharedModel,
    calibration: Arc<Calibration>,
    correlator: RequestCorrelator,
    watchdogs: Arc<Watchdogs>,
    version: VersionSlot,
}

impl Dispatcher {
    async fn run(self, mut rx: mpsc::UnboundedReceiver<Packet>) {
        while let Some(packet) = rx.recv().await {
            self.handle(packet).await;
        }
        debug!("Broadcast stream closed");
    }

    async fn handle(&self, packet: Packet) {
        match BrakePacket::parse(&packet) {
            BrakePacket::Status(status) => self.calibration.on_status(status).await,
            BrakePacket::Version(version) => {
                let callback = self.version.lock().await.take();
                match callback {
                    Some(callback) => {
                        info!("Brake software version {}", version);
                        callback(version);
                    }
                    None => debug!("Unrequested version packet {}", version),
                }
            }
            BrakePacket::DataRequest => {
                self.correlator.on_data_requested(&self.model).await;
            }
            BrakePacket::SpeedPower {
                power,
                speed,
                cadence,
                counter,
            } => {
                self.model.write().await.counter = counter;
                self.calibration.on_speed(speed).await;
                self.watchdogs.speed.update(speed).await;
                self.watchdogs.power.update(power).await;
                self.watchdogs.cadence.update(cadence).await;
            }
            BrakePacket::Balance {
                power_left,
                power_right,
                balance,
                temperature,
            } => {
                let mut model = self.model.write().await;
                model.power_left = power_left;
                model.power_right = power_right;
                model.power_balance = balance;
                model.brake_temperature = temperature;
            }
            BrakePacket::Unknown(packet) => debug!("Ignoring packet {}", packet),
        }
    }
}

/// Runs watchdog samples through the controller into the model and listeners
async fn dispatch_telemetry(
    mut samples: mpsc::UnboundedReceiver<TelemetrySample>,
    controller: SharedController,
    model: SharedModel,
    listeners: Arc<TelemetryListeners>,
) {
    while let Some(TelemetrySample { kind, value }) = samples.recv().await {
        match kind {
            TelemetryKind::Speed => {
                let virtual_speed = controller.lock().await.on_speed_change(value).await;
                let distance = {
                    let mut model = model.write().await;
                    model.set_speed(value, virtual_speed, Instant::now());
                    model.virtual_distance
                };
                let distance = controller.lock().await.on_distance_change(distance).await;

                listeners
                    .for_each(|listener| listener.on_speed_change(virtual_speed))
                    .await;
                listeners
                    .for_each(|listener| listener.on_distance_change(distance))
                    .await;
            }
            TelemetryKind::Power => {
                let virtual_power = controller.lock().await.on_power_change(value).await;
                model.write().await.power = value;
                listeners
                    .for_each(|listener| listener.on_power_change(virtual_power))
                    .await;
            }
            TelemetryKind::Cadence => {
                let virtual_cadence = controller.lock().await.on_cadence_change(value).await;
                model.write().await.cadence = value;
                listeners
                    .for_each(|listener| listener.on_cadence_change(virtual_cadence))
                    .await;
            }
        }
    }
}

/// A Bushido brake on one ANT channel
///
/// The session owns the channel for its whole life: [`start`](Self::start)
/// claims and configures it, [`stop`](Self::stop) hands it back. Telemetry is
/// smoothed by one watchdog per channel, transformed by the resistance
/// controller of the session's [`Mode`] and forwarded to every registered
/// [`TelemetryListener`].
///
/// # Examples
///
/// ```no_run
/// use std::sync::Arc;
/// use bushido_brake::{BrakeSession, Mode, Parameters, RadioNode, SessionConfig};
///
/// # async fn example(node: Arc<dyn RadioNode>) -> bushido_brake::Result<()> {
/// let session = BrakeSession::new(node, Mode::TargetSlope, SessionConfig::default());
/// session.start().await?;
///
/// session
///     .set_parameters(Parameters::TargetSlope {
///         slope_percent: 4.0,
///         rider_weight_kg: Some(72.0),
///     })
///     .await?;
///
/// session.stop().await?;
/// # Ok(())
/// # }
/// ```
pub struct BrakeSession {
    node: Arc<dyn RadioNode>,
    mode: Mode,
    config: SessionConfig,
    model: SharedModel,
    listeners: Arc<TelemetryListeners>,
    controller_override: Mutex<Option<Box<dyn ResistanceController>>>,
    version: VersionSlot,
    running: Mutex<Option<Running>>,
}

impl BrakeSession {
    /// Create a stopped session for `mode` on `node`
    #[must_use]
    pub fn new(node: Arc<dyn RadioNode>, mode: Mode, config: SessionConfig) -> Self {
        Self {
            node,
            mode,
            config,
            model: BrakeModel::shared(mode),
            listeners: Arc::new(TelemetryListeners::new()),
            controller_override: Mutex::new(None),
            version: Arc::new(Mutex::new(None)),
            running: Mutex::new(None),
        }
    }

    /// Ride mode fixed at creation
    #[must_use]
    pub const fn mode(&self) -> Mode {
        self.mode
    }

    /// Session configuration
    #[must_use]
    pub const fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Whether the session is running
    pub async fn is_started(&self) -> bool {
        self.running.lock().await.is_some()
    }

    /// Copy of the current model
    pub async fn model_snapshot(&self) -> BrakeModel {
        self.model.read().await.clone()
    }

    /// State of the active calibration run
    pub async fn calibration_state(&self) -> Option<CalibrationState> {
        let calibration = self
            .running
            .lock()
            .await
            .as_ref()
            .map(|running| Arc::clone(&running.calibration))?;
        calibration.state().await
    }

    /// Whether a calibration run is active
    pub async fn is_calibrating(&self) -> bool {
        let calibration = self
            .running
            .lock()
            .await
            .as_ref()
            .map(|running| Arc::clone(&running.calibration));
        match calibration {
            Some(calibration) => calibration.is_active().await,
            None => false,
        }
    }

    /// Register a telemetry listener
    pub async fn add_listener(&self, listener: Arc<dyn TelemetryListener>) -> ListenerId {
        self.listeners.add(listener).await
    }

    /// Remove a telemetry listener, returns whether it was registered
    pub async fn remove_listener(&self, id: ListenerId) -> bool {
        self.listeners.remove(id).await
    }

    /// Replace the mode's default resistance controller
    ///
    /// The controller's mode is checked against the session mode by
    /// [`start`](Self::start).
    ///
    /// # Errors
    ///
    /// Returns [`BrakeError::AlreadyStarted`] if the session is running.
    pub async fn override_default_resistance_controller(
        &self,
        controller: Box<dyn ResistanceController>,
    ) -> Result<()> {
        if self.is_started().await {
            return Err(BrakeError::AlreadyStarted);
        }
        info!("Resistance controller overridden with {}", controller.name());
        *self.controller_override.lock().await = Some(controller);
        Ok(())
    }

    /// Update the target of the session mode
    ///
    /// # Errors
    ///
    /// Returns [`BrakeError::InvalidParameters`] if the parameters belong to
    /// another mode or are out of range.
    pub async fn set_parameters(&self, parameters: Parameters) -> Result<()> {
        self.model.write().await.set_parameters(parameters)?;
        debug!("Parameters updated: {:?}", parameters);
        Ok(())
    }

    async fn resolve_controller(&self) -> Result<(Box<dyn ResistanceController>, bool)> {
        let mut slot = self.controller_override.lock().await;
        let Some(controller) = slot.take() else {
            return Ok((default_controller(self.mode), false));
        };

        if controller.mode() != self.mode {
            let error = BrakeError::ConfigurationMismatch {
                controller: controller.name().to_string(),
                mode: self.mode,
            };
            *slot = Some(controller);
            return Err(error);
        }
        Ok((controller, true))
    }

    async fn bounded<T>(&self, step: &str, fut: impl Future<Output = Result<T>>) -> Result<T> {
        let timeout = self.config.connect_timeout();
        time::timeout(timeout, fut).await.map_err(|_| {
            warn!("{} did not complete within {:?}", step, timeout);
            BrakeError::ConnectTimeout {
                timeout_ms: self.config.connect_timeout_ms,
            }
        })?
    }

    async fn configure_channel(&self, channel: &dyn RadioChannel) -> Result<()> {
        let settings = &self.config.channel;
        self.bounded("assign", channel.assign(NetworkKey::PUBLIC)).await?;
        self.bounded("set id", channel.set_id(ChannelId::from(settings)))
            .await?;
        self.bounded("set frequency", channel.set_frequency(settings.frequency))
            .await?;
        self.bounded("set period", channel.set_period(settings.period))
            .await?;
        self.bounded("set search timeout", channel.set_search_timeout(None))
            .await?;
        self.bounded("open", channel.open()).await
    }

    async fn open_channel(&self) -> Result<Arc<dyn RadioChannel>> {
        self.bounded("node stop", self.node.stop()).await?;
        self.bounded("node start", self.node.start()).await?;

        let channel = self
            .node
            .free_channel()
            .await
            .ok_or(BrakeError::ChannelUnavailable)?;

        if let Err(error) = self.configure_channel(channel.as_ref()).await {
            debug!("Channel setup failed, releasing channel: {}", error);
            if let Err(error) = channel.unassign().await {
                debug!("Unassign after failed setup: {}", error);
            }
            self.node.release_channel(channel).await;
            return Err(error);
        }
        Ok(channel)
    }

    /// Claim a channel and start streaming telemetry
    ///
    /// The controller is checked against the session mode before the radio
    /// is touched.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The session is already running
    /// - The controller override belongs to another mode
    /// - The node has no free channel
    /// - A channel setup step does not complete within the connect timeout
    /// - The radio reports an error
    pub async fn start(&self) -> Result<()> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Err(BrakeError::AlreadyStarted);
        }

        let (mut controller, overridden) = self.resolve_controller().await?;
        info!(
            "Starting {} session with {}",
            self.mode,
            controller.name()
        );

        let channel = match self.open_channel().await {
            Ok(channel) => channel,
            Err(error) => {
                if error.is_fatal() {
                    error!("Session could not start: {}", error);
                } else {
                    warn!("Session start failed, may be retried: {}", error);
                }
                if overridden {
                    *self.controller_override.lock().await = Some(controller);
                }
                return Err(error);
            }
        };

        let sender = Arc::new(MessageSender::spawn(Arc::clone(&channel)));
        let calibration = Arc::new(Calibration::new(
            Arc::clone(&sender),
            (&self.config).into(),
        ));
        let correlator = RequestCorrelator::new(Arc::clone(&sender), self.config.update_period());

        let (packet_tx, packet_rx) = mpsc::unbounded_channel();
        let rx_listener = channel.register_rx_listener(MessageKind::BroadcastData, packet_tx);

        controller.start(Arc::clone(&self.model)).await;
        let controller: SharedController = Arc::new(Mutex::new(controller));

        let (sample_tx, sample_rx) = mpsc::unbounded_channel();
        let watchdogs = Arc::new(Watchdogs::new(&self.config, &self.model, &sample_tx));
        watchdogs.start().await;

        let dispatcher = Dispatcher {
            model: Arc::clone(&self.model),
            calibration: Arc::clone(&calibration),
            correlator,
            watchdogs: Arc::clone(&watchdogs),
            version: Arc::clone(&self.version),
        };
        let tasks = vec![
            tokio::spawn(dispatcher.run(packet_rx)),
            tokio::spawn(dispatch_telemetry(
                sample_rx,
                Arc::clone(&controller),
                Arc::clone(&self.model),
                Arc::clone(&self.listeners),
            )),
        ];

        *running = Some(Running {
            channel,
            rx_listener,
            controller,
            overridden,
            sender,
            calibration,
            watchdogs,
            tasks,
        });
        info!("Session started");
        Ok(())
    }

    /// Stop streaming and release the channel
    ///
    /// Stopping a stopped session does nothing.
    ///
    /// # Errors
    ///
    /// Returns the radio error if closing or unassigning the channel fails.
    /// The channel is released either way.
    pub async fn stop(&self) -> Result<()> {
        let Some(running) = self.running.lock().await.take() else {
            return Ok(());
        };
        info!("Stopping session");

        running.calibration.stop().await;
        running.channel.remove_rx_listener(running.rx_listener);
        running.watchdogs.stop().await;
        running.controller.lock().await.stop().await;
        self.version.lock().await.take();

        let mut tasks = running.tasks;
        for task in &tasks {
            task.abort();
        }
        if let Some(writer) = running.sender.shutdown().await {
            tasks.push(writer);
        }
        join_all(tasks).await;

        if running.overridden {
            if let Ok(controller) = Arc::try_unwrap(running.controller) {
                *self.controller_override.lock().await = Some(controller.into_inner());
            }
        }

        let closed = running.channel.close().await;
        let unassigned = running.channel.unassign().await;
        self.node.release_channel(running.channel).await;

        info!("Session stopped");
        closed.and(unassigned)
    }

    async fn active_parts(&self) -> Result<(Arc<MessageSender>, Arc<Calibration>)> {
        self.running
            .lock()
            .await
            .as_ref()
            .map(|running| {
                (
                    Arc::clone(&running.sender),
                    Arc::clone(&running.calibration),
                )
            })
            .ok_or(BrakeError::NotStarted)
    }

    /// Start calibrating the brake, reporting progress to `callback`
    ///
    /// Returns once the run has started. Polling is paused until the run
    /// succeeds, fails or is stopped, and the run fails with
    /// [`BrakeError::CalibrationTimeout`] after `timeout_secs`.
    ///
    /// # Errors
    ///
    /// Returns [`BrakeError::NotStarted`] if the session is not running,
    /// [`BrakeError::CalibrationInProgress`] if a run is active, or
    /// [`BrakeError::InvalidParameters`] if `timeout_secs` cannot be
    /// scheduled.
    pub async fn calibrate(
        &self,
        callback: Arc<dyn CalibrationCallback>,
        timeout_secs: u64,
    ) -> Result<()> {
        let (_, calibration) = self.active_parts().await?;
        calibration
            .start(callback, Duration::from_secs(timeout_secs))
            .await
    }

    /// Stop the active calibration run without reporting to its callback
    ///
    /// Returns whether a run was active.
    pub async fn stop_calibration(&self) -> bool {
        match self.active_parts().await {
            Ok((_, calibration)) => calibration.stop().await,
            Err(_) => false,
        }
    }

    /// Ask the brake for its software version
    ///
    /// `callback` receives the version once the brake answers. It is called
    /// at most once and replaces the callback of an earlier request.
    ///
    /// # Errors
    ///
    /// Returns [`BrakeError::NotStarted`] if the session is not running, or
    /// the send error if the request was not delivered within the version
    /// timeout. The callback is dropped on error.
    pub async fn request_version(
        &self,
        callback: impl FnOnce(String) + Send + 'static,
    ) -> Result<()> {
        let (sender, _) = self.active_parts().await?;
        *self.version.lock().await = Some(Box::new(callback));

        let packet = protocol::encode(&protocol::PACKET_REQUEST_VERSION)?;
        let result = {
            let _pause = sender.pause();
            sender
                .send(
                    packet,
                    SendCondition::ChannelTx,
                    RetryBudget::single(self.config.version_timeout()),
                    Priority::Control,
                )
                .await
        };

        if let Err(error) = &result {
            warn!("Version request failed: {}", error);
            self.version.lock().await.take();
        }
        result
    }
}

impl Drop for BrakeSession {
    fn drop(&mut self) {
        let Ok(mut running) = self.running.try_lock() else {
            return;
        };
        if let Some(running) = running.take() {
            running.calibration.try_stop();
            running.channel.remove_rx_listener(running.rx_listener);
            for task in &running.tasks {
                task.abort();
            }
        }
    }
}
