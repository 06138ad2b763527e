use std::{sync::Arc, time::Duration};
use tokio::{
    sync::{mpsc, Mutex},
    task::JoinHandle,
    time::{self, Instant, MissedTickBehavior},
};
use tracing::debug;

use crate::{
    model::SharedModel,
    types::{TelemetryKind, TelemetrySample},
};

/// Value a watchdog falls back to once its channel has gone stale
#[derive(Clone)]
pub enum ResetValue {
    /// A constant
    Fixed(f64),
    /// The model's last heart rate
    HeartRate(SharedModel),
}

impl ResetValue {
    async fn resolve(&self) -> f64 {
        match self {
            Self::Fixed(value) => *value,
            Self::HeartRate(model) => model.read().await.heart_rate,
        }
    }
}

impl std::fmt::Debug for ResetValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Fixed(value) => write!(f, "Fixed({value})"),
            Self::HeartRate(_) => write!(f, "HeartRate"),
        }
    }
}

#[derive(Debug, Default)]
struct WatchdogState {
    value: f64,
    last_update: Option<Instant>,
    running: bool,
    task: Option<JoinHandle<()>>,
}

/// Re-emits the last value of one telemetry channel at a fixed period
///
/// The brake reports at irregular intervals. The watchdog turns that into a
/// steady stream: every `period` the stored value goes out to the sink, and
/// once no update arrived for `reset_window` the stored value is replaced by
/// the [`ResetValue`] until fresh data comes in.
pub struct WatchdogUpdater {
    kind: TelemetryKind,
    period: Duration,
    reset_window: Duration,
    reset_value: ResetValue,
    sink: mpsc::UnboundedSender<TelemetrySample>,
    state: Arc<Mutex<WatchdogState>>,
}

impl WatchdogUpdater {
    /// Create a stopped watchdog
    #[must_use]
    pub fn new(
        kind: TelemetryKind,
        period: Duration,
        reset_window: Duration,
        reset_value: ResetValue,
        sink: mpsc::UnboundedSender<TelemetrySample>,
    ) -> Self {
        Self {
            kind,
            period,
            reset_window,
            reset_value,
            sink,
            state: Arc::new(Mutex::new(WatchdogState::default())),
        }
    }

    /// Accept updates; the periodic task is scheduled by the first one
    pub async fn start(&self) {
        self.state.lock().await.running = true;
    }

    /// Cancel the periodic task and drop further updates
    pub async fn stop(&self) {
        let mut state = self.state.lock().await;
        state.running = false;
        if let Some(task) = state.task.take() {
            task.abort();
        }
    }

    /// Whether the periodic task is scheduled
    pub async fn is_scheduled(&self) -> bool {
        self.state.lock().await.task.is_some()
    }

    /// Store a fresh raw value
    pub async fn update(&self, value: f64) {
        let mut state = self.state.lock().await;
        if !state.running {
            return;
        }

        let now = Instant::now();
        state.value = value;
        state.last_update = Some(now);

        if state.task.is_none() {
            debug!("Scheduling {} watchdog every {:?}", self.kind, self.period);
            state.task = Some(self.spawn_ticker(now));
        }
    }

    fn spawn_ticker(&self, now: Instant) -> JoinHandle<()> {
        let kind = self.kind;
        let period = self.period;
        let reset_window = self.reset_window;
        let reset_value = self.reset_value.clone();
        let sink = self.sink.clone();
        let state = Arc::clone(&self.state);

        tokio::spawn(async move {
            let mut interval = time::interval_at(now + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                interval.tick().await;

                let baseline = reset_value.resolve().await;
                let value = {
                    let mut state = state.lock().await;
                    let stale = state
                        .last_update
                        .is_some_and(|last| last.elapsed() >= reset_window);
                    if stale {
                        state.value = baseline;
                    }
                    state.value
                };

                if sink.send(TelemetrySample { kind, value }).is_err() {
                    debug!("{} watchdog sink closed", kind);
                    break;
                }
            }
        })
    }
}

impl Drop for WatchdogUpdater {
    fn drop(&mut self) {
        if let Ok(mut state) = self.state.try_lock() {
            if let Some(task) = state.task.take() {
                task.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{model::BrakeModel, types::Mode};

    fn watchdog(
        reset_value: ResetValue,
    ) -> (WatchdogUpdater, mpsc::UnboundedReceiver<TelemetrySample>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let updater = WatchdogUpdater::new(
            TelemetryKind::Speed,
            Duration::from_millis(1_000),
            Duration::from_millis(5_000),
            reset_value,
            tx,
        );
        (updater, rx)
    }

    #[tokio::test(start_paused = true)]
    async fn test_holds_value_then_resets_to_baseline() {
        let (updater, mut rx) = watchdog(ResetValue::Fixed(0.0));
        updater.start().await;

        let start = Instant::now();
        updater.update(55.0).await;

        let expected = [
            (1_000, 55.0),
            (2_000, 55.0),
            (3_000, 55.0),
            (4_000, 55.0),
            (5_000, 0.0),
            (6_000, 0.0),
            (7_000, 0.0),
        ];
        for (at_ms, value) in expected {
            let sample = rx.recv().await.unwrap();
            let elapsed = start.elapsed();
            assert!(
                elapsed >= Duration::from_millis(at_ms)
                    && elapsed < Duration::from_millis(at_ms + 5),
                "sample at {elapsed:?}, expected {at_ms}ms"
            );
            assert_eq!(sample.kind, TelemetryKind::Speed);
            assert!(
                (sample.value - value).abs() < f64::EPSILON,
                "at {at_ms}ms got {} expected {value}",
                sample.value
            );
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_fresh_update_resumes_after_reset() {
        let (updater, mut rx) = watchdog(ResetValue::Fixed(0.0));
        updater.start().await;
        updater.update(30.0).await;

        for _ in 0..6 {
            rx.recv().await.unwrap();
        }
        updater.update(42.0).await;

        let sample = rx.recv().await.unwrap();
        assert!((sample.value - 42.0).abs() < f64::EPSILON);
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_before_start_is_ignored() {
        let (updater, mut rx) = watchdog(ResetValue::Fixed(0.0));
        updater.update(12.0).await;

        assert!(!updater.is_scheduled().await);
        time::sleep(Duration::from_millis(3_000)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_cancels_emission() {
        let (updater, mut rx) = watchdog(ResetValue::Fixed(0.0));
        updater.start().await;
        updater.update(20.0).await;
        rx.recv().await.unwrap();

        updater.stop().await;
        assert!(!updater.is_scheduled().await);

        time::sleep(Duration::from_millis(3_000)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_heart_rate_baseline() {
        let model = BrakeModel::shared(Mode::TargetSlope);
        model.write().await.heart_rate = 72.0;

        let (updater, mut rx) = watchdog(ResetValue::HeartRate(model));
        updater.start().await;
        updater.update(85.0).await;

        let values: Vec<f64> = {
            let mut values = Vec::new();
            for _ in 0..5 {
                values.push(rx.recv().await.unwrap().value);
            }
            values
        };
        assert_eq!(values, vec![85.0, 85.0, 85.0, 85.0, 72.0]);
    }
}
