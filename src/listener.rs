use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use tokio::sync::RwLock;

use crate::radio::ListenerId;

/// Receives telemetry forwarded by a running session
///
/// Values are the virtual values produced by the active resistance
/// controller: speed in km/h, power in watts, cadence in rpm, distance in
/// metres and heart rate in bpm. Every method defaults to doing nothing.
pub trait TelemetryListener: Send + Sync {
    /// Speed changed
    fn on_speed_change(&self, _speed: f64) {}

    /// Power changed
    fn on_power_change(&self, _power: f64) {}

    /// Cadence changed
    fn on_cadence_change(&self, _cadence: f64) {}

    /// Distance changed
    fn on_distance_change(&self, _distance: f64) {}

    /// Heart rate changed
    fn on_heart_rate_change(&self, _heart_rate: f64) {}
}

/// Registry of telemetry listeners
#[derive(Default)]
pub struct TelemetryListeners {
    listeners: RwLock<Vec<(ListenerId, Arc<dyn TelemetryListener>)>>,
    next_id: AtomicU64,
}

impl TelemetryListeners {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener
    pub async fn add(&self, listener: Arc<dyn TelemetryListener>) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners.write().await.push((id, listener));
        id
    }

    /// Remove a listener, returns whether it was registered
    pub async fn remove(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write().await;
        let before = listeners.len();
        listeners.retain(|(listener_id, _)| *listener_id != id);
        listeners.len() != before
    }

    /// Call `f` for every listener
    ///
    /// The listener list is copied out first so listeners may register or
    /// remove listeners from inside a callback.
    pub async fn for_each(&self, f: impl Fn(&dyn TelemetryListener)) {
        let listeners: Vec<_> = self
            .listeners
            .read()
            .await
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();

        for listener in listeners {
            f(listener.as_ref());
        }
    }
}

#[cfg(test)]
pub(crate) mod recording {
    //! Listener that records everything it hears, for tests.

    use super::TelemetryListener;
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct RecordingListener {
        pub speeds: Mutex<Vec<f64>>,
        pub powers: Mutex<Vec<f64>>,
        pub cadences: Mutex<Vec<f64>>,
        pub distances: Mutex<Vec<f64>>,
    }

    impl TelemetryListener for RecordingListener {
        fn on_speed_change(&self, speed: f64) {
            self.speeds.lock().unwrap().push(speed);
        }

        fn on_power_change(&self, power: f64) {
            self.powers.lock().unwrap().push(power);
        }

        fn on_cadence_change(&self, cadence: f64) {
            self.cadences.lock().unwrap().push(cadence);
        }

        fn on_distance_change(&self, distance: f64) {
            self.distances.lock().unwrap().push(distance);
        }
    }
}
