use async_trait::async_trait;
use std::sync::Arc;
use tokio::{sync::Mutex, time::Instant};
use tracing::{debug, info};

use crate::{
    model::{SharedModel, MAX_RESISTANCE},
    physics::PhysicsModel,
    types::Mode,
};

/// Controller shared between the session and its dispatch tasks
pub type SharedController = Arc<Mutex<Box<dyn ResistanceController>>>;

/// Maps live telemetry onto brake resistance and virtual values
///
/// Each hook receives a raw value measured by the brake and returns the
/// value forwarded to telemetry listeners. The controller is bound to the
/// session model by [`start`](Self::start) before any hook runs.
#[async_trait]
pub trait ResistanceController: Send + Sync {
    /// Name for logs and errors
    fn name(&self) -> &'static str;

    /// Ride mode this controller realises
    fn mode(&self) -> Mode;

    /// Bind the controller to the session model
    async fn start(&mut self, model: SharedModel);

    /// Release the model
    async fn stop(&mut self);

    /// Speed in km/h
    async fn on_speed_change(&mut self, speed: f64) -> f64;

    /// Power in watts
    async fn on_power_change(&mut self, power: f64) -> f64;

    /// Cadence in rpm
    async fn on_cadence_change(&mut self, cadence: f64) -> f64 {
        cadence
    }

    /// Distance in metres
    async fn on_distance_change(&mut self, distance: f64) -> f64 {
        distance
    }
}

/// Default controller for a ride mode
#[must_use]
pub fn default_controller(mode: Mode) -> Box<dyn ResistanceController> {
    match mode {
        Mode::TargetSlope => Box::new(SpeedResistanceMapper::new()),
        Mode::TargetSpeed => Box::new(SpeedPidController::new()),
        Mode::TargetPower => Box::new(PowerPidController::new()),
    }
}

/// Proportional-integral-derivative loop with output clamp
#[derive(Debug, Clone, PartialEq)]
pub struct Pid {
    kp: f64,
    ki: f64,
    kd: f64,
    integral: f64,
    integral_limit: f64,
    last_error: Option<f64>,
    output_min: f64,
    output_max: f64,
}

impl Pid {
    /// Create a loop with the given gains, output limited to `[min, max]`
    #[must_use]
    pub fn new(kp: f64, ki: f64, kd: f64, output_min: f64, output_max: f64) -> Self {
        let integral_limit = if ki.abs() > f64::EPSILON {
            (output_max - output_min).abs() / ki.abs()
        } else {
            0.0
        };
        Self {
            kp,
            ki,
            kd,
            integral: 0.0,
            integral_limit,
            last_error: None,
            output_min,
            output_max,
        }
    }

    /// Feed one error sample taken `dt` seconds after the previous one
    pub fn update(&mut self, error: f64, dt: f64) -> f64 {
        let mut derivative = 0.0;
        if dt > 0.0 {
            self.integral = error
                .mul_add(dt, self.integral)
                .clamp(-self.integral_limit, self.integral_limit);
            if let Some(last) = self.last_error {
                derivative = (error - last) / dt;
            }
        }
        self.last_error = Some(error);

        self.ki
            .mul_add(self.integral, self.kp.mul_add(error, self.kd * derivative))
            .clamp(self.output_min, self.output_max)
    }

    /// Forget accumulated state
    pub fn reset(&mut self) {
        self.integral = 0.0;
        self.last_error = None;
    }
}

fn seconds_since(last: &mut Option<Instant>) -> f64 {
    let now = Instant::now();
    let dt = last.map_or(0.0, |previous| {
        now.saturating_duration_since(previous).as_secs_f64()
    });
    *last = Some(now);
    dt
}

/// Resistance level per newton of simulated road force
const RESISTANCE_PER_NEWTON: f64 = 8.0;

/// Target-slope controller
///
/// Sets the brake to the road force of the target gradient at the rider's
/// wheel speed and reports the speed the rider's power would give on that
/// gradient.
#[derive(Debug, Default)]
pub struct SpeedResistanceMapper {
    model: Option<SharedModel>,
    last_power: f64,
}

impl SpeedResistanceMapper {
    /// Create an unbound mapper
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ResistanceController for SpeedResistanceMapper {
    fn name(&self) -> &'static str {
        "SpeedResistanceMapper"
    }

    fn mode(&self) -> Mode {
        Mode::TargetSlope
    }

    async fn start(&mut self, model: SharedModel) {
        info!("{} started", self.name());
        self.model = Some(model);
    }

    async fn stop(&mut self) {
        self.model = None;
    }

    async fn on_speed_change(&mut self, speed: f64) -> f64 {
        let Some(model) = &self.model else {
            return speed;
        };

        let mut model = model.write().await;
        let slope = model.target_slope().unwrap_or(0.0);
        let physics = PhysicsModel::new(model.rider_weight_kg);

        let force = physics.resistance_force(speed / 3.6, slope);
        model.set_resistance(force * RESISTANCE_PER_NEWTON);

        let virtual_speed = physics.speed_kmh(self.last_power, slope);
        debug!(
            "slope {:.1}%: {:.1} km/h -> {:.1} km/h, resistance {}",
            slope, speed, virtual_speed, model.resistance
        );
        virtual_speed
    }

    async fn on_power_change(&mut self, power: f64) -> f64 {
        self.last_power = power;
        power
    }
}

/// Target-speed controller
#[derive(Debug)]
pub struct SpeedPidController {
    model: Option<SharedModel>,
    pid: Pid,
    last_tick: Option<Instant>,
}

impl SpeedPidController {
    /// Create an unbound controller with default gains
    #[must_use]
    pub fn new() -> Self {
        Self::with_pid(Pid::new(20.0, 4.0, 0.0, 0.0, f64::from(MAX_RESISTANCE)))
    }

    /// Create an unbound controller around a tuned loop
    #[must_use]
    pub const fn with_pid(pid: Pid) -> Self {
        Self {
            model: None,
            pid,
            last_tick: None,
        }
    }
}

impl Default for SpeedPidController {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ResistanceController for SpeedPidController {
    fn name(&self) -> &'static str {
        "SpeedPidController"
    }

    fn mode(&self) -> Mode {
        Mode::TargetSpeed
    }

    async fn start(&mut self, model: SharedModel) {
        info!("{} started", self.name());
        self.pid.reset();
        self.last_tick = None;
        self.model = Some(model);
    }

    async fn stop(&mut self) {
        self.model = None;
    }

    async fn on_speed_change(&mut self, speed: f64) -> f64 {
        let Some(model) = &self.model else {
            return speed;
        };

        let dt = seconds_since(&mut self.last_tick);
        let mut model = model.write().await;
        let target = model.target_speed().unwrap_or(0.0);
        // too fast means more resistance
        let output = self.pid.update(speed - target, dt);
        model.set_resistance(output);
        speed
    }

    async fn on_power_change(&mut self, power: f64) -> f64 {
        power
    }
}

/// Target-power controller
#[derive(Debug)]
pub struct PowerPidController {
    model: Option<SharedModel>,
    pid: Pid,
    target_power: f64,
    last_tick: Option<Instant>,
}

impl PowerPidController {
    /// Create an unbound controller with default gains
    #[must_use]
    pub fn new() -> Self {
        Self::with_pid(Pid::new(1.5, 0.5, 0.0, 0.0, f64::from(MAX_RESISTANCE)))
    }

    /// Create an unbound controller around a tuned loop
    #[must_use]
    pub const fn with_pid(pid: Pid) -> Self {
        Self {
            model: None,
            pid,
            target_power: 0.0,
            last_tick: None,
        }
    }

    /// Power the loop currently drives towards
    #[must_use]
    pub const fn target_power(&self) -> f64 {
        self.target_power
    }

    /// Change the power the loop drives towards
    pub fn set_target_power(&mut self, power: f64) {
        if (power - self.target_power).abs() > f64::EPSILON {
            debug!("target power {:.0} W -> {:.0} W", self.target_power, power);
        }
        self.target_power = power;
    }
}

impl Default for PowerPidController {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ResistanceController for PowerPidController {
    fn name(&self) -> &'static str {
        "PowerPidController"
    }

    fn mode(&self) -> Mode {
        Mode::TargetPower
    }

    async fn start(&mut self, model: SharedModel) {
        info!("{} started", self.name());
        self.pid.reset();
        self.last_tick = None;
        if let Some(power) = model.read().await.target_power() {
            self.target_power = power;
        }
        self.model = Some(model);
    }

    async fn stop(&mut self) {
        self.model = None;
    }

    async fn on_speed_change(&mut self, speed: f64) -> f64 {
        speed
    }

    async fn on_power_change(&mut self, power: f64) -> f64 {
        let Some(model) = &self.model else {
            return power;
        };

        let dt = seconds_since(&mut self.last_tick);
        let output = self.pid.update(self.target_power - power, dt);
        model.write().await.set_resistance(output);
        power
    }

    async fn on_distance_change(&mut self, distance: f64) -> f64 {
        let target = match &self.model {
            Some(model) => model.read().await.target_power(),
            None => None,
        };
        if let Some(power) = target {
            self.set_target_power(power);
        }
        distance
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{model::BrakeModel, types::Parameters};
    use std::time::Duration;

    #[test]
    fn test_default_controller_matches_mode() {
        for mode in [Mode::TargetSlope, Mode::TargetSpeed, Mode::TargetPower] {
            assert_eq!(default_controller(mode).mode(), mode);
        }
    }

    #[test]
    fn test_pid_proportional_and_clamp() {
        let mut pid = Pid::new(2.0, 0.0, 0.0, 0.0, 100.0);
        assert!((pid.update(10.0, 1.0) - 20.0).abs() < f64::EPSILON);
        assert!((pid.update(80.0, 1.0) - 100.0).abs() < f64::EPSILON);
        assert!(pid.update(-5.0, 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_pid_integral_accumulates() {
        let mut pid = Pid::new(0.0, 1.0, 0.0, 0.0, 100.0);
        pid.update(5.0, 1.0);
        let output = pid.update(5.0, 1.0);
        assert!((output - 10.0).abs() < 1e-9);

        pid.reset();
        assert!((pid.update(5.0, 1.0) - 5.0).abs() < 1e-9);
    }

    #[test]
    fn test_pid_first_sample_has_no_integral() {
        let mut pid = Pid::new(1.0, 1.0, 1.0, -100.0, 100.0);
        assert!((pid.update(3.0, 0.0) - 3.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_unbound_controllers_pass_values_through() {
        let mut mapper = SpeedResistanceMapper::new();
        assert!((mapper.on_speed_change(25.0).await - 25.0).abs() < f64::EPSILON);

        let mut power = PowerPidController::new();
        assert!((power.on_power_change(180.0).await - 180.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_mapper_slows_virtual_speed_uphill() {
        let flat_model = BrakeModel::shared(Mode::TargetSlope);
        let hill_model = BrakeModel::shared(Mode::TargetSlope);
        hill_model
            .write()
            .await
            .set_parameters(Parameters::TargetSlope {
                slope_percent: 6.0,
                rider_weight_kg: None,
            })
            .unwrap();

        let mut flat = SpeedResistanceMapper::new();
        flat.start(flat_model.clone()).await;
        flat.on_power_change(220.0).await;
        let flat_speed = flat.on_speed_change(30.0).await;

        let mut hill = SpeedResistanceMapper::new();
        hill.start(hill_model.clone()).await;
        hill.on_power_change(220.0).await;
        let hill_speed = hill.on_speed_change(30.0).await;

        assert!(hill_speed < flat_speed);
        assert!(hill_model.read().await.resistance > flat_model.read().await.resistance);
    }

    #[tokio::test(start_paused = true)]
    async fn test_speed_pid_brakes_when_too_fast() {
        let model = BrakeModel::shared(Mode::TargetSpeed);
        model
            .write()
            .await
            .set_parameters(Parameters::TargetSpeed {
                speed_kmh: 25.0,
                rider_weight_kg: None,
            })
            .unwrap();

        let mut controller = SpeedPidController::new();
        controller.start(model.clone()).await;

        let forwarded = controller.on_speed_change(35.0).await;
        assert!((forwarded - 35.0).abs() < f64::EPSILON);
        let first = model.read().await.resistance;
        assert!(first > 0);

        tokio::time::sleep(Duration::from_secs(1)).await;
        controller.on_speed_change(35.0).await;
        assert!(model.read().await.resistance > first);
    }

    #[tokio::test(start_paused = true)]
    async fn test_power_pid_follows_live_target() {
        let model = BrakeModel::shared(Mode::TargetPower);
        model
            .write()
            .await
            .set_parameters(Parameters::TargetPower {
                power_watts: 150.0,
                rider_weight_kg: None,
            })
            .unwrap();

        let mut controller = PowerPidController::new();
        controller.start(model.clone()).await;
        assert!((controller.target_power() - 150.0).abs() < f64::EPSILON);

        model
            .write()
            .await
            .set_parameters(Parameters::TargetPower {
                power_watts: 250.0,
                rider_weight_kg: None,
            })
            .unwrap();
        assert!((controller.target_power() - 150.0).abs() < f64::EPSILON);

        controller.on_distance_change(120.0).await;
        assert!((controller.target_power() - 250.0).abs() < f64::EPSILON);

        controller.on_power_change(200.0).await;
        assert!(model.read().await.resistance > 0);
    }
}
