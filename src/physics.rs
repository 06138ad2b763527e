//! Road physics for the virtual speed shown in slope mode.
//!
//! The brake only knows the rider's power. On a virtual road the speed
//! follows from the steady-state balance `P = v·F(v)`, where the resistive
//! force `F(v) = s + k·v²` is a static part `s` (gravity and rolling
//! resistance) plus aerodynamic drag. `k·v³ + s·v − P` has exactly one
//! positive root for `P > 0`, so a bracketed Newton iteration always finds it.

const AIR_DENSITY: f64 = 1.225; // kg/m³
const GRAVITY: f64 = 9.81; // m/s²
const DEFAULT_CDA: f64 = 0.40; // m², upright on the trainer
const DEFAULT_CRR: f64 = 0.005;
const BIKE_MASS: f64 = 9.0; // kg

/// Fastest virtual speed reported, in m/s
pub const MAX_SPEED_MS: f64 = 30.0;

const TOLERANCE_MS: f64 = 1e-6;
const MAX_ITERATIONS: usize = 60;

/// Rider and bike parameters for the power/speed balance
#[derive(Debug, Clone, PartialEq)]
pub struct PhysicsModel {
    /// Rider mass in kilograms
    pub rider_mass_kg: f64,
    /// Bike mass in kilograms
    pub bike_mass_kg: f64,
    /// Drag coefficient times frontal area
    pub cda: f64,
    /// Rolling resistance coefficient
    pub crr: f64,
}

impl Default for PhysicsModel {
    fn default() -> Self {
        Self {
            rider_mass_kg: crate::model::DEFAULT_RIDER_WEIGHT_KG,
            bike_mass_kg: BIKE_MASS,
            cda: DEFAULT_CDA,
            crr: DEFAULT_CRR,
        }
    }
}

impl PhysicsModel {
    /// Create a model for a rider of the given mass
    #[must_use]
    pub fn new(rider_mass_kg: f64) -> Self {
        Self {
            rider_mass_kg,
            ..Default::default()
        }
    }

    /// Gravity plus rolling resistance on `gradient_percent`, negative downhill
    fn static_force(&self, gradient_percent: f64) -> f64 {
        let angle = (gradient_percent / 100.0).atan();
        let weight = (self.rider_mass_kg + self.bike_mass_kg) * GRAVITY;
        weight * self.crr.mul_add(angle.cos(), angle.sin())
    }

    /// `k` in the drag force `k·v²`
    fn drag_coefficient(&self) -> f64 {
        0.5 * AIR_DENSITY * self.cda
    }

    /// Resistive force at `speed_ms` on a road of `gradient_percent`, in newtons
    #[must_use]
    pub fn resistance_force(&self, speed_ms: f64, gradient_percent: f64) -> f64 {
        self.drag_coefficient()
            .mul_add(speed_ms * speed_ms, self.static_force(gradient_percent))
    }

    /// Surplus power `v·F(v) − P` at `speed_ms` and its derivative in `v`
    fn power_balance(&self, speed_ms: f64, gradient_percent: f64, power_watts: f64) -> (f64, f64) {
        let force = self.resistance_force(speed_ms, gradient_percent);
        let drag = self.drag_coefficient() * speed_ms * speed_ms;
        (speed_ms.mul_add(force, -power_watts), 2.0f64.mul_add(drag, force))
    }

    /// Steady-state road speed in km/h for `power_watts` on `gradient_percent`
    ///
    /// Without power the rider stands still, except downhill where the bike
    /// coasts. The result never exceeds [`MAX_SPEED_MS`].
    #[must_use]
    pub fn speed_kmh(&self, power_watts: f64, gradient_percent: f64) -> f64 {
        let power = power_watts.max(0.0);
        if power <= 0.0 && self.static_force(gradient_percent) >= 0.0 {
            return 0.0;
        }

        // surplus is negative below the root and positive above it
        let (mut low, mut high) = (0.0, MAX_SPEED_MS);
        if self.power_balance(high, gradient_percent, power).0 <= 0.0 {
            return MAX_SPEED_MS * 3.6;
        }

        let mut v = high;
        for _ in 0..MAX_ITERATIONS {
            let (surplus, slope) = self.power_balance(v, gradient_percent, power);
            if surplus > 0.0 {
                high = v;
            } else {
                low = v;
            }

            let newton = v - surplus / slope;
            let next = if slope > 0.0 && newton > low && newton < high {
                newton
            } else {
                0.5 * (low + high)
            };

            let done = (next - v).abs() < TOLERANCE_MS || high - low < TOLERANCE_MS;
            v = next;
            if done {
                break;
            }
        }

        v * 3.6
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_power_balance_holds_at_solution() {
        let model = PhysicsModel::new(80.0);
        for (power, gradient) in [(150.0, 0.0), (250.0, 4.0), (320.0, 10.0), (120.0, -3.0)] {
            let v = model.speed_kmh(power, gradient) / 3.6;
            let delivered = v * model.resistance_force(v, gradient);
            assert!(
                (delivered - power).abs() < 1e-3,
                "{power} W at {gradient}% gave {delivered} W"
            );
        }
    }

    #[test]
    fn test_no_power_on_flat_is_standstill() {
        let model = PhysicsModel::default();
        assert!(model.speed_kmh(0.0, 0.0).abs() < f64::EPSILON);
        assert!(model.speed_kmh(-40.0, 2.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_coasting_downhill() {
        let model = PhysicsModel::default();
        let coast = model.speed_kmh(0.0, -8.0) / 3.6;
        assert!(coast * 3.6 > 30.0, "coasted at {} km/h", coast * 3.6);
        assert!(model.resistance_force(coast, -8.0).abs() < 1e-3);
    }

    #[test]
    fn test_flat_road_speed() {
        let model = PhysicsModel::new(75.0);
        let speed = model.speed_kmh(200.0, 0.0);
        assert!(speed > 25.0 && speed < 40.0, "speed was {speed} km/h");
    }

    #[test]
    fn test_gradient_ordering() {
        let model = PhysicsModel::new(75.0);
        let flat = model.speed_kmh(200.0, 0.0);
        assert!(model.speed_kmh(200.0, 5.0) < flat);
        assert!(model.speed_kmh(200.0, -5.0) > flat);
    }

    #[test]
    fn test_heavier_rider_slower_uphill() {
        let light = PhysicsModel::new(60.0).speed_kmh(250.0, 8.0);
        let heavy = PhysicsModel::new(95.0).speed_kmh(250.0, 8.0);
        assert!(heavy < light);
    }

    #[test]
    fn test_speed_is_capped() {
        let model = PhysicsModel::default();
        let speed = model.speed_kmh(3000.0, -20.0);
        assert!((speed - MAX_SPEED_MS * 3.6).abs() < f64::EPSILON);
    }
}
