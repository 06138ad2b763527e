use std::sync::Arc;
use tokio::{sync::RwLock, time::Instant};

use crate::{
    error::{BrakeError, Result},
    protocol::{self, Packet},
    types::{Mode, Parameters},
};

/// Model shared between the session, the controller and the watchdogs
pub type SharedModel = Arc<RwLock<BrakeModel>>;

/// Weight assumed until the caller provides one
pub const DEFAULT_RIDER_WEIGHT_KG: f64 = 75.0;

/// Highest resistance level the brake accepts
pub const MAX_RESISTANCE: u16 = 1_000;

/// Target of the active ride mode
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Target {
    /// Gradient in percent
    Slope(f64),
    /// Speed in km/h
    Speed(f64),
    /// Power in watts
    Power(f64),
}

impl Target {
    const fn initial(mode: Mode) -> Self {
        match mode {
            Mode::TargetSlope => Self::Slope(0.0),
            Mode::TargetSpeed => Self::Speed(0.0),
            Mode::TargetPower => Self::Power(0.0),
        }
    }

    /// Mode this target belongs to
    #[must_use]
    pub const fn mode(&self) -> Mode {
        match self {
            Self::Slope(_) => Mode::TargetSlope,
            Self::Speed(_) => Mode::TargetSpeed,
            Self::Power(_) => Mode::TargetPower,
        }
    }
}

/// Live telemetry and targets of one brake session
#[derive(Debug, Clone, PartialEq)]
pub struct BrakeModel {
    /// Measured wheel speed in km/h
    pub actual_speed: f64,
    /// Speed forwarded to listeners in km/h
    pub virtual_speed: f64,
    /// Distance integrated from the virtual speed in metres
    pub virtual_distance: f64,
    /// Total power in watts
    pub power: f64,
    /// Left leg power in watts
    pub power_left: f64,
    /// Right leg power in watts
    pub power_right: f64,
    /// Left share of total power in percent
    pub power_balance: u8,
    /// Cadence in rpm
    pub cadence: f64,
    /// Heart rate in bpm
    pub heart_rate: f64,
    /// Brake temperature in degrees Celsius
    pub brake_temperature: f64,
    /// Rolling packet counter reported by the brake
    pub counter: u8,
    /// Resistance level requested from the brake
    pub resistance: u16,
    /// Rider weight in kilograms
    pub rider_weight_kg: f64,
    target: Target,
    last_speed_update: Option<Instant>,
}

impl BrakeModel {
    /// Create an empty model for `mode`
    #[must_use]
    pub const fn new(mode: Mode) -> Self {
        Self {
            actual_speed: 0.0,
            virtual_speed: 0.0,
            virtual_distance: 0.0,
            power: 0.0,
            power_left: 0.0,
            power_right: 0.0,
            power_balance: 50,
            cadence: 0.0,
            heart_rate: 0.0,
            brake_temperature: 0.0,
            counter: 0,
            resistance: 0,
            rider_weight_kg: DEFAULT_RIDER_WEIGHT_KG,
            target: Target::initial(mode),
            last_speed_update: None,
        }
    }

    /// Wrap a model for sharing
    #[must_use]
    pub fn shared(mode: Mode) -> SharedModel {
        Arc::new(RwLock::new(Self::new(mode)))
    }

    /// Mode fixed at creation
    #[must_use]
    pub const fn mode(&self) -> Mode {
        self.target.mode()
    }

    /// Current target
    #[must_use]
    pub const fn target(&self) -> Target {
        self.target
    }

    /// Target gradient, if in slope mode
    #[must_use]
    pub const fn target_slope(&self) -> Option<f64> {
        match self.target {
            Target::Slope(slope) => Some(slope),
            _ => None,
        }
    }

    /// Target speed, if in speed mode
    #[must_use]
    pub const fn target_speed(&self) -> Option<f64> {
        match self.target {
            Target::Speed(speed) => Some(speed),
            _ => None,
        }
    }

    /// Target power, if in power mode
    #[must_use]
    pub const fn target_power(&self) -> Option<f64> {
        match self.target {
            Target::Power(power) => Some(power),
            _ => None,
        }
    }

    /// Apply new target parameters
    ///
    /// # Errors
    ///
    /// Returns [`BrakeError::InvalidParameters`] if the parameters belong to a
    /// different mode or are out of range. The model is left untouched.
    pub fn set_parameters(&mut self, parameters: Parameters) -> Result<()> {
        if parameters.mode() != self.mode() {
            return Err(BrakeError::InvalidParameters(format!(
                "{} parameters for a {} session",
                parameters.mode(),
                self.mode()
            )));
        }

        let target = match parameters {
            Parameters::TargetSlope { slope_percent, .. } => {
                if !(-50.0..=50.0).contains(&slope_percent) {
                    return Err(BrakeError::InvalidParameters(format!(
                        "Slope {slope_percent:.1}% is out of range (-50 - 50)"
                    )));
                }
                Target::Slope(slope_percent)
            }
            Parameters::TargetSpeed { speed_kmh, .. } => {
                if !(0.0..=100.0).contains(&speed_kmh) {
                    return Err(BrakeError::InvalidParameters(format!(
                        "Speed {speed_kmh:.1} km/h is out of range (0 - 100)"
                    )));
                }
                Target::Speed(speed_kmh)
            }
            Parameters::TargetPower { power_watts, .. } => {
                if !(0.0..=3_000.0).contains(&power_watts) {
                    return Err(BrakeError::InvalidParameters(format!(
                        "Power {power_watts:.0} W is out of range (0 - 3000)"
                    )));
                }
                Target::Power(power_watts)
            }
        };

        if let Some(weight) = parameters.rider_weight_kg() {
            if !(20.0..=250.0).contains(&weight) {
                return Err(BrakeError::InvalidParameters(format!(
                    "Rider weight {weight:.1} kg is out of range (20 - 250)"
                )));
            }
            self.rider_weight_kg = weight;
        }

        self.target = target;
        Ok(())
    }

    /// Record a speed tick and integrate the virtual distance since the last one
    pub fn set_speed(&mut self, actual_speed: f64, virtual_speed: f64, now: Instant) {
        if let Some(last) = self.last_speed_update {
            let seconds = now.saturating_duration_since(last).as_secs_f64();
            self.virtual_distance += self.virtual_speed / 3.6 * seconds;
        }
        self.actual_speed = actual_speed;
        self.virtual_speed = virtual_speed;
        self.last_speed_update = Some(now);
    }

    /// Set the resistance level, clamped to what the brake accepts
    pub fn set_resistance(&mut self, resistance: f64) {
        let clamped = resistance.round().clamp(0.0, f64::from(MAX_RESISTANCE));
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let level = clamped as u16;
        self.resistance = level;
    }

    /// Packet answering the brake's data request
    #[must_use]
    pub fn data_packet(&self) -> Packet {
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let weight = self.rider_weight_kg.round().clamp(0.0, 255.0) as u8;
        protocol::data_packet(self.resistance, weight)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_target_follows_mode() {
        let model = BrakeModel::new(Mode::TargetPower);
        assert_eq!(model.mode(), Mode::TargetPower);
        assert_eq!(model.target_power(), Some(0.0));
        assert_eq!(model.target_slope(), None);
        assert_eq!(model.target_speed(), None);
    }

    #[test]
    fn test_set_parameters_rejects_other_mode() {
        let mut model = BrakeModel::new(Mode::TargetSlope);
        let before = model.clone();

        let result = model.set_parameters(Parameters::TargetPower {
            power_watts: 200.0,
            rider_weight_kg: Some(80.0),
        });

        assert!(matches!(result, Err(BrakeError::InvalidParameters(_))));
        assert_eq!(model, before);
    }

    #[test]
    fn test_set_parameters_updates_target_and_weight() {
        let mut model = BrakeModel::new(Mode::TargetSlope);
        model
            .set_parameters(Parameters::TargetSlope {
                slope_percent: 5.5,
                rider_weight_kg: Some(68.0),
            })
            .unwrap();

        assert_eq!(model.target_slope(), Some(5.5));
        assert!((model.rider_weight_kg - 68.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_set_parameters_range_checks() {
        let mut model = BrakeModel::new(Mode::TargetSpeed);
        assert!(model
            .set_parameters(Parameters::TargetSpeed {
                speed_kmh: -1.0,
                rider_weight_kg: None,
            })
            .is_err());
        assert!(model
            .set_parameters(Parameters::TargetSpeed {
                speed_kmh: 30.0,
                rider_weight_kg: Some(500.0),
            })
            .is_err());
        assert_eq!(model.target_speed(), Some(0.0));
    }

    #[test]
    fn test_distance_integration() {
        let mut model = BrakeModel::new(Mode::TargetSlope);
        let start = Instant::now();

        model.set_speed(36.0, 36.0, start);
        assert!(model.virtual_distance.abs() < f64::EPSILON);

        // 36 km/h = 10 m/s for 2 s
        model.set_speed(36.0, 36.0, start + Duration::from_secs(2));
        assert!((model.virtual_distance - 20.0).abs() < 1e-9);
    }

    #[test]
    fn test_resistance_clamp_and_packet() {
        let mut model = BrakeModel::new(Mode::TargetPower);
        model.set_resistance(5_000.0);
        assert_eq!(model.resistance, MAX_RESISTANCE);
        model.set_resistance(-3.0);
        assert_eq!(model.resistance, 0);

        model.set_resistance(300.0);
        let packet = model.data_packet();
        assert_eq!(packet.as_bytes()[..6], [0xDC, 0x01, 0x00, 0x01, 0x2C, 75]);
    }
}
