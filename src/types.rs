use serde::{Deserialize, Serialize};
use std::{fmt, time::Duration};

/// Ride mode the brake is driven in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Mode {
    /// Rider follows a virtual road gradient
    TargetSlope,
    /// Brake holds the rider at a target speed
    TargetSpeed,
    /// Brake holds the rider at a target power (ERG)
    TargetPower,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TargetSlope => write!(f, "TARGET_SLOPE"),
            Self::TargetSpeed => write!(f, "TARGET_SPEED"),
            Self::TargetPower => write!(f, "TARGET_POWER"),
        }
    }
}

/// Calibration sub-states reported by the brake in its status packets
///
/// The uninitialized state is represented as `None` wherever an
/// `Option<CalibrationState>` appears.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CalibrationState {
    /// Brake has switched into calibration mode
    CalibrationMode,
    /// Brake waits for the rider to reach calibration speed
    CalibrationRequested,
    /// Calibration speed reached
    UpToSpeed,
    /// Rider is coasting down, no error so far
    NoError,
    /// Wheel has stopped (inferred from radio silence)
    Stopped,
    /// Brake is back in normal mode
    NonCalibrationMode,
    /// Calibration value may be requested
    CalibrationValueReady,
    /// Calibration value received (terminal)
    Calibrated,
}

impl fmt::Display for CalibrationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::CalibrationMode => "CALIBRATION_MODE",
            Self::CalibrationRequested => "CALIBRATION_REQUESTED",
            Self::UpToSpeed => "UP_TO_SPEED",
            Self::NoError => "NO_ERROR",
            Self::Stopped => "STOPPED",
            Self::NonCalibrationMode => "NON_CALIBRATION_MODE",
            Self::CalibrationValueReady => "CALIBRATION_VALUE_READY",
            Self::Calibrated => "CALIBRATED",
        };
        write!(f, "{name}")
    }
}

/// Target parameters for the active ride mode
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Parameters {
    /// Virtual road gradient
    TargetSlope {
        /// Gradient in percent
        slope_percent: f64,
        /// Rider weight in kilograms, if known
        rider_weight_kg: Option<f64>,
    },
    /// Target speed
    TargetSpeed {
        /// Speed in km/h
        speed_kmh: f64,
        /// Rider weight in kilograms, if known
        rider_weight_kg: Option<f64>,
    },
    /// Target power
    TargetPower {
        /// Power in watts
        power_watts: f64,
        /// Rider weight in kilograms, if known
        rider_weight_kg: Option<f64>,
    },
}

impl Parameters {
    /// Mode these parameters belong to
    #[must_use]
    pub const fn mode(&self) -> Mode {
        match self {
            Self::TargetSlope { .. } => Mode::TargetSlope,
            Self::TargetSpeed { .. } => Mode::TargetSpeed,
            Self::TargetPower { .. } => Mode::TargetPower,
        }
    }

    /// Rider weight carried by these parameters
    #[must_use]
    pub const fn rider_weight_kg(&self) -> Option<f64> {
        match self {
            Self::TargetSlope {
                rider_weight_kg, ..
            }
            | Self::TargetSpeed {
                rider_weight_kg, ..
            }
            | Self::TargetPower {
                rider_weight_kg, ..
            } => *rider_weight_kg,
        }
    }
}

/// Telemetry channel a watchdog or listener deals with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TelemetryKind {
    /// Speed in km/h
    Speed,
    /// Power in watts
    Power,
    /// Cadence in rpm
    Cadence,
}

impl fmt::Display for TelemetryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Speed => write!(f, "speed"),
            Self::Power => write!(f, "power"),
            Self::Cadence => write!(f, "cadence"),
        }
    }
}

/// One value emitted by a watchdog
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySample {
    /// Channel the value belongs to
    pub kind: TelemetryKind,
    /// Raw value
    pub value: f64,
}

/// Baseline the cadence watchdog falls back to when the brake goes quiet
///
/// Stale cadence has always fallen back to the last known heart rate, which
/// is kept as the default so recorded rides stay comparable. `Zero` is the
/// corrected behaviour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CadenceReset {
    /// Fall back to the model's last heart rate
    #[default]
    LastHeartRate,
    /// Fall back to 0 rpm
    Zero,
}

/// Radio channel identity and timing of the brake
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Device number (0 = wildcard)
    pub device_number: u16,
    /// Device type of the brake
    pub device_type: u8,
    /// Transmission type (0 = wildcard)
    pub transmission_type: u8,
    /// Pairing request flag
    pub pairing: bool,
    /// RF frequency offset in MHz above 2400
    pub frequency: u8,
    /// Channel period in 1/32768 s
    pub period: u16,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            device_number: 0,
            device_type: crate::DEVICE_TYPE,
            transmission_type: 0,
            pairing: false,
            frequency: crate::CHANNEL_FREQUENCY,
            period: crate::CHANNEL_PERIOD,
        }
    }
}

/// Session timing and behaviour configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Watchdog re-emission period in milliseconds
    pub update_period_ms: u64,
    /// Watchdog reset window in milliseconds, must exceed the brake's own
    /// reporting interval (about 2 s)
    pub reset_period_ms: u64,
    /// Timeout for every channel setup step in milliseconds
    pub connect_timeout_ms: u64,
    /// Timeout for the version request in milliseconds
    pub version_timeout_ms: u64,
    /// Status silence that marks the wheel as stopped, in milliseconds
    pub radio_silence_ms: u64,
    /// Speed the rider has to reach during calibration
    pub calibration_speed_kmh: f64,
    /// Upper bound on automatic calibration restarts per `calibrate` call
    pub max_calibration_restarts: u32,
    /// Baseline for the cadence watchdog
    pub cadence_reset: CadenceReset,
    /// Channel identity and timing
    pub channel: ChannelConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            update_period_ms: 1_000,
            reset_period_ms: 5_000,
            connect_timeout_ms: 10_000,
            version_timeout_ms: 10_000,
            radio_silence_ms: 1_000,
            calibration_speed_kmh: crate::CALIBRATION_SPEED_KMH,
            max_calibration_restarts: 3,
            cadence_reset: CadenceReset::LastHeartRate,
            channel: ChannelConfig::default(),
        }
    }
}

impl SessionConfig {
    /// Watchdog re-emission period
    #[must_use]
    pub const fn update_period(&self) -> Duration {
        Duration::from_millis(self.update_period_ms)
    }

    /// Watchdog reset window
    #[must_use]
    pub const fn reset_period(&self) -> Duration {
        Duration::from_millis(self.reset_period_ms)
    }

    /// Channel setup step timeout
    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Version request timeout
    #[must_use]
    pub const fn version_timeout(&self) -> Duration {
        Duration::from_millis(self.version_timeout_ms)
    }

    /// Radio silence timeout
    #[must_use]
    pub const fn radio_silence(&self) -> Duration {
        Duration::from_millis(self.radio_silence_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_config_defaults() {
        let config = SessionConfig::default();

        assert_eq!(config.update_period_ms, 1_000);
        assert_eq!(config.reset_period_ms, 5_000);
        assert_eq!(config.connect_timeout_ms, 10_000);
        assert_eq!(config.version_timeout_ms, 10_000);
        assert_eq!(config.radio_silence_ms, 1_000);
        assert!((config.calibration_speed_kmh - 40.0).abs() < f64::EPSILON);
        assert_eq!(config.max_calibration_restarts, 3);
        assert_eq!(config.cadence_reset, CadenceReset::LastHeartRate);
        assert!(config.reset_period() > config.update_period());
    }

    #[test]
    fn test_channel_config_defaults() {
        let channel = ChannelConfig::default();
        assert_eq!(channel.device_type, 0x51);
        assert_eq!(channel.frequency, 60);
        assert_eq!(channel.period, 4096);
        assert!(!channel.pairing);
    }

    #[test]
    fn test_parameters_mode() {
        let slope = Parameters::TargetSlope {
            slope_percent: 4.0,
            rider_weight_kg: Some(70.0),
        };
        assert_eq!(slope.mode(), Mode::TargetSlope);
        assert_eq!(slope.rider_weight_kg(), Some(70.0));

        let power = Parameters::TargetPower {
            power_watts: 200.0,
            rider_weight_kg: None,
        };
        assert_eq!(power.mode(), Mode::TargetPower);
        assert_eq!(power.rider_weight_kg(), None);
    }

    #[test]
    fn test_state_display() {
        assert_eq!(CalibrationState::NoError.to_string(), "NO_ERROR");
        assert_eq!(
            CalibrationState::CalibrationValueReady.to_string(),
            "CALIBRATION_VALUE_READY"
        );
        assert_eq!(Mode::TargetSpeed.to_string(), "TARGET_SPEED");
    }
}
