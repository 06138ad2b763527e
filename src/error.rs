use thiserror::Error;

use crate::types::{CalibrationState, Mode};

/// Errors that can occur when driving a Bushido brake
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BrakeError {
    /// No free radio channel on the node
    #[error("Too few radio channels available")]
    ChannelUnavailable,

    /// A channel configuration step did not complete in time
    #[error("Channel setup timed out after {timeout_ms}ms")]
    ConnectTimeout {
        /// Timeout duration in milliseconds
        timeout_ms: u64,
    },

    /// The operation was cancelled before it could complete
    #[error("Operation interrupted")]
    Interrupted,

    /// An outbound send was not acknowledged in time
    #[error("Send timed out after {timeout_ms}ms")]
    Timeout {
        /// Timeout duration in milliseconds
        timeout_ms: u64,
    },

    /// The device reported a calibration state that is not the legal successor
    #[error("Illegal calibration transition: {} -> {to}", display_state(.from))]
    IllegalTransition {
        /// State the machine was in
        from: Option<CalibrationState>,
        /// State that was requested
        to: CalibrationState,
    },

    /// The overall calibration deadline expired
    #[error("Max calibration time expired")]
    CalibrationTimeout,

    /// A calibration attempt is already running
    #[error("Calibration already in progress")]
    CalibrationInProgress,

    /// The resistance controller does not support the session mode
    #[error("Invalid controller: {controller} for mode: {mode}")]
    ConfigurationMismatch {
        /// Name of the rejected controller
        controller: String,
        /// Mode the session was configured for
        mode: Mode,
    },

    /// Invalid parameters
    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    /// The session has not been started
    #[error("Session not started")]
    NotStarted,

    /// The session is already running
    #[error("Session already started")]
    AlreadyStarted,

    /// Error reported by the radio transport
    #[error("Radio error: {0}")]
    Radio(String),

    /// Packet parsing failed
    #[error("Failed to parse packet: {0}")]
    ParseError(String),
}

fn display_state(state: &Option<CalibrationState>) -> String {
    state.map_or_else(|| "UNINITIALIZED".to_string(), |s| s.to_string())
}

/// Result type for brake operations
pub type Result<T> = std::result::Result<T, BrakeError>;

impl BrakeError {
    /// Check if this error must abort session start
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::ChannelUnavailable | Self::ConfigurationMismatch { .. } | Self::ParseError(_)
        )
    }

    /// Check if an outbound send hitting this error may be tried again
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::Radio(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let channel_error = BrakeError::ChannelUnavailable;
        assert!(channel_error.is_fatal());
        assert!(!channel_error.is_retryable());

        let timeout_error = BrakeError::Timeout { timeout_ms: 2000 };
        assert!(!timeout_error.is_fatal());
        assert!(timeout_error.is_retryable());

        let transition_error = BrakeError::IllegalTransition {
            from: Some(CalibrationState::NoError),
            to: CalibrationState::Calibrated,
        };
        assert!(!transition_error.is_fatal());
        assert!(!transition_error.is_retryable());
    }

    #[test]
    fn test_error_display() {
        let error = BrakeError::ConfigurationMismatch {
            controller: "SpeedResistanceMapper".to_string(),
            mode: Mode::TargetPower,
        };
        let error_string = format!("{error}");
        assert!(error_string.contains("SpeedResistanceMapper"));
        assert!(error_string.contains("TARGET_POWER"));

        let error = BrakeError::IllegalTransition {
            from: None,
            to: CalibrationState::UpToSpeed,
        };
        assert_eq!(
            error.to_string(),
            "Illegal calibration transition: UNINITIALIZED -> UP_TO_SPEED"
        );
    }
}
