#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(rust_2018_idioms)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

//! # Bushido Brake 🚴
//!
//! A Rust driver for the Tacx Bushido resistance brake over an ANT radio channel.
//!
//! The brake pushes broadcast packets carrying speed, power, cadence and
//! calibration status, and polls the host for the resistance it should apply.
//! This crate turns that into a session with a small async API: pick a ride
//! mode, start the session, feed it targets and listen to telemetry.
//!
//! ## Protocol Overview
//!
//! - **Packets**: 8-byte payloads, zero padded, identified by their leading bytes
//! - **Status**: packets starting with `0x22` carry the calibration sub-state
//! - **Polling**: the brake sends a data request, the host answers with the
//!   target resistance and rider weight
//! - **Calibration**: a guided spin-up and coast-down ending in a calibration value
//!
//! ## Ride Modes
//!
//! | Mode | Default controller |
//! |------|--------------------|
//! | `TARGET_SLOPE` | [`SpeedResistanceMapper`] |
//! | `TARGET_SPEED` | [`SpeedPidController`] |
//! | `TARGET_POWER` | [`PowerPidController`] |
//!
//! ## Radio
//!
//! The crate does not talk to ANT hardware itself. Implement [`RadioNode`] and
//! [`RadioChannel`] for your ANT stack and hand the node to the session.
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use bushido_brake::{BrakeSession, Mode, Parameters, RadioNode, SessionConfig};
//!
//! # async fn run(node: Arc<dyn RadioNode>) -> Result<(), Box<dyn std::error::Error>> {
//! let session = BrakeSession::new(node, Mode::TargetPower, SessionConfig::default());
//! session.start().await?;
//!
//! // Hold 220 W
//! session
//!     .set_parameters(Parameters::TargetPower {
//!         power_watts: 220.0,
//!         rider_weight_kg: Some(75.0),
//!     })
//!     .await?;
//!
//! session.request_version(|version| println!("Brake firmware {version}")).await?;
//!
//! session.stop().await?;
//! # Ok(())
//! # }
//! ```

/// Brake calibration state machine and orchestration
pub mod calibration;
/// Resistance controllers for each ride mode
pub mod controller;
/// Debounced answers to the brake's data requests
pub mod correlator;
/// Error types and handling
pub mod error;
/// Telemetry listener registry
pub mod listener;
/// Shared telemetry and target model
pub mod model;
/// Cycling physics for virtual speed
pub mod physics;
/// Packet layout, encoding and decoding
pub mod protocol;
/// Radio transport interfaces
pub mod radio;
/// Single-writer outbound queue with retry
pub mod sender;
/// Brake session lifecycle
pub mod session;
/// Type definitions and configuration
pub mod types;
/// Periodic re-emission of telemetry
pub mod watchdog;

// Re-export the main types for convenient usage
pub use calibration::{CalibrationCallback, CalibrationStateMachine, Transition};
pub use controller::{
    default_controller, PowerPidController, ResistanceController, SpeedPidController,
    SpeedResistanceMapper,
};
pub use error::{BrakeError, Result};
pub use listener::TelemetryListener;
pub use model::BrakeModel;
pub use radio::{RadioChannel, RadioNode};
pub use session::BrakeSession;
pub use types::{
    CadenceReset, CalibrationState, ChannelConfig, Mode, Parameters, SessionConfig,
    TelemetryKind, TelemetrySample,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Device type the brake announces on its ANT channel
pub const DEVICE_TYPE: u8 = 0x51;

/// Speed the rider has to reach during calibration, in km/h
pub const CALIBRATION_SPEED_KMH: f64 = 40.0;

/// RF frequency offset of the brake channel (2460 MHz)
pub const CHANNEL_FREQUENCY: u8 = 60;

/// Message period of the brake channel, in 1/32768 s (8 Hz)
pub const CHANNEL_PERIOD: u16 = 4096;
