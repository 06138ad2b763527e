use crate::{
    error::{BrakeError, Result},
    types::CalibrationState,
};
use bytes::{Buf, BufMut, BytesMut};
use std::fmt;

/// Payload length of a broadcast data message
pub const DATA_LENGTH: usize = 8;

/// Request the brake's software version
pub const PACKET_REQUEST_VERSION: [u8; 2] = [0xAC, 0x02];

/// Switch the brake into calibration mode
pub const PACKET_START_CALIBRATION: [u8; 2] = [0x23, 0x63];

/// Ask for the calibration value once it is ready
pub const PACKET_REQUEST_CALIBRATION_VALUE: [u8; 2] = [0x23, 0x4D];

/// Resume after the wheel stopped during calibration
pub const PACKET_RESUME_AFTER_RESTART: [u8; 2] = [0x23, 0x58];

/// Every calibration status packet starts with this
pub const PREFIX_STATUS: [u8; 1] = [0x22];

/// Speed, power and cadence page
pub const PREFIX_SPEED_POWER: [u8; 1] = [0x01];

/// Left/right power, balance and brake temperature page
pub const PREFIX_BALANCE: [u8; 1] = [0x02];

/// Brake polls the head unit for fresh target data
pub const PREFIX_DATA_REQUEST: [u8; 1] = [0x0D];

/// Software version reply
pub const PREFIX_VERSION: [u8; 2] = [0xAD, 0x02];

/// Header of the target data packet sent in answer to a poll
pub const HEADER_DATA: [u8; 2] = [0xDC, 0x01];

/// Fixed-length radio payload, zero padded
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Packet([u8; DATA_LENGTH]);

impl Packet {
    /// Wrap a full-length payload
    #[must_use]
    pub const fn new(data: [u8; DATA_LENGTH]) -> Self {
        Self(data)
    }

    /// Parse a payload received from the transport
    ///
    /// # Errors
    ///
    /// Returns [`BrakeError::ParseError`] if `data` is not exactly
    /// [`DATA_LENGTH`] bytes long.
    pub fn from_slice(data: &[u8]) -> Result<Self> {
        let bytes: [u8; DATA_LENGTH] = data.try_into().map_err(|_| {
            BrakeError::ParseError(format!(
                "Packet has {} bytes, expected {DATA_LENGTH}",
                data.len()
            ))
        })?;
        Ok(Self(bytes))
    }

    /// Raw payload bytes
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; DATA_LENGTH] {
        &self.0
    }
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Packet({self})")
    }
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, b) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ":")?;
            }
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

/// Build a packet from its leading bytes, right-padding with zeros
///
/// # Errors
///
/// Returns [`BrakeError::ParseError`] if `opcode` is longer than the channel
/// payload.
pub fn encode(opcode: &[u8]) -> Result<Packet> {
    if opcode.len() > DATA_LENGTH {
        return Err(BrakeError::ParseError(format!(
            "Payload of {} bytes does not fit a {DATA_LENGTH} byte packet",
            opcode.len()
        )));
    }

    let mut buf = BytesMut::with_capacity(DATA_LENGTH);
    buf.put_slice(opcode);
    buf.resize(DATA_LENGTH, 0);

    Packet::from_slice(&buf)
}

/// Check whether `packet` starts with `prefix`
#[must_use]
pub fn matches_prefix(packet: &Packet, prefix: &[u8]) -> bool {
    packet.as_bytes().starts_with(prefix)
}

/// Decode the calibration value carried by a `CALIBRATED` status packet
///
/// Big-endian unsigned 16 bit value from bytes 4..6, in tenths.
#[must_use]
pub fn decode_calibration_value(packet: &Packet) -> f64 {
    let mut buf = &packet.as_bytes()[4..6];
    f64::from(buf.get_u16()) / 10.0
}

/// Map a status packet to the calibration state it reports
///
/// Returns `None` for packets without the status prefix and for status
/// patterns the brake is not known to send.
#[must_use]
pub fn classify_status(packet: &Packet) -> Option<CalibrationState> {
    if !matches_prefix(packet, &PREFIX_STATUS) {
        return None;
    }

    let data = packet.as_bytes();
    match (data[1], data[3]) {
        (0x06, 0x02) => Some(CalibrationState::CalibrationMode),
        (0x06, 0x05) => Some(CalibrationState::UpToSpeed),
        (0x06, _) => Some(CalibrationState::CalibrationRequested),
        (0x03, 0x0C) => Some(CalibrationState::NoError),
        (0x03, 0x42) => Some(CalibrationState::Calibrated),
        (0x03, 0x4D) => Some(CalibrationState::CalibrationValueReady),
        (0x03, _) => Some(CalibrationState::NonCalibrationMode),
        _ => None,
    }
}

/// Decoded broadcast from the brake
#[derive(Debug, Clone, PartialEq)]
pub enum BrakePacket {
    /// Speed, power and cadence page
    SpeedPower {
        /// Power in watts
        power: f64,
        /// Speed in km/h
        speed: f64,
        /// Cadence in rpm
        cadence: f64,
        /// Rolling packet counter
        counter: u8,
    },
    /// Left/right power, balance and temperature page
    Balance {
        /// Left leg power in watts
        power_left: f64,
        /// Right leg power in watts
        power_right: f64,
        /// Left share of total power in percent
        balance: u8,
        /// Brake temperature in degrees Celsius
        temperature: f64,
    },
    /// Brake polls for target data
    DataRequest,
    /// Software version reply
    Version(String),
    /// Calibration status packet
    Status(Packet),
    /// Anything not understood
    Unknown(Packet),
}

impl BrakePacket {
    /// Decode a broadcast payload
    #[must_use]
    pub fn parse(packet: &Packet) -> Self {
        let data = packet.as_bytes();

        if matches_prefix(packet, &PREFIX_STATUS) {
            return Self::Status(*packet);
        }

        if matches_prefix(packet, &PREFIX_VERSION) {
            return Self::Version(format!("{}.{}.{}", data[2], data[3], data[4]));
        }

        if matches_prefix(packet, &PREFIX_DATA_REQUEST) {
            return Self::DataRequest;
        }

        let mut buf = &data[1..];

        if matches_prefix(packet, &PREFIX_SPEED_POWER) {
            let power = f64::from(buf.get_u16());
            let speed = f64::from(buf.get_u16()) / 10.0;
            let cadence = f64::from(buf.get_u8());
            let counter = buf.get_u8();
            return Self::SpeedPower {
                power,
                speed,
                cadence,
                counter,
            };
        }

        if matches_prefix(packet, &PREFIX_BALANCE) {
            let power_left = f64::from(buf.get_u16());
            let power_right = f64::from(buf.get_u16());
            let balance = buf.get_u8();
            let temperature = f64::from(buf.get_u8());
            return Self::Balance {
                power_left,
                power_right,
                balance,
                temperature,
            };
        }

        Self::Unknown(*packet)
    }
}

/// Build the target data packet answering the brake's poll
///
/// Layout: `DC 01 00 R_hi R_lo W 00 00` with R the resistance level and W
/// the rider weight in kilograms.
#[must_use]
pub fn data_packet(resistance: u16, rider_weight_kg: u8) -> Packet {
    let mut buf = BytesMut::with_capacity(DATA_LENGTH);
    buf.put_slice(&HEADER_DATA);
    buf.put_u8(0x00);
    buf.put_u16(resistance);
    buf.put_u8(rider_weight_kg);
    buf.resize(DATA_LENGTH, 0);

    let mut bytes = [0u8; DATA_LENGTH];
    bytes.copy_from_slice(&buf);
    Packet::new(bytes)
}
