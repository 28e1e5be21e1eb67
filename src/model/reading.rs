//! Scale Reading Model
//!
//! This module defines the raw notification frame delivered by the transport and
//! the decoded `Reading`, together with the decoder for the Mi Body Composition
//! Scale measurement characteristic.

use crate::core::constants::FRAME_LEN;
use crate::core::errors::{DecodeError, UnsupportedFlag};
use serde::{Deserialize, Serialize};
use std::fmt;
use time::{Date, Month, OffsetDateTime, PrimitiveDateTime, Time};

/// Helper macro to check if a specific bit is set in a byte.
macro_rules! is_bit_set {
    ($byte:expr, $pos:expr) => {
        ($byte & (1 << $pos)) != 0
    };
}

/// Helper macro to extract a `u16` value in little-endian format from a byte slice.
macro_rules! get_u16_little_endian {
    ($slice:expr, $lsb:expr) => {
        (($slice[1 + $lsb] as u16) << 8) | $slice[$lsb] as u16
    };
}

const CTRL0_POUNDS: u8 = 0;
const CTRL1_IMPEDANCE: u8 = 1;
const CTRL1_STABILIZED: u8 = 5;
const CTRL1_CATTY: u8 = 6;
const CTRL1_WEIGHT_REMOVED: u8 = 7;

const KG_PER_POUND: f64 = 0.453_592_37;
const KG_PER_CATTY: f64 = 0.5;
const MAX_IMPEDANCE_OHMS: u16 = 3000;

/// A single notification as received from the scale, stamped on arrival.
#[derive(Clone, Debug, PartialEq)]
pub struct Frame {
    pub bytes: Vec<u8>,
    pub received_at: OffsetDateTime,
}

impl Frame {
    pub fn new(bytes: Vec<u8>, received_at: OffsetDateTime) -> Self {
        Self { bytes, received_at }
    }

    /// Stamps the bytes with the current wall-clock time.
    pub fn now(bytes: Vec<u8>) -> Self {
        Self::new(bytes, OffsetDateTime::now_utc())
    }
}

/// A decoded weight measurement. Immutable once constructed.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    weight_kg: f64,
    impedance_ohms: Option<f64>,
    stabilized: bool,
    #[serde(with = "time::serde::rfc3339")]
    captured_at: OffsetDateTime,
    /// The scale's own clock, when it reported a valid one.
    scale_time: Option<PrimitiveDateTime>,
}

impl Reading {
    pub fn weight_kg(&self) -> f64 {
        self.weight_kg
    }

    pub fn impedance_ohms(&self) -> Option<f64> {
        self.impedance_ohms
    }

    /// Whether the scale flagged this measurement as settled.
    pub fn is_stabilized(&self) -> bool {
        self.stabilized
    }

    pub fn captured_at(&self) -> OffsetDateTime {
        self.captured_at
    }

    pub fn scale_time(&self) -> Option<PrimitiveDateTime> {
        self.scale_time
    }
}

impl fmt::Display for Reading {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.2} kg", self.weight_kg)?;
        if let Some(impedance) = self.impedance_ohms {
            write!(f, ", {:.0} ohm", impedance)?;
        }
        if self.stabilized {
            write!(f, " (stabilized)")?;
        }
        Ok(())
    }
}

/// Decodes a body composition notification into a `Reading`.
///
/// Pure and deterministic: the capture time comes from the frame, never from
/// the system clock.
pub fn decode(frame: &Frame) -> Result<Reading, DecodeError> {
    let data = frame.bytes.as_slice();
    if data.len() != FRAME_LEN {
        return Err(DecodeError::Malformed {
            expected: FRAME_LEN,
            actual: data.len(),
        });
    }

    let (ctrl0, ctrl1) = (data[0], data[1]);
    if is_bit_set!(ctrl1, CTRL1_WEIGHT_REMOVED) {
        return Err(DecodeError::UnsupportedFlag(UnsupportedFlag::WeightRemoved));
    }
    let pounds = is_bit_set!(ctrl0, CTRL0_POUNDS);
    let catty = is_bit_set!(ctrl1, CTRL1_CATTY);

    let raw_weight = get_u16_little_endian!(data, 11) as f64;
    let weight_kg = match (pounds, catty) {
        (false, false) => raw_weight / 200.0,
        (true, false) => raw_weight / 100.0 * KG_PER_POUND,
        (false, true) => raw_weight / 100.0 * KG_PER_CATTY,
        (true, true) => {
            return Err(DecodeError::UnsupportedFlag(
                UnsupportedFlag::ConflictingUnits,
            ))
        }
    };

    let impedance = get_u16_little_endian!(data, 9);
    let impedance_ohms = (is_bit_set!(ctrl1, CTRL1_IMPEDANCE)
        && impedance > 0
        && impedance < MAX_IMPEDANCE_OHMS)
        .then_some(impedance as f64);

    Ok(Reading {
        weight_kg,
        impedance_ohms,
        stabilized: is_bit_set!(ctrl1, CTRL1_STABILIZED),
        captured_at: frame.received_at,
        scale_time: scale_clock(&data[2..9]),
    })
}

fn scale_clock(data: &[u8]) -> Option<PrimitiveDateTime> {
    let year = get_u16_little_endian!(data, 0) as i32;
    let month = Month::try_from(data[2]).ok()?;
    let date = Date::from_calendar_date(year, month, data[3]).ok()?;
    let time = Time::from_hms(data[4], data[5], data[6]).ok()?;
    Some(PrimitiveDateTime::new(date, time))
}

/// Builds a raw 13-byte frame. Used by the simulated transport and tests.
pub fn encode_frame(weight_kg: f64, impedance: Option<u16>, stabilized: bool) -> Vec<u8> {
    let raw = (weight_kg * 200.0).round() as u16;
    let mut ctrl1 = 0u8;
    if stabilized {
        ctrl1 |= 1 << CTRL1_STABILIZED;
    }
    if impedance.is_some() {
        ctrl1 |= 1 << CTRL1_IMPEDANCE;
    }
    let imp = impedance.unwrap_or(0).to_le_bytes();
    let weight = raw.to_le_bytes();
    let year = 2024u16.to_le_bytes();
    vec![
        0x02, ctrl1, year[0], year[1], 5, 17, 7, 30, 0, imp[0], imp[1], weight[0], weight[1],
    ]
}
