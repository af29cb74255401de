//! types/heartrate.rs
//!
//! Defines the HeartRateSample value carried through the relay, the GATT
//! identifiers of the standard Heart Rate profile, and the decoding of
//! Heart Rate Measurement notifications.

use std::fmt;
use std::num::NonZeroU16;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::RelayError;

/// Bluetooth base UUID (`0000xxxx-0000-1000-8000-00805f9b34fb`).
const BLUETOOTH_BASE_UUID: u128 = 0x0000_0000_0000_1000_8000_0080_5f9b_34fb;

/// Expand a 16-bit assigned number into a full 128-bit UUID.
pub const fn uuid_from_u16(short: u16) -> Uuid {
    Uuid::from_u128(((short as u128) << 96) | BLUETOOTH_BASE_UUID)
}

/// Heart Rate service (`0x180D`).
pub const HEART_RATE_SERVICE: Uuid = uuid_from_u16(0x180D);

/// Heart Rate Measurement characteristic (`0x2A37`).
pub const HEART_RATE_MEASUREMENT: Uuid = uuid_from_u16(0x2A37);

/// Bottom of the avatar fraction range.
pub const FRACTION_FLOOR_BPM: f32 = 40.0;

/// Top of the avatar fraction range.
pub const FRACTION_CEILING_BPM: f32 = 200.0;

/// A single heart-rate reading in beats per minute.
///
/// Zero is not representable: "no reading" is `Option::None`, never `0`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HeartRateSample(NonZeroU16);

impl HeartRateSample {
    /// Returns `None` for a zero reading.
    pub fn new(bpm: u16) -> Option<Self> {
        NonZeroU16::new(bpm).map(Self)
    }

    pub fn bpm(self) -> u16 {
        self.0.get()
    }

    /// Position of this reading within the 40..=200 BPM band, clamped to `[0, 1]`.
    pub fn fraction(self) -> f32 {
        fraction(self.bpm())
    }
}

impl fmt::Display for HeartRateSample {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} BPM", self.bpm())
    }
}

/// `clamp((bpm - 40) / (200 - 40), 0, 1)`
pub fn fraction(bpm: u16) -> f32 {
    let raw = (bpm as f32 - FRACTION_FLOOR_BPM) / (FRACTION_CEILING_BPM - FRACTION_FLOOR_BPM);
    raw.clamp(0.0, 1.0)
}

/// Decode a Heart Rate Measurement notification payload.
///
/// Byte 0 carries the flags; bit 0 selects a little-endian `u16` value in
/// bytes 1..3 instead of a `u8` in byte 1. A zero reading is rejected.
pub fn decode_measurement(payload: &[u8]) -> Result<HeartRateSample, RelayError> {
    let flags = *payload
        .first()
        .ok_or_else(|| RelayError::Protocol("empty heart rate payload".to_string()))?;

    let bpm = if flags & 0x01 == 0x01 {
        match payload.get(1..3) {
            Some(bytes) => u16::from_le_bytes([bytes[0], bytes[1]]),
            None => {
                return Err(RelayError::Protocol(format!(
                    "16-bit heart rate payload too short ({} bytes)",
                    payload.len()
                )))
            }
        }
    } else {
        match payload.get(1) {
            Some(byte) => u16::from(*byte),
            None => {
                return Err(RelayError::Protocol(
                    "8-bit heart rate payload too short (1 byte)".to_string(),
                ))
            }
        }
    };

    HeartRateSample::new(bpm)
        .ok_or_else(|| RelayError::Protocol("sensor reported 0 BPM".to_string()))
}
