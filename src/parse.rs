//! Binary decoders for Myo BLE payloads.
//!
//! Everything here is pure apart from reading the wall clock for receipt
//! timestamps, and is safe to call from any async or sync context.
//!
//! | Function | Source | Format |
//! |---|---|---|
//! | [`decode_emg`] | EMG banks 0–3 | 16 × `i8`, two sub-samples of 8 channels |
//! | [`decode_imu`] | IMU | 10 × `i16` LE: quat ÷ 16384, accel ÷ 2048 g, gyro ÷ 16 °/s |
//! | [`decode_battery`] | Battery Level | `u8` percent |
//! | [`estimate_battery_from_voltage`] | Voltage | `u16` LE millivolts |
//! | [`decode_firmware`] | Firmware | 3 × `u16` LE → `"major.minor.patch"` |
//! | [`decode_hardware_sku`] | Device info | byte 12 of the 20-byte record |

use std::fmt::Write as _;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{MyoError, Result};
use crate::protocol::{
    ACCELEROMETER_SCALE, EMG_CHANNELS, EMG_PACKET_SIZE, GYROSCOPE_SCALE, IMU_PACKET_SIZE,
    INFO_PACKET_SIZE, INFO_SKU_OFFSET, ORIENTATION_SCALE,
};
use crate::types::{EmgFrame, ImuSample, Quaternion, XyzSample};

// ── Helpers ───────────────────────────────────────────────────────────────────

/// Wall-clock time in microseconds since the Unix epoch.
pub fn now_us() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

/// Lower-case hex without separators, e.g. `[0xA4, 0x0E]` → `"a40e"`.
pub fn to_hex(data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len() * 2);
    for b in data {
        let _ = write!(out, "{b:02x}");
    }
    out
}

/// Read a little-endian signed 16-bit integer at `offset`.
///
/// # Panics
/// Panics if `offset + 1 >= data.len()`.
fn read_i16_le(data: &[u8], offset: usize) -> i16 {
    i16::from_le_bytes([data[offset], data[offset + 1]])
}

fn check_len(kind: &'static str, data: &[u8], expected: usize) -> Result<()> {
    if data.len() == expected {
        Ok(())
    } else {
        Err(MyoError::MalformedTelemetry {
            kind,
            expected,
            actual: data.len(),
        })
    }
}

// ── EMG ──────────────────────────────────────────────────────────────────────

/// Decode one EMG notification from `bank`.
///
/// The payload must be exactly 16 bytes: bytes 0–7 are the first sub-sample,
/// bytes 8–15 the second, each byte one electrode as a signed 8-bit value.
/// No scaling is applied.
///
/// ```
/// # use myo_rs::parse::decode_emg;
/// let mut payload = [0u8; 16];
/// payload[0] = 0xff;
/// payload[15] = 0x7f;
/// let frame = decode_emg(2, &payload).unwrap();
/// assert_eq!(frame.bank, 2);
/// assert_eq!(frame.samples[0][0], -1);
/// assert_eq!(frame.samples[1][7], 127);
/// assert!(decode_emg(0, &payload[..15]).is_err());
/// ```
pub fn decode_emg(bank: u8, data: &[u8]) -> Result<EmgFrame> {
    check_len("EMG", data, EMG_PACKET_SIZE)?;
    let timestamp_us = now_us();

    let mut samples = [[0i8; EMG_CHANNELS]; 2];
    for (sample, chunk) in samples.iter_mut().zip(data.chunks_exact(EMG_CHANNELS)) {
        for (value, &byte) in sample.iter_mut().zip(chunk) {
            *value = byte as i8;
        }
    }

    Ok(EmgFrame {
        bank,
        samples,
        timestamp_us,
        raw_hex: to_hex(data),
    })
}

// ── IMU ───────────────────────────────────────────────────────────────────────

/// Decode one IMU notification.
///
/// Layout (ten little-endian `i16`):
///
/// | Bytes | Field | Scale |
/// |---|---|---|
/// | 0–7 | quaternion w, x, y, z | ÷ 16384 |
/// | 8–13 | accelerometer x, y, z | ÷ 2048 → g |
/// | 14–19 | gyroscope x, y, z | ÷ 16 → °/s |
///
/// The timestamp is taken at decode time.
pub fn decode_imu(data: &[u8]) -> Result<ImuSample> {
    check_len("IMU", data, IMU_PACKET_SIZE)?;
    let timestamp_us = now_us();

    let scaled = |offset: usize, scale: f32| read_i16_le(data, offset) as f32 / scale;
    let xyz = |offset: usize, scale: f32| XyzSample {
        x: scaled(offset, scale),
        y: scaled(offset + 2, scale),
        z: scaled(offset + 4, scale),
    };

    Ok(ImuSample {
        orientation: Quaternion {
            w: scaled(0, ORIENTATION_SCALE),
            x: scaled(2, ORIENTATION_SCALE),
            y: scaled(4, ORIENTATION_SCALE),
            z: scaled(6, ORIENTATION_SCALE),
        },
        accelerometer: xyz(8, ACCELEROMETER_SCALE),
        gyroscope: xyz(14, GYROSCOPE_SCALE),
        timestamp_us,
        raw_hex: to_hex(data),
    })
}

// ── Readbacks ─────────────────────────────────────────────────────────────────

/// Battery percentage from the standard Battery Level characteristic.
///
/// Returns `None` for an empty payload.
pub fn decode_battery(data: &[u8]) -> Option<u8> {
    data.first().copied()
}

/// Estimate a battery percentage from the voltage characteristic.
///
/// The first two bytes are millivolts (little-endian).  3.7 V maps to 0 %,
/// 4.2 V to 100 %, linearly, clamped and rounded to the nearest percent.
///
/// ```
/// # use myo_rs::parse::estimate_battery_from_voltage;
/// // 0x0EA4 = 3748 mV
/// assert_eq!(estimate_battery_from_voltage(&[0xA4, 0x0E]), Some(10));
/// assert_eq!(estimate_battery_from_voltage(&[0x01]), None);
/// ```
pub fn estimate_battery_from_voltage(data: &[u8]) -> Option<u8> {
    if data.len() < 2 {
        return None;
    }
    let millivolts = u16::from_le_bytes([data[0], data[1]]);
    let volts = millivolts as f64 / 1000.0;
    let fraction = ((volts - 3.7) / 0.5).clamp(0.0, 1.0);
    Some((fraction * 100.0).round() as u8)
}

/// Firmware version string from the first three little-endian `u16`s.
///
/// Returns `None` if fewer than six bytes are present.
pub fn decode_firmware(data: &[u8]) -> Option<String> {
    if data.len() < 6 {
        return None;
    }
    let part = |i: usize| u16::from_le_bytes([data[i], data[i + 1]]);
    Some(format!("{}.{}.{}", part(0), part(2), part(4)))
}

/// Hardware SKU byte from the device-info record.
///
/// Only a complete 20-byte record is trusted; anything else yields `None`.
pub fn decode_hardware_sku(data: &[u8]) -> Option<u8> {
    (data.len() == INFO_PACKET_SIZE).then(|| data[INFO_SKU_OFFSET])
}
