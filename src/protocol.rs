//! GATT UUIDs, command opcodes, mode enumerations, scaling constants and the
//! command-frame builders for Myo armbands.
//!
//! All vendor UUIDs live in the Thalmic namespace
//! `d506XXXX-a904-deb9-4748-2c7f4a124842`; the battery level is the standard
//! Bluetooth SIG characteristic.

use uuid::Uuid;

// ── Characteristics ───────────────────────────────────────────────────────────

/// Command characteristic.  Every frame built in this module is written here
/// as an acknowledged (with-response) write.
pub const COMMAND_CHARACTERISTIC: Uuid =
    Uuid::from_u128(0xd5060401_a904_deb9_4748_2c7f4a124842);

/// Battery voltage readback, millivolts as little-endian `u16`.
///
/// Only consulted when [`BATTERY_CHARACTERISTIC`] cannot be read.
pub const VOLTAGE_CHARACTERISTIC: Uuid =
    Uuid::from_u128(0xd5060404_a904_deb9_4748_2c7f4a124842);

/// Standard Battery Level characteristic (0x2A19): one byte, 0–100 %.
pub const BATTERY_CHARACTERISTIC: Uuid =
    Uuid::from_u128(0x00002a19_0000_1000_8000_00805f9b34fb);

/// Device-info record (20 bytes); the hardware SKU sits at
/// [`INFO_SKU_OFFSET`].
pub const INFO_CHARACTERISTIC: Uuid =
    Uuid::from_u128(0xd5060101_a904_deb9_4748_2c7f4a124842);

/// Firmware version: major, minor, patch as little-endian `u16`s.
pub const FIRMWARE_CHARACTERISTIC: Uuid =
    Uuid::from_u128(0xd5060201_a904_deb9_4748_2c7f4a124842);

/// EMG notification characteristics, indexed by bank:
///
/// | Bank | UUID prefix |
/// |------|-------------|
/// | 0    | d5060105    |
/// | 1    | d5060205    |
/// | 2    | d5060305    |
/// | 3    | d5060405    |
///
/// Every bank delivers the same 16-byte layout (two 8-channel sub-samples).
pub const EMG_CHARACTERISTICS: [Uuid; 4] = [
    Uuid::from_u128(0xd5060105_a904_deb9_4748_2c7f4a124842),
    Uuid::from_u128(0xd5060205_a904_deb9_4748_2c7f4a124842),
    Uuid::from_u128(0xd5060305_a904_deb9_4748_2c7f4a124842),
    Uuid::from_u128(0xd5060405_a904_deb9_4748_2c7f4a124842),
];

/// IMU notification characteristic (orientation, accelerometer, gyroscope).
pub const IMU_CHARACTERISTIC: Uuid = Uuid::from_u128(0xd5060402_a904_deb9_4748_2c7f4a124842);

/// First 16 bits shared by every Myo service UUID.
///
/// Used during scanning to recognise armbands whose advertised name has been
/// changed by the user.
pub const SERVICE_PREFIX: u16 = 0xd506;

/// Every characteristic the session subscribes to, EMG banks first.
pub const STREAM_CHARACTERISTICS: [Uuid; 5] = [
    EMG_CHARACTERISTICS[0],
    EMG_CHARACTERISTICS[1],
    EMG_CHARACTERISTICS[2],
    EMG_CHARACTERISTICS[3],
    IMU_CHARACTERISTIC,
];

// ── Packet sizes & scaling ────────────────────────────────────────────────────

/// EMG notification size: two sub-samples × 8 channels × 1 signed byte.
pub const EMG_PACKET_SIZE: usize = 16;

/// Channels per EMG sub-sample.
pub const EMG_CHANNELS: usize = 8;

/// IMU notification size: ten little-endian `i16` values.
pub const IMU_PACKET_SIZE: usize = 20;

/// Size of the device-info record.
pub const INFO_PACKET_SIZE: usize = 20;

/// Byte offset of the hardware SKU inside the device-info record.
pub const INFO_SKU_OFFSET: usize = 12;

/// Raw orientation units per unit quaternion component.
pub const ORIENTATION_SCALE: f32 = 16384.0;

/// Raw accelerometer units per g.
pub const ACCELEROMETER_SCALE: f32 = 2048.0;

/// Raw gyroscope units per °/s.
pub const GYROSCOPE_SCALE: f32 = 16.0;

// ── Opcodes ───────────────────────────────────────────────────────────────────

/// Command opcodes (first byte of every command frame).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    SetMode = 0x01,
    Vibrate = 0x03,
    DeepSleep = 0x04,
    SetSleepMode = 0x09,
}

/// EMG streaming mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum EmgMode {
    /// Do not send EMG data.
    None = 0x00,
    /// Send the device's filtered EMG.
    Filtered = 0x02,
    /// Send unfiltered EMG.
    #[default]
    Raw = 0x03,
}

/// IMU streaming mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum ImuMode {
    None = 0x00,
    /// Orientation, accelerometer and gyroscope streams.
    #[default]
    DataStreams = 0x01,
    /// Motion events (taps) only.
    MotionEvents = 0x02,
    /// Data streams and motion events.
    All = 0x03,
    /// Unprocessed IMU streams.
    RawData = 0x04,
}

/// Sleep behaviour selected with [`Opcode::SetSleepMode`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SleepMode {
    Normal = 0x00,
    NeverSleep = 0x01,
}

/// Haptic pulse length.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum VibrationPattern {
    Short = 0x01,
    #[default]
    Medium = 0x02,
    Long = 0x03,
}

impl VibrationPattern {
    /// Parse `"short"`, `"medium"` or `"long"` (any case).
    ///
    /// Anything else falls back to [`VibrationPattern::Medium`].
    pub fn from_name(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "short" => Self::Short,
            "long" => Self::Long,
            _ => Self::Medium,
        }
    }
}

impl TryFrom<u8> for EmgMode {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(Self::None),
            0x02 => Ok(Self::Filtered),
            0x03 => Ok(Self::Raw),
            other => Err(other),
        }
    }
}

impl TryFrom<u8> for ImuMode {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(Self::None),
            0x01 => Ok(Self::DataStreams),
            0x02 => Ok(Self::MotionEvents),
            0x03 => Ok(Self::All),
            0x04 => Ok(Self::RawData),
            other => Err(other),
        }
    }
}

// ── Command frames ────────────────────────────────────────────────────────────

/// Build the mode-select frame.
///
/// ```text
/// byte 0 : 0x01 (SetMode)
/// byte 1 : payload length (3)
/// byte 2 : EMG mode
/// byte 3 : IMU mode
/// byte 4 : classifier mode (always 0, disabled)
/// ```
///
/// ```
/// # use myo_rs::protocol::{build_set_mode_frame, EmgMode, ImuMode};
/// assert_eq!(
///     build_set_mode_frame(EmgMode::Raw, ImuMode::DataStreams),
///     [0x01, 0x03, 0x03, 0x01, 0x00]
/// );
/// ```
pub fn build_set_mode_frame(emg: EmgMode, imu: ImuMode) -> [u8; 5] {
    [Opcode::SetMode as u8, 0x03, emg as u8, imu as u8, 0x00]
}

/// Build the keep-alive frame that disables the armband's sleep timer.
pub fn build_keep_alive_frame() -> [u8; 3] {
    [Opcode::SetSleepMode as u8, 0x01, SleepMode::NeverSleep as u8]
}

/// Build a vibration frame.
///
/// ```
/// # use myo_rs::protocol::{build_vibrate_frame, VibrationPattern};
/// assert_eq!(build_vibrate_frame(VibrationPattern::Long), [0x03, 0x01, 0x03]);
/// ```
pub fn build_vibrate_frame(pattern: VibrationPattern) -> [u8; 3] {
    [Opcode::Vibrate as u8, 0x01, pattern as u8]
}

/// Build the deep-sleep frame.  The armband drops the link right after
/// acknowledging it and only wakes up again on USB power.
pub fn build_deep_sleep_frame() -> [u8; 2] {
    [Opcode::DeepSleep as u8, 0x00]
}

// ── Discovery & identification ────────────────────────────────────────────────

/// `true` when an advertisement looks like a Myo armband: either the name
/// contains `name_hint` (case-insensitive) or one of the advertised services
/// starts with [`SERVICE_PREFIX`].
pub fn is_candidate(name: Option<&str>, services: &[Uuid], name_hint: &str) -> bool {
    let hint = name_hint.to_ascii_lowercase();
    let by_name = name
        .map(|n| !hint.is_empty() && n.to_ascii_lowercase().contains(&hint))
        .unwrap_or(false);
    by_name || services.iter().any(|u| (u.as_u128() >> 112) as u16 == SERVICE_PREFIX)
}

/// Display name for a hardware SKU read from the device-info record.
pub fn model_name(sku: Option<u8>) -> &'static str {
    match sku {
        Some(1) => "MYO Black",
        Some(2) => "MYO White",
        Some(3) => "MYOD5",
        _ => "Unknown",
    }
}
