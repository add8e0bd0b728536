use std::fmt;
use std::sync::Arc;

/// One EMG notification from a single bank.
///
/// The armband packs two consecutive sub-samples of all eight electrodes into
/// every 16-byte notification; values are signed and already scaled by the
/// firmware into the full `i8` range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmgFrame {
    /// Which of the four EMG characteristics delivered this frame (0–3).
    pub bank: u8,
    /// Two sub-samples, oldest first, each ordered by electrode.
    pub samples: [[i8; 8]; 2],
    /// Host receive time in microseconds since the Unix epoch.
    pub timestamp_us: u64,
    /// Lower-case hex of the untouched payload, for passthrough recording.
    pub raw_hex: String,
}

/// Unit quaternion reported by the armband's sensor fusion.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Quaternion {
    pub w: f32,
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

/// A single 3-axis inertial measurement.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct XyzSample {
    /// X-axis value in sensor-specific units (g for accelerometer, °/s for gyroscope).
    pub x: f32,
    /// Y-axis value.
    pub y: f32,
    /// Z-axis value.
    pub z: f32,
}

/// One decoded IMU notification.
#[derive(Debug, Clone, PartialEq)]
pub struct ImuSample {
    pub orientation: Quaternion,
    /// Acceleration in g.
    pub accelerometer: XyzSample,
    /// Angular rate in °/s.
    pub gyroscope: XyzSample,
    /// Host receive time in microseconds since the Unix epoch; the armband does
    /// not timestamp IMU packets.
    pub timestamp_us: u64,
    pub raw_hex: String,
}

/// An armband found by [`crate::session::MyoSession::scan`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredDevice {
    /// Advertised name, or `"Myo Armband"` when the advertisement had none.
    pub name: String,
    /// Platform BLE identifier.
    /// • macOS / Windows: a UUID string
    /// • Linux: a Bluetooth MAC address (`AA:BB:CC:DD:EE:FF`)
    pub address: String,
}

/// Lifecycle of a [`crate::session::MyoSession`].
///
/// ```text
/// Idle ──scan──▶ Scanning ──▶ Idle
/// Idle ──connect──▶ Connecting ──ok──▶ Ready
///                       └──err──▶ Disconnecting ──▶ Idle
/// Ready ──disconnect / link lost──▶ Disconnecting ──▶ Idle
/// any ──shutdown──▶ ShuttingDown
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Idle,
    Scanning,
    Connecting,
    Ready,
    Disconnecting,
    ShuttingDown,
}

impl ConnectionState {
    /// States in which the session owns a transport link.
    pub fn holds_link(self) -> bool {
        matches!(self, Self::Connecting | Self::Ready)
    }
}

/// Why the connection-change handler fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionReason {
    Connected,
    /// Requested disconnect, deep sleep, or a failed connect attempt.
    Disconnect,
    /// The armband dropped the link (out of range, powered off).
    UnexpectedDisconnect,
}

impl ConnectionReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Connected => "connected",
            Self::Disconnect => "disconnect",
            Self::UnexpectedDisconnect => "unexpected_disconnect",
        }
    }
}

impl fmt::Display for ConnectionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// EMG observer: `(bank, frame, timestamp_us, raw_hex)`.
///
/// `frame` is `None` while the configured EMG mode is
/// [`crate::protocol::EmgMode::None`].
pub type EmgHandler = Arc<dyn Fn(u8, Option<&EmgFrame>, u64, &str) + Send + Sync>;

/// IMU observer, invoked once per decoded notification.
pub type ImuHandler = Arc<dyn Fn(&ImuSample) + Send + Sync>;

/// Connection-change observer: `(connected, reason)`.
pub type ConnectionHandler = Arc<dyn Fn(bool, ConnectionReason) + Send + Sync>;
