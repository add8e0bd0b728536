use std::time::Duration;

use crate::protocol::{EmgMode, ImuMode};

/// Configuration for [`crate::session::MyoSession`].
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// How long a scan listens for advertisements. Default: 4 s.
    pub scan_window: Duration,
    /// Upper bound on opening the transport link. Default: 15 s.
    pub connect_timeout: Duration,
    /// Upper bound on each characteristic read, write or subscribe. Default: 5 s.
    pub io_timeout: Duration,
    /// Upper bound on each unsubscribe during a mode update. Default: 1 s.
    pub unsubscribe_timeout: Duration,
    /// Pause between writing new modes and resubscribing. Default: 200 ms.
    pub settle_delay: Duration,
    /// Upper bound on the best-effort transport disconnect. Default: 2 s.
    pub teardown_timeout: Duration,
    /// Upper bound on any blocking facade call (connect, mode update).
    /// Default: 45 s.
    pub call_timeout: Duration,
    /// Case-insensitive substring that marks an advertised name as an
    /// armband. Default: `"myo"`.
    pub name_hint: String,
    /// EMG mode used by [`crate::session::MyoSession::connect`]. Default: raw.
    pub emg_mode: EmgMode,
    /// IMU mode used by [`crate::session::MyoSession::connect`].
    /// Default: data streams.
    pub imu_mode: ImuMode,
    /// Notifications buffered between the transport and the dispatcher before
    /// new ones are dropped. Default: `256`.
    pub notification_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            scan_window: Duration::from_secs(4),
            connect_timeout: Duration::from_secs(15),
            io_timeout: Duration::from_secs(5),
            unsubscribe_timeout: Duration::from_secs(1),
            settle_delay: Duration::from_millis(200),
            teardown_timeout: Duration::from_secs(2),
            call_timeout: Duration::from_secs(45),
            name_hint: "myo".into(),
            emg_mode: EmgMode::Raw,
            imu_mode: ImuMode::DataStreams,
            notification_capacity: 256,
        }
    }
}
