//! # myo-rs
//!
//! Session manager for the [Thalmic Myo](https://github.com/thalmiclabs/myo-bluetooth)
//! armband over Bluetooth Low Energy: discovery, connection lifecycle,
//! control commands and decoding of the EMG and IMU telemetry streams.
//!
//! The public API is synchronous and thread-safe.  All device I/O runs on an
//! owned background [`executor::Executor`]; telemetry reaches the caller
//! through registered handlers.
//!
//! ## Quick start
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use myo_rs::prelude::*;
//!
//! fn main() -> anyhow::Result<()> {
//!     let executor = Arc::new(Executor::new()?);
//!     let session = MyoSession::bluetooth(Arc::clone(&executor), SessionConfig::default());
//!
//!     session.set_imu_handler(|s| println!("{:?}", s.orientation));
//!     let devices = session.scan()?;
//!     if let Some(device) = devices.first() {
//!         session.connect(&device.address)?;
//!         std::thread::sleep(Duration::from_secs(10));
//!     }
//!     session.shutdown(Duration::from_secs(2))?;
//!     Ok(())
//! }
//! ```
//!
//! ## Module overview
//!
//! | Module | Purpose |
//! |---|---|
//! | [`prelude`] | One-line glob import of the most commonly needed types |
//! | [`session`] | [`session::MyoSession`], the blocking, thread-safe facade |
//! | [`executor`] | The background runtime every session submits its I/O to |
//! | [`transport`] | Abstract transport capability set the session depends on |
//! | [`ble`] | btleplug implementation of [`transport::Transport`] |
//! | [`config`] | Timeouts, scan window and default streaming modes |
//! | [`error`] | [`error::MyoError`] and the transport-level error type |
//! | [`types`] | Telemetry samples, connection state and handler signatures |
//! | [`protocol`] | GATT UUIDs, mode enums and command frame builders |
//! | [`parse`] | Byte-to-sample decoders for EMG, IMU, battery and device info |

pub mod ble;
pub mod config;
mod dispatch;
pub mod error;
pub mod executor;
mod machine;
pub mod parse;
pub mod protocol;
pub mod session;
pub mod transport;
pub mod types;

// ── Prelude ───────────────────────────────────────────────────────────────────

/// Convenience re-exports for downstream crates.
pub mod prelude {
    // ── Session ───────────────────────────────────────────────────────────────
    pub use crate::config::SessionConfig;
    pub use crate::error::MyoError;
    pub use crate::executor::Executor;
    pub use crate::session::MyoSession;

    // ── Data types ────────────────────────────────────────────────────────────
    pub use crate::types::{
        ConnectionReason, ConnectionState, DiscoveredDevice, EmgFrame, ImuSample, Quaternion,
        XyzSample,
    };

    // ── Protocol ──────────────────────────────────────────────────────────────
    pub use crate::protocol::{EmgMode, ImuMode, VibrationPattern};
}
