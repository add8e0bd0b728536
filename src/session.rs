//! Thread-safe, synchronous session API.
//!
//! [`MyoSession`] is what a UI, logger or test harness talks to.  Every call
//! is funnelled onto the shared [`Executor`]; blocking calls wait for the
//! result, the rest are fire-and-forget.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};

use crate::ble::BleTransport;
use crate::config::SessionConfig;
use crate::error::{MyoError, Result};
use crate::executor::Executor;
use crate::machine::Machine;
use crate::protocol::{model_name, EmgMode, ImuMode, VibrationPattern};
use crate::transport::Transport;
use crate::types::{ConnectionReason, ConnectionState, DiscoveredDevice, EmgFrame, ImuSample};

/// A session with one Myo armband.
///
/// ```no_run
/// use std::sync::Arc;
/// use std::time::Duration;
/// use myo_rs::prelude::*;
///
/// # fn main() -> Result<(), MyoError> {
/// let executor = Arc::new(Executor::new()?);
/// let session = MyoSession::bluetooth(Arc::clone(&executor), SessionConfig::default());
///
/// session.set_connection_callback(|connected, reason| println!("{connected} ({reason})"));
/// session.set_emg_handler(|bank, frame, _ts, _raw| {
///     if let Some(frame) = frame {
///         println!("bank {bank}: {:?}", frame.samples);
///     }
/// });
///
/// if let Some(device) = session.scan()?.into_iter().next() {
///     session.connect(&device.address)?;
///     session.vibrate(VibrationPattern::Short);
/// }
/// session.shutdown(Duration::from_secs(2))?;
/// executor.shutdown(Duration::from_secs(1));
/// # Ok(())
/// # }
/// ```
pub struct MyoSession {
    executor: Arc<Executor>,
    machine: Arc<Machine>,
    config: SessionConfig,
}

impl MyoSession {
    /// Create an idle session that performs its I/O on `executor` through
    /// `transport`.
    pub fn new(
        executor: Arc<Executor>,
        transport: Arc<dyn Transport>,
        config: SessionConfig,
    ) -> Self {
        let machine = Machine::new(transport, config.clone());
        Self {
            executor,
            machine,
            config,
        }
    }

    /// Create a session on the host's first Bluetooth adapter.
    pub fn bluetooth(executor: Arc<Executor>, config: SessionConfig) -> Self {
        Self::new(executor, Arc::new(BleTransport::new()), config)
    }

    // ── Blocking operations ───────────────────────────────────────────────────

    /// Listen for [`SessionConfig::scan_window`] and return the armbands seen,
    /// one entry per address.  Returns an empty list once shutdown has begun.
    pub fn scan(&self) -> Result<Vec<DiscoveredDevice>> {
        if self.machine.is_shutting_down() {
            return Ok(vec![]);
        }
        let machine = Arc::clone(&self.machine);
        let limit = self.config.scan_window + self.config.call_timeout;
        match self
            .executor
            .run_blocking(async move { machine.scan().await }, Some(limit))
        {
            Ok(result) => result,
            Err(MyoError::ShutdownInProgress) => Ok(vec![]),
            Err(e) => Err(e),
        }
    }

    /// Connect using the modes from [`SessionConfig`] (raw EMG, IMU data
    /// streams by default).
    pub fn connect(&self, address: &str) -> Result<()> {
        self.connect_with_modes(address, self.config.emg_mode, self.config.imu_mode)
    }

    /// Connect, configure and start streaming.
    ///
    /// Any existing connection is silently dropped first.  On error the
    /// session is back in [`ConnectionState::Idle`].
    pub fn connect_with_modes(&self, address: &str, emg: EmgMode, imu: ImuMode) -> Result<()> {
        self.machine.ensure_running()?;
        let machine = Arc::clone(&self.machine);
        let address = address.to_owned();
        let result = self
            .executor
            .run_blocking(
                async move { machine.connect(&address, emg, imu).await },
                Some(self.config.call_timeout),
            )
            .and_then(|r| r);
        if result.is_err() {
            self.recover();
        }
        result
    }

    /// Change streaming modes on a ready connection.  `None` keeps the current
    /// mode.  Returns `false` without any device I/O when not connected.
    pub fn update_modes(&self, emg: Option<EmgMode>, imu: Option<ImuMode>) -> bool {
        if self.machine.is_shutting_down() || !self.connected() {
            return false;
        }
        let machine = Arc::clone(&self.machine);
        match self.executor.run_blocking(
            async move { machine.update_modes(emg, imu).await },
            Some(self.config.call_timeout),
        ) {
            Ok(updated) => updated,
            Err(e) => {
                warn!("update_modes: {e}");
                self.recover();
                false
            }
        }
    }

    /// Stop the session: cancel in-flight operations, release the armband
    /// without further protocol writes and drop every registered handler.
    ///
    /// Blocks for at most `timeout`.  Idempotent; later calls return `Ok`.
    /// Every other call fails fast (or does nothing) once this has started.
    ///
    /// Called from a handler (on the executor thread) it cannot wait: the
    /// link is released in the background as soon as the current operation
    /// lets go of the transition lock.
    pub fn shutdown(&self, timeout: Duration) -> Result<()> {
        if !self.machine.begin_shutdown() {
            return Ok(());
        }
        if self.executor.on_executor_thread() {
            debug!("shutdown requested from a handler; releasing in the background");
            self.finish_shutdown_detached(timeout);
            return Ok(());
        }
        let machine = Arc::clone(&self.machine);
        match self.executor.run_blocking(
            async move { machine.finish_shutdown(timeout).await },
            Some(timeout + Duration::from_millis(100)),
        ) {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                self.finish_shutdown_detached(timeout);
                Err(e)
            }
            // The executor is already gone, and every link with it.
            Err(MyoError::ShutdownInProgress) => Ok(()),
            Err(e) => {
                self.finish_shutdown_detached(timeout);
                Err(e)
            }
        }
    }

    /// Retry the link release without waiting for it.  Bypasses the
    /// shutdown gate in [`Self::detached`].
    fn finish_shutdown_detached(&self, grace: Duration) {
        let machine = Arc::clone(&self.machine);
        self.executor.run_detached(async move {
            if let Err(e) = machine.finish_shutdown(grace).await {
                warn!("background shutdown: {e}");
            }
        });
    }

    // ── Fire-and-forget operations ────────────────────────────────────────────

    /// Disconnect and notify the connection-change handler.
    pub fn disconnect(&self) {
        let machine = Arc::clone(&self.machine);
        self.detached(async move {
            if let Err(e) = machine.disconnect(true).await {
                debug!("disconnect: {e}");
            }
        });
    }

    pub fn vibrate(&self, pattern: VibrationPattern) {
        let machine = Arc::clone(&self.machine);
        self.detached(async move { machine.vibrate(pattern).await });
    }

    /// Put the armband into deep sleep and disconnect.  It only wakes up again
    /// when plugged into USB power.
    pub fn deep_sleep(&self) {
        let machine = Arc::clone(&self.machine);
        self.detached(async move { machine.deep_sleep().await });
    }

    /// Re-read the battery level in the background.
    pub fn refresh_battery(&self) {
        if !self.connected() {
            return;
        }
        let machine = Arc::clone(&self.machine);
        self.detached(async move { machine.refresh_battery().await });
    }

    fn detached<F>(&self, operation: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        if self.machine.is_shutting_down() {
            debug!("ignored: shutdown in progress");
            return;
        }
        self.executor.run_detached(operation);
    }

    fn recover(&self) {
        let machine = Arc::clone(&self.machine);
        self.detached(async move { machine.recover().await });
    }

    // ── Handlers ──────────────────────────────────────────────────────────────

    /// Register the connection-change observer, replacing any earlier one.
    ///
    /// Handlers run on the executor thread and must not call blocking session
    /// methods.
    pub fn set_connection_callback<F>(&self, handler: F)
    where
        F: Fn(bool, ConnectionReason) + Send + Sync + 'static,
    {
        if self.ignore_registration() {
            return;
        }
        self.machine
            .shared()
            .set_connection_handler(Some(Arc::new(handler)));
    }

    /// Register the EMG observer: `(bank, frame, timestamp_us, raw_hex)`.
    pub fn set_emg_handler<F>(&self, handler: F)
    where
        F: Fn(u8, Option<&EmgFrame>, u64, &str) + Send + Sync + 'static,
    {
        if self.ignore_registration() {
            return;
        }
        self.machine.shared().set_emg_handler(Some(Arc::new(handler)));
    }

    pub fn set_imu_handler<F>(&self, handler: F)
    where
        F: Fn(&ImuSample) + Send + Sync + 'static,
    {
        if self.ignore_registration() {
            return;
        }
        self.machine.shared().set_imu_handler(Some(Arc::new(handler)));
    }

    fn ignore_registration(&self) -> bool {
        let shutting_down = self.machine.is_shutting_down();
        if shutting_down {
            debug!("handler registration ignored: shutdown in progress");
        }
        shutting_down
    }

    // ── Accessors ─────────────────────────────────────────────────────────────

    pub fn state(&self) -> ConnectionState {
        self.machine.shared().state()
    }

    pub fn connected(&self) -> bool {
        self.state() == ConnectionState::Ready
    }

    /// Last known battery percentage; `None` when unknown or disconnected.
    pub fn battery(&self) -> Option<u8> {
        self.machine.shared().snapshot().battery
    }

    /// Firmware version as `"major.minor.patch"`.
    pub fn firmware(&self) -> Option<String> {
        self.machine.shared().snapshot().firmware
    }

    pub fn hardware_sku(&self) -> Option<u8> {
        self.machine.shared().snapshot().sku
    }

    /// Display name for the connected hardware, `"Unknown"` if not read.
    pub fn model_name(&self) -> &'static str {
        model_name(self.hardware_sku())
    }

    pub fn last_error(&self) -> Option<String> {
        self.machine.shared().snapshot().last_error
    }

    pub fn emg_mode(&self) -> EmgMode {
        self.machine.shared().snapshot().emg_mode
    }

    pub fn imu_mode(&self) -> ImuMode {
        self.machine.shared().snapshot().imu_mode
    }
}
