//! Connection state machine.
//!
//! Every device interaction runs under one exclusive transition lock
//! (`Machine::inner`), so at most one transport operation is in flight per
//! session.  A shutdown flag, checked before and after taking the lock and
//! raced against every transport await, cancels multi-step sequences at
//! their next suspension point.
//!
//! Each opened link gets a generation number.  The unsolicited-disconnect
//! path only tears down the link whose generation it was raised for, and
//! teardown is idempotent, so a stale drop event racing a reconnect is
//! harmless.

use std::collections::HashSet;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use log::{debug, info, warn};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::SessionConfig;
use crate::dispatch;
use crate::error::{MyoError, Result, TransportError};
use crate::executor::lock;
use crate::parse::{
    decode_battery, decode_firmware, decode_hardware_sku, estimate_battery_from_voltage,
};
use crate::protocol::{
    build_deep_sleep_frame, build_keep_alive_frame, build_set_mode_frame, build_vibrate_frame,
    is_candidate, EmgMode, ImuMode, VibrationPattern, BATTERY_CHARACTERISTIC,
    COMMAND_CHARACTERISTIC, FIRMWARE_CHARACTERISTIC, INFO_CHARACTERISTIC,
    STREAM_CHARACTERISTICS, VOLTAGE_CHARACTERISTIC,
};
use crate::transport::{Advertisement, Link, Transport};
use crate::types::{
    ConnectionHandler, ConnectionReason, ConnectionState, DiscoveredDevice, EmgHandler,
    ImuHandler,
};

/// Name reported for armbands that advertise without one.
const FALLBACK_NAME: &str = "Myo Armband";

// ── Shared, lock-free-readable state ──────────────────────────────────────────

/// Snapshot of everything the facade's accessors expose.
#[derive(Debug, Clone, Default)]
pub(crate) struct Status {
    pub state: ConnectionState,
    pub emg_mode: EmgMode,
    pub imu_mode: ImuMode,
    pub battery: Option<u8>,
    pub firmware: Option<String>,
    pub sku: Option<u8>,
    pub last_error: Option<String>,
}

#[derive(Default)]
struct Handlers {
    emg: Option<EmgHandler>,
    imu: Option<ImuHandler>,
    connection: Option<ConnectionHandler>,
}

/// State read by accessors and the notification dispatcher without taking
/// the transition lock.  Only written while the transition lock is held,
/// except for the shutdown transition.
#[derive(Default)]
pub(crate) struct Shared {
    status: Mutex<Status>,
    handlers: Mutex<Handlers>,
    /// Set once subscriptions are live; cleared around teardown and mode
    /// updates so queued notifications are discarded.
    streaming: AtomicBool,
}

impl Shared {
    pub fn snapshot(&self) -> Status {
        lock(&self.status).clone()
    }

    pub fn state(&self) -> ConnectionState {
        lock(&self.status).state
    }

    pub fn update(&self, f: impl FnOnce(&mut Status)) {
        f(&mut lock(&self.status));
    }

    /// Move to `state` unless shutdown has already claimed the session.
    fn set_state(&self, state: ConnectionState) {
        let mut status = lock(&self.status);
        if status.state != ConnectionState::ShuttingDown {
            status.state = state;
        }
    }

    pub fn is_streaming(&self) -> bool {
        self.streaming.load(Ordering::Acquire)
    }

    pub fn set_streaming(&self, on: bool) {
        self.streaming.store(on, Ordering::Release);
    }

    pub fn emg_handler(&self) -> Option<EmgHandler> {
        lock(&self.handlers).emg.clone()
    }

    pub fn imu_handler(&self) -> Option<ImuHandler> {
        lock(&self.handlers).imu.clone()
    }

    pub fn set_emg_handler(&self, handler: Option<EmgHandler>) {
        lock(&self.handlers).emg = handler;
    }

    pub fn set_imu_handler(&self, handler: Option<ImuHandler>) {
        lock(&self.handlers).imu = handler;
    }

    pub fn set_connection_handler(&self, handler: Option<ConnectionHandler>) {
        lock(&self.handlers).connection = handler;
    }

    fn clear_handlers(&self) {
        *lock(&self.handlers) = Handlers::default();
    }

    /// Invoke the connection-change handler outside the handlers lock.
    fn notify(&self, connected: bool, reason: ConnectionReason) {
        let handler = lock(&self.handlers).connection.clone();
        if let Some(handler) = handler {
            handler(connected, reason);
        }
    }
}

// ── Interruptions of a single transport step ──────────────────────────────────

#[derive(Debug, Error)]
enum Interrupt {
    #[error("shutdown in progress")]
    Shutdown,
    #[error("no response within {0:?}")]
    Elapsed(Duration),
    #[error(transparent)]
    Failed(#[from] TransportError),
}

impl Interrupt {
    /// Map a failed command write; anything but shutdown means "not acknowledged".
    fn into_write_error(self, command: &str) -> MyoError {
        match self {
            Interrupt::Shutdown => MyoError::ShutdownInProgress,
            other => MyoError::ProtocolWriteFailure(format!("{command}: {other}")),
        }
    }

    fn into_error(self, step: &str) -> MyoError {
        match self {
            Interrupt::Shutdown => MyoError::ShutdownInProgress,
            Interrupt::Elapsed(limit) => {
                MyoError::ConnectionTimeout(format!("{step}: no response within {limit:?}"))
            }
            Interrupt::Failed(TransportError::NotFound(address)) => {
                MyoError::DeviceNotFound(address)
            }
            Interrupt::Failed(TransportError::TimedOut) => {
                MyoError::ConnectionTimeout(format!("{step}: transport timed out"))
            }
            Interrupt::Failed(e) => MyoError::Unknown(format!("{step}: {e}")),
        }
    }
}

// ── Machine ───────────────────────────────────────────────────────────────────

/// Held under the transition lock.
#[derive(Default)]
struct Inner {
    link: Option<Box<dyn Link>>,
    dispatcher: Option<JoinHandle<()>>,
    generation: u64,
}

pub(crate) struct Machine {
    transport: Arc<dyn Transport>,
    config: SessionConfig,
    inner: tokio::sync::Mutex<Inner>,
    shared: Arc<Shared>,
    shutdown: watch::Sender<bool>,
    me: Weak<Machine>,
}

impl Machine {
    pub fn new(transport: Arc<dyn Transport>, config: SessionConfig) -> Arc<Self> {
        let shared = Arc::new(Shared::default());
        shared.update(|s| {
            s.emg_mode = config.emg_mode;
            s.imu_mode = config.imu_mode;
        });
        Arc::new_cyclic(|me| Self {
            transport,
            config,
            inner: tokio::sync::Mutex::new(Inner::default()),
            shared,
            shutdown: watch::Sender::new(false),
            me: me.clone(),
        })
    }

    pub fn shared(&self) -> &Shared {
        &self.shared
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    pub fn ensure_running(&self) -> Result<()> {
        if self.is_shutting_down() {
            Err(MyoError::ShutdownInProgress)
        } else {
            Ok(())
        }
    }

    /// Await `fut` for at most `limit`, giving up early on shutdown.
    async fn io<T, F>(&self, limit: Duration, fut: F) -> std::result::Result<T, Interrupt>
    where
        F: Future<Output = std::result::Result<T, TransportError>>,
    {
        let mut shutdown = self.shutdown.subscribe();
        tokio::select! {
            biased;
            _ = shutdown.wait_for(|down| *down) => Err(Interrupt::Shutdown),
            outcome = tokio::time::timeout(limit, fut) => match outcome {
                Ok(result) => result.map_err(Interrupt::from),
                Err(_) => Err(Interrupt::Elapsed(limit)),
            },
        }
    }

    /// Sleep for `delay` unless shutdown starts first.
    async fn settle(&self, delay: Duration) -> Result<()> {
        let mut shutdown = self.shutdown.subscribe();
        tokio::select! {
            biased;
            _ = shutdown.wait_for(|down| *down) => Err(MyoError::ShutdownInProgress),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }

    // ── Scan ──────────────────────────────────────────────────────────────────

    pub async fn scan(&self) -> Result<Vec<DiscoveredDevice>> {
        if self.is_shutting_down() {
            return Ok(vec![]);
        }
        let _inner = self.inner.lock().await;
        if self.is_shutting_down() {
            return Ok(vec![]);
        }

        let was_idle = self.shared.state() == ConnectionState::Idle;
        if was_idle {
            self.shared.set_state(ConnectionState::Scanning);
        }
        let window = self.config.scan_window;
        let outcome = self
            .io(window + self.config.io_timeout, self.transport.discover(window))
            .await;
        if was_idle {
            self.shared.set_state(ConnectionState::Idle);
        }

        match outcome {
            Ok(ads) => {
                let found = filter_candidates(ads, &self.config.name_hint);
                info!("scan: {} armband(s) found", found.len());
                Ok(found)
            }
            Err(Interrupt::Shutdown) => Ok(vec![]),
            Err(e) => Err(e.into_error("scan")),
        }
    }

    // ── Connect ───────────────────────────────────────────────────────────────

    pub async fn connect(&self, address: &str, emg: EmgMode, imu: ImuMode) -> Result<()> {
        self.ensure_running()?;
        let mut inner = self.inner.lock().await;
        self.ensure_running()?;

        // Never reuse a stale handle; the silent teardown is not user-visible.
        self.disconnect_locked(&mut inner, false).await;

        inner.generation += 1;
        let generation = inner.generation;
        self.shared.update(|s| {
            s.emg_mode = emg;
            s.imu_mode = imu;
            s.firmware = None;
            s.sku = None;
        });
        self.shared.set_state(ConnectionState::Connecting);
        info!("connecting to {address} (emg={emg:?}, imu={imu:?})");

        match self.establish(&mut inner, address, generation, emg, imu).await {
            Ok(()) => {
                self.shared.set_state(ConnectionState::Ready);
                self.shared.set_streaming(true);
                info!("connected to {address}");
                self.shared.notify(true, ConnectionReason::Connected);
                Ok(())
            }
            Err(err) => {
                self.disconnect_locked(&mut inner, false).await;
                if err == MyoError::ShutdownInProgress || self.is_shutting_down() {
                    debug!("connect to {address} abandoned: shutdown in progress");
                    return Err(MyoError::ShutdownInProgress);
                }
                warn!("connect to {address} failed: {err}");
                self.shared
                    .update(|s| s.last_error = Some(format!("connect failed: {err}")));
                self.shared.notify(false, ConnectionReason::Disconnect);
                Err(err)
            }
        }
    }

    async fn establish(
        &self,
        inner: &mut Inner,
        address: &str,
        generation: u64,
        emg: EmgMode,
        imu: ImuMode,
    ) -> Result<()> {
        let (tx, rx) = mpsc::channel(self.config.notification_capacity.max(1));
        let link = self
            .io(self.config.connect_timeout, self.transport.open(address, tx))
            .await
            .map_err(|e| e.into_error("connect"))?;

        // Stored before configuring so that any exit path, including an
        // aborted caller, leaves the link where teardown can find it.
        inner.link = Some(link);
        inner.dispatcher = Some(tokio::spawn(dispatch::run(
            rx,
            Arc::clone(&self.shared),
            self.me.clone(),
            generation,
        )));
        let link = inner
            .link
            .as_deref()
            .ok_or_else(|| MyoError::Unknown("link vanished during connect".into()))?;

        self.write_command(link, "SetMode", &build_set_mode_frame(emg, imu))
            .await?;
        self.write_command(link, "KeepAlive", &build_keep_alive_frame())
            .await?;

        let battery = self.read_battery(link).await?;
        let sku = self
            .read_optional(link, INFO_CHARACTERISTIC)
            .await?
            .as_deref()
            .and_then(decode_hardware_sku);
        let firmware = self
            .read_optional(link, FIRMWARE_CHARACTERISTIC)
            .await?
            .as_deref()
            .and_then(decode_firmware);
        debug!("battery={battery:?} sku={sku:?} firmware={firmware:?}");
        self.shared.update(|s| {
            s.battery = battery;
            s.sku = sku;
            s.firmware = firmware;
        });

        self.subscribe_all(link).await
    }

    async fn write_command(&self, link: &dyn Link, name: &str, frame: &[u8]) -> Result<()> {
        debug!("write {name}: {frame:02x?}");
        self.io(
            self.config.io_timeout,
            link.write(COMMAND_CHARACTERISTIC, frame),
        )
        .await
        .map_err(|e| e.into_write_error(name))
    }

    /// Best-effort read: `Ok(None)` on any failure except shutdown.
    async fn read_optional(&self, link: &dyn Link, characteristic: Uuid) -> Result<Option<Vec<u8>>> {
        match self.io(self.config.io_timeout, link.read(characteristic)).await {
            Ok(value) => Ok(Some(value)),
            Err(Interrupt::Shutdown) => Err(MyoError::ShutdownInProgress),
            Err(e) => {
                debug!("read {characteristic} failed (ignored): {e}");
                Ok(None)
            }
        }
    }

    /// Battery level, falling back to the voltage estimate.
    async fn read_battery(&self, link: &dyn Link) -> Result<Option<u8>> {
        let level = self
            .read_optional(link, BATTERY_CHARACTERISTIC)
            .await?
            .as_deref()
            .and_then(decode_battery);
        if level.is_some() {
            return Ok(level);
        }
        Ok(self
            .read_optional(link, VOLTAGE_CHARACTERISTIC)
            .await?
            .as_deref()
            .and_then(estimate_battery_from_voltage))
    }

    async fn subscribe_all(&self, link: &dyn Link) -> Result<()> {
        for characteristic in STREAM_CHARACTERISTICS {
            self.io(self.config.io_timeout, link.subscribe(characteristic))
                .await
                .map_err(|e| e.into_error(&format!("subscribe {characteristic}")))?;
        }
        Ok(())
    }

    // ── Disconnect ────────────────────────────────────────────────────────────

    /// Release the link, if any, and return to `Idle`.  Returns whether a link
    /// was actually released.  Never writes protocol commands.
    async fn release(&self, inner: &mut Inner) -> bool {
        self.shared.set_streaming(false);
        if let Some(dispatcher) = inner.dispatcher.take() {
            dispatcher.abort();
        }
        let Some(link) = inner.link.take() else {
            self.shared.set_state(ConnectionState::Idle);
            return false;
        };

        self.shared.set_state(ConnectionState::Disconnecting);
        match tokio::time::timeout(self.config.teardown_timeout, link.disconnect()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!("transport disconnect failed (ignored): {e}"),
            Err(_) => warn!(
                "transport disconnect did not finish within {:?}",
                self.config.teardown_timeout
            ),
        }
        self.shared.update(|s| s.battery = None);
        self.shared.set_state(ConnectionState::Idle);
        info!("disconnected");
        true
    }

    /// The one disconnect operation: `notify` selects whether the
    /// connection-change handler hears about it.
    async fn disconnect_locked(&self, inner: &mut Inner, notify: bool) -> bool {
        let released = self.release(inner).await;
        if released && notify {
            self.shared.notify(false, ConnectionReason::Disconnect);
        }
        released
    }

    pub async fn disconnect(&self, notify: bool) -> Result<()> {
        self.ensure_running()?;
        let mut inner = self.inner.lock().await;
        self.ensure_running()?;
        self.disconnect_locked(&mut inner, notify).await;
        Ok(())
    }

    /// Raised by the dispatcher when the transport reports an unsolicited drop.
    pub async fn on_link_lost(self: Arc<Self>, generation: u64) {
        if self.is_shutting_down() {
            return;
        }
        let mut inner = self.inner.lock().await;
        if self.is_shutting_down() || inner.generation != generation || inner.link.is_none() {
            debug!("link-lost event for generation {generation} is stale, ignoring");
            return;
        }
        warn!("armband dropped the link");
        self.release(&mut inner).await;
        self.shared.notify(false, ConnectionReason::UnexpectedDisconnect);
    }

    /// Bring a session whose operation was abandoned mid-flight back to a
    /// consistent state.
    pub async fn recover(&self) {
        if self.is_shutting_down() {
            return;
        }
        let mut inner = self.inner.lock().await;
        match self.shared.state() {
            ConnectionState::Idle | ConnectionState::Ready | ConnectionState::ShuttingDown => {}
            stuck => {
                warn!("recovering from abandoned {stuck:?} operation");
                self.disconnect_locked(&mut inner, true).await;
            }
        }
    }

    // ── Commands on a ready link ──────────────────────────────────────────────

    pub async fn update_modes(&self, emg: Option<EmgMode>, imu: Option<ImuMode>) -> bool {
        if self.is_shutting_down() {
            return false;
        }
        let mut inner = self.inner.lock().await;
        let status = self.shared.snapshot();
        if self.is_shutting_down() || status.state != ConnectionState::Ready {
            debug!("update_modes ignored in state {:?}", status.state);
            return false;
        }
        let Some(link) = inner.link.as_deref() else {
            return false;
        };
        let emg = emg.unwrap_or(status.emg_mode);
        let imu = imu.unwrap_or(status.imu_mode);

        // Anything still queued from the old modes is dropped.
        self.shared.set_streaming(false);
        for characteristic in STREAM_CHARACTERISTICS {
            match self
                .io(self.config.unsubscribe_timeout, link.unsubscribe(characteristic))
                .await
            {
                Ok(()) => {}
                Err(Interrupt::Shutdown) => return false,
                Err(e) => debug!("unsubscribe {characteristic} failed (ignored): {e}"),
            }
        }

        let outcome = async {
            self.write_command(link, "SetMode", &build_set_mode_frame(emg, imu))
                .await?;
            self.settle(self.config.settle_delay).await?;
            self.subscribe_all(link).await
        }
        .await;

        match outcome {
            Ok(()) => {
                self.shared.update(|s| {
                    s.emg_mode = emg;
                    s.imu_mode = imu;
                });
                self.shared.set_streaming(true);
                info!("modes updated (emg={emg:?}, imu={imu:?})");
                true
            }
            Err(MyoError::ShutdownInProgress) => false,
            Err(err) => {
                // Half-subscribed is not a state we can report; tear down.
                warn!("mode update failed: {err}");
                self.shared
                    .update(|s| s.last_error = Some(format!("mode update failed: {err}")));
                self.disconnect_locked(&mut inner, true).await;
                false
            }
        }
    }

    pub async fn vibrate(&self, pattern: VibrationPattern) {
        if self.is_shutting_down() {
            return;
        }
        let inner = self.inner.lock().await;
        if self.shared.state() != ConnectionState::Ready {
            debug!("vibrate ignored: not connected");
            return;
        }
        if let Some(link) = inner.link.as_deref() {
            if let Err(e) = self
                .write_command(link, "Vibrate", &build_vibrate_frame(pattern))
                .await
            {
                warn!("vibrate failed: {e}");
            }
        }
    }

    /// Send the armband to deep sleep, then disconnect whatever the write did.
    pub async fn deep_sleep(&self) {
        if self.is_shutting_down() {
            return;
        }
        let mut inner = self.inner.lock().await;
        if self.shared.state() != ConnectionState::Ready {
            debug!("deep_sleep ignored: not connected");
            return;
        }
        if let Some(link) = inner.link.as_deref() {
            if let Err(e) = self
                .write_command(link, "DeepSleep", &build_deep_sleep_frame())
                .await
            {
                warn!("deep sleep write failed: {e}");
            }
        }
        if !self.is_shutting_down() {
            self.disconnect_locked(&mut inner, true).await;
        }
    }

    pub async fn refresh_battery(&self) {
        if self.is_shutting_down() {
            return;
        }
        let inner = self.inner.lock().await;
        if self.shared.state() != ConnectionState::Ready {
            return;
        }
        if let Some(link) = inner.link.as_deref() {
            if let Ok(battery) = self.read_battery(link).await {
                self.shared.update(|s| s.battery = battery);
            }
        }
    }

    // ── Shutdown ──────────────────────────────────────────────────────────────

    /// Raise the shutdown flag.  Returns `false` if shutdown had already begun.
    ///
    /// Safe to call from any thread; in-flight operations notice the flag at
    /// their next suspension point and release the transition lock.
    pub fn begin_shutdown(&self) -> bool {
        if self.shutdown.send_replace(true) {
            return false;
        }
        info!("shutting down session");
        self.shared.update(|s| s.state = ConnectionState::ShuttingDown);
        self.shared.set_streaming(false);
        self.shared.clear_handlers();
        true
    }

    /// Release the link without protocol writes.  Waiting for the transition
    /// lock and the transport disconnect together take at most `grace`.
    pub async fn finish_shutdown(&self, grace: Duration) -> Result<()> {
        let deadline = tokio::time::Instant::now() + grace;
        let mut inner = match tokio::time::timeout_at(deadline, self.inner.lock()).await {
            Ok(inner) => inner,
            Err(_) => {
                warn!("transition lock still held after {grace:?}");
                return Err(MyoError::ConnectionTimeout(format!(
                    "shutdown did not complete within {grace:?}"
                )));
            }
        };
        if let Some(dispatcher) = inner.dispatcher.take() {
            dispatcher.abort();
        }
        if let Some(link) = inner.link.take() {
            let limit = self
                .config
                .teardown_timeout
                .min(deadline.saturating_duration_since(tokio::time::Instant::now()));
            match tokio::time::timeout(limit, link.disconnect()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => debug!("disconnect during shutdown failed (ignored): {e}"),
                Err(_) => warn!("disconnect during shutdown timed out after {limit:?}"),
            }
        }
        self.shared.update(|s| s.battery = None);
        info!("session shut down");
        Ok(())
    }
}

/// Keep armband-looking advertisements, first occurrence per address.
fn filter_candidates(ads: Vec<Advertisement>, name_hint: &str) -> Vec<DiscoveredDevice> {
    let mut seen = HashSet::new();
    ads.into_iter()
        .filter(|ad| is_candidate(ad.name.as_deref(), &ad.services, name_hint))
        .filter(|ad| seen.insert(ad.address.clone()))
        .map(|ad| DiscoveredDevice {
            name: ad
                .name
                .filter(|n| !n.is_empty())
                .unwrap_or_else(|| FALLBACK_NAME.into()),
            address: ad.address,
        })
        .collect()
}
