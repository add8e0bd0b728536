//! End-to-end session behaviour against an in-memory transport.

use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::mpsc;
use uuid::Uuid;

use myo_rs::error::TransportError;
use myo_rs::prelude::*;
use myo_rs::protocol::{
    BATTERY_CHARACTERISTIC, COMMAND_CHARACTERISTIC, EMG_CHARACTERISTICS, FIRMWARE_CHARACTERISTIC,
    IMU_CHARACTERISTIC, INFO_CHARACTERISTIC, STREAM_CHARACTERISTICS, VOLTAGE_CHARACTERISTIC,
};
use myo_rs::transport::{Advertisement, Link, LinkEvent, Transport};

const ARMBAND: &str = "C8:2F:AB:00:11:22";
const MYO_SERVICE: Uuid = Uuid::from_u128(0xd5060001_a904_deb9_4748_2c7f4a124842);

// ── Fake transport ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
enum Op {
    Open,
    Write(Uuid, Vec<u8>),
    Read(Uuid),
    Subscribe(Uuid),
    Unsubscribe(Uuid),
    Disconnect,
}

#[derive(Default)]
struct FakeTransport {
    advertisements: Vec<Advertisement>,
    /// `open` reports that no such device exists.
    missing: bool,
    /// Command writes are never acknowledged.
    reject_writes: bool,
    /// The standard battery characteristic cannot be read.
    battery_unreadable: bool,
    battery: AtomicU8,
    open_delay: Duration,
    /// The armband drops the link while `open` is still returning.
    drop_during_open: bool,
    ops: Arc<Mutex<Vec<Op>>>,
    open_links: Arc<AtomicUsize>,
    events: Mutex<Option<mpsc::Sender<LinkEvent>>>,
}

impl FakeTransport {
    fn new() -> Self {
        Self {
            battery: AtomicU8::new(87),
            ..Self::default()
        }
    }

    fn ops(&self) -> Vec<Op> {
        self.ops.lock().unwrap().clone()
    }

    fn clear_ops(&self) {
        self.ops.lock().unwrap().clear();
    }

    fn open_links(&self) -> usize {
        self.open_links.load(Ordering::SeqCst)
    }

    /// Push an event into the most recently opened link's queue.
    fn inject(&self, event: LinkEvent) {
        let events = self.events.lock().unwrap();
        events
            .as_ref()
            .expect("no link opened yet")
            .try_send(event)
            .expect("notification queue full or closed");
    }

    /// Like [`Self::inject`], but ignores a closed or missing queue.
    fn try_inject(&self, event: LinkEvent) {
        if let Some(events) = self.events.lock().unwrap().as_ref() {
            let _ = events.try_send(event);
        }
    }

    fn notify(&self, characteristic: Uuid, value: Vec<u8>) {
        self.inject(LinkEvent::Notification {
            characteristic,
            value,
        });
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn discover(&self, window: Duration) -> Result<Vec<Advertisement>, TransportError> {
        tokio::time::sleep(window).await;
        Ok(self.advertisements.clone())
    }

    async fn open(
        &self,
        address: &str,
        events: mpsc::Sender<LinkEvent>,
    ) -> Result<Box<dyn Link>, TransportError> {
        if self.missing {
            return Err(TransportError::NotFound(address.to_owned()));
        }
        if !self.open_delay.is_zero() {
            tokio::time::sleep(self.open_delay).await;
        }
        self.ops.lock().unwrap().push(Op::Open);
        if self.drop_during_open {
            let _ = events.try_send(LinkEvent::Disconnected);
        }
        *self.events.lock().unwrap() = Some(events);
        self.open_links.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeLink {
            ops: Arc::clone(&self.ops),
            open_links: Arc::clone(&self.open_links),
            closed: AtomicBool::new(false),
            reject_writes: self.reject_writes,
            battery: if self.battery_unreadable {
                None
            } else {
                Some(self.battery.load(Ordering::SeqCst))
            },
        }))
    }
}

struct FakeLink {
    ops: Arc<Mutex<Vec<Op>>>,
    open_links: Arc<AtomicUsize>,
    closed: AtomicBool,
    reject_writes: bool,
    battery: Option<u8>,
}

impl FakeLink {
    fn record(&self, op: Op) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::NotConnected);
        }
        self.ops.lock().unwrap().push(op);
        Ok(())
    }
}

#[async_trait]
impl Link for FakeLink {
    async fn write(&self, characteristic: Uuid, payload: &[u8]) -> Result<(), TransportError> {
        self.record(Op::Write(characteristic, payload.to_vec()))?;
        if self.reject_writes {
            return Err(TransportError::Other("write not acknowledged".into()));
        }
        Ok(())
    }

    async fn read(&self, characteristic: Uuid) -> Result<Vec<u8>, TransportError> {
        self.record(Op::Read(characteristic))?;
        match characteristic {
            c if c == BATTERY_CHARACTERISTIC => self
                .battery
                .map(|level| vec![level])
                .ok_or_else(|| TransportError::Other("read not permitted".into())),
            c if c == VOLTAGE_CHARACTERISTIC => Ok(vec![0xA4, 0x0E]),
            c if c == INFO_CHARACTERISTIC => {
                let mut info = vec![0u8; 20];
                info[12] = 2;
                Ok(info)
            }
            // 1.5.1970
            c if c == FIRMWARE_CHARACTERISTIC => Ok(vec![1, 0, 5, 0, 0xB2, 0x07]),
            other => Err(TransportError::MissingCharacteristic(other)),
        }
    }

    async fn subscribe(&self, characteristic: Uuid) -> Result<(), TransportError> {
        self.record(Op::Subscribe(characteristic))
    }

    async fn unsubscribe(&self, characteristic: Uuid) -> Result<(), TransportError> {
        self.record(Op::Unsubscribe(characteristic))
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.ops.lock().unwrap().push(Op::Disconnect);
            self.open_links.fetch_sub(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

// ── Helpers ───────────────────────────────────────────────────────────────────

fn fast_config() -> SessionConfig {
    SessionConfig {
        scan_window: Duration::from_millis(20),
        connect_timeout: Duration::from_secs(2),
        io_timeout: Duration::from_secs(1),
        unsubscribe_timeout: Duration::from_millis(200),
        settle_delay: Duration::from_millis(10),
        teardown_timeout: Duration::from_millis(500),
        call_timeout: Duration::from_secs(10),
        ..SessionConfig::default()
    }
}

struct Harness {
    fake: Arc<FakeTransport>,
    session: Arc<MyoSession>,
    changes: Arc<Mutex<Vec<(bool, ConnectionReason)>>>,
    _executor: Arc<Executor>,
}

fn harness(fake: FakeTransport) -> Harness {
    let executor = Arc::new(Executor::new().unwrap());
    let fake = Arc::new(fake);
    let session = Arc::new(MyoSession::new(
        Arc::clone(&executor),
        Arc::clone(&fake) as Arc<dyn Transport>,
        fast_config(),
    ));

    let changes = Arc::new(Mutex::new(vec![]));
    let sink = Arc::clone(&changes);
    session.set_connection_callback(move |connected, reason| {
        sink.lock().unwrap().push((connected, reason));
    });

    Harness {
        fake,
        session,
        changes,
        _executor: executor,
    }
}

impl Harness {
    fn changes(&self) -> Vec<(bool, ConnectionReason)> {
        self.changes.lock().unwrap().clone()
    }
}

fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(5));
    }
}

fn imu_payload(raw: [i16; 10]) -> Vec<u8> {
    raw.iter().flat_map(|v| v.to_le_bytes()).collect()
}

// ── Scan ──────────────────────────────────────────────────────────────────────

#[test]
fn scan_filters_and_deduplicates() {
    let h = harness(FakeTransport {
        advertisements: vec![
            Advertisement {
                name: Some("Myo-Left".into()),
                address: "AA".into(),
                services: vec![],
            },
            Advertisement {
                name: Some("Myo-Left".into()),
                address: "AA".into(),
                services: vec![],
            },
            Advertisement {
                name: Some("Keyboard".into()),
                address: "BB".into(),
                services: vec![],
            },
            Advertisement {
                name: None,
                address: "CC".into(),
                services: vec![MYO_SERVICE],
            },
        ],
        ..FakeTransport::new()
    });

    let found = h.session.scan().unwrap();
    assert_eq!(
        found,
        vec![
            DiscoveredDevice {
                name: "Myo-Left".into(),
                address: "AA".into()
            },
            DiscoveredDevice {
                name: "Myo Armband".into(),
                address: "CC".into()
            },
        ]
    );
    assert_eq!(h.session.state(), ConnectionState::Idle);
}

// ── Connect ───────────────────────────────────────────────────────────────────

#[test]
fn connect_configures_reads_and_subscribes() {
    let h = harness(FakeTransport::new());
    h.session.connect(ARMBAND).unwrap();

    assert!(h.session.connected());
    assert_eq!(h.changes(), vec![(true, ConnectionReason::Connected)]);
    assert_eq!(h.session.battery(), Some(87));
    assert_eq!(h.session.firmware().as_deref(), Some("1.5.1970"));
    assert_eq!(h.session.hardware_sku(), Some(2));
    assert_eq!(h.session.model_name(), "MYO White");
    assert_eq!(h.session.emg_mode(), EmgMode::Raw);
    assert_eq!(h.session.imu_mode(), ImuMode::DataStreams);

    let ops = h.fake.ops();
    assert_eq!(ops[0], Op::Open);
    assert_eq!(
        ops[1],
        Op::Write(COMMAND_CHARACTERISTIC, vec![0x01, 0x03, 0x03, 0x01, 0x00])
    );
    assert_eq!(ops[2], Op::Write(COMMAND_CHARACTERISTIC, vec![0x09, 0x01, 0x01]));
    let subscribed: Vec<_> = ops
        .iter()
        .filter_map(|op| match op {
            Op::Subscribe(c) => Some(*c),
            _ => None,
        })
        .collect();
    assert_eq!(subscribed, STREAM_CHARACTERISTICS);
    assert_eq!(h.fake.open_links(), 1);
}

#[test]
fn connect_to_missing_device_leaves_session_idle() {
    let h = harness(FakeTransport {
        missing: true,
        ..FakeTransport::new()
    });

    let err = h.session.connect(ARMBAND).unwrap_err();
    assert_eq!(err, MyoError::DeviceNotFound(ARMBAND.into()));
    assert_eq!(h.session.state(), ConnectionState::Idle);
    assert!(h.changes().iter().all(|(connected, _)| !connected));
    assert!(h.session.last_error().is_some());
    assert_eq!(h.fake.open_links(), 0);
}

#[test]
fn unacknowledged_write_rolls_back_the_connect() {
    let h = harness(FakeTransport {
        reject_writes: true,
        ..FakeTransport::new()
    });

    let err = h.session.connect(ARMBAND).unwrap_err();
    assert!(matches!(err, MyoError::ProtocolWriteFailure(_)), "{err:?}");
    assert_eq!(h.session.state(), ConnectionState::Idle);
    assert_eq!(h.changes(), vec![(false, ConnectionReason::Disconnect)]);
    assert_eq!(h.fake.open_links(), 0);
    assert_eq!(h.fake.ops().last(), Some(&Op::Disconnect));
}

#[test]
fn battery_falls_back_to_the_voltage_estimate() {
    let h = harness(FakeTransport {
        battery_unreadable: true,
        ..FakeTransport::new()
    });
    h.session.connect(ARMBAND).unwrap();
    assert_eq!(h.session.battery(), Some(10));
}

#[test]
fn reconnect_silently_drops_the_previous_link() {
    let h = harness(FakeTransport::new());
    h.session.connect(ARMBAND).unwrap();
    h.session.connect(ARMBAND).unwrap();

    assert_eq!(h.fake.open_links(), 1);
    assert_eq!(
        h.changes(),
        vec![
            (true, ConnectionReason::Connected),
            (true, ConnectionReason::Connected)
        ]
    );
}

// ── Commands ──────────────────────────────────────────────────────────────────

#[test]
fn update_modes_while_idle_does_no_io() {
    let h = harness(FakeTransport::new());
    assert!(!h.session.update_modes(Some(EmgMode::Filtered), None));
    assert!(h.fake.ops().is_empty());
}

#[test]
fn update_modes_resubscribes_with_the_new_modes() {
    let h = harness(FakeTransport::new());
    h.session.connect(ARMBAND).unwrap();
    h.fake.clear_ops();

    assert!(h.session.update_modes(Some(EmgMode::None), None));
    assert_eq!(h.session.emg_mode(), EmgMode::None);
    assert_eq!(h.session.imu_mode(), ImuMode::DataStreams);

    let ops = h.fake.ops();
    let set_mode = Op::Write(COMMAND_CHARACTERISTIC, vec![0x01, 0x03, 0x00, 0x01, 0x00]);
    let write_at = ops.iter().position(|op| *op == set_mode).unwrap();
    assert!(ops[..write_at]
        .iter()
        .all(|op| matches!(op, Op::Unsubscribe(_))));
    assert_eq!(
        ops[write_at + 1..]
            .iter()
            .filter(|op| matches!(op, Op::Subscribe(_)))
            .count(),
        STREAM_CHARACTERISTICS.len()
    );
    assert!(h.session.connected());
}

#[test]
fn vibrate_writes_the_pattern() {
    let h = harness(FakeTransport::new());
    h.session.connect(ARMBAND).unwrap();

    h.session.vibrate(VibrationPattern::from_name("long"));
    let expected = Op::Write(COMMAND_CHARACTERISTIC, vec![0x03, 0x01, 0x03]);
    wait_until("vibrate write", || h.fake.ops().contains(&expected));
}

#[test]
fn deep_sleep_writes_then_disconnects() {
    let h = harness(FakeTransport::new());
    h.session.connect(ARMBAND).unwrap();
    h.fake.clear_ops();

    h.session.deep_sleep();
    wait_until("idle after deep sleep", || {
        h.session.state() == ConnectionState::Idle
    });
    assert_eq!(
        h.fake.ops(),
        vec![
            Op::Write(COMMAND_CHARACTERISTIC, vec![0x04, 0x00]),
            Op::Disconnect
        ]
    );
    assert_eq!(h.session.battery(), None);
    assert_eq!(
        h.changes().last(),
        Some(&(false, ConnectionReason::Disconnect))
    );
}

#[test]
fn refresh_battery_rereads_the_level() {
    let h = harness(FakeTransport::new());
    h.session.connect(ARMBAND).unwrap();
    h.fake.clear_ops();

    h.session.refresh_battery();
    wait_until("battery read", || {
        h.fake.ops().contains(&Op::Read(BATTERY_CHARACTERISTIC))
    });
    assert_eq!(h.session.battery(), Some(87));
}

#[test]
fn explicit_disconnect_notifies() {
    let h = harness(FakeTransport::new());
    h.session.connect(ARMBAND).unwrap();

    h.session.disconnect();
    wait_until("idle", || h.session.state() == ConnectionState::Idle);
    assert_eq!(
        h.changes(),
        vec![
            (true, ConnectionReason::Connected),
            (false, ConnectionReason::Disconnect)
        ]
    );
    assert_eq!(h.fake.open_links(), 0);
}

// ── Telemetry ─────────────────────────────────────────────────────────────────

#[test]
fn notifications_reach_the_handlers() {
    let h = harness(FakeTransport::new());
    let emg = Arc::new(Mutex::new(vec![]));
    let imu = Arc::new(Mutex::new(vec![]));

    let sink = Arc::clone(&emg);
    h.session.set_emg_handler(move |bank, frame, _ts, raw| {
        sink.lock()
            .unwrap()
            .push((bank, frame.map(|f| f.samples), raw.to_owned()));
    });
    let sink = Arc::clone(&imu);
    h.session
        .set_imu_handler(move |sample| sink.lock().unwrap().push(sample.clone()));

    h.session.connect(ARMBAND).unwrap();

    let mut payload = vec![0u8; 16];
    payload[0] = 0xFF;
    payload[15] = 0x7F;
    h.fake.notify(EMG_CHARACTERISTICS[3], payload);
    h.fake.notify(EMG_CHARACTERISTICS[0], vec![0u8; 15]);
    h.fake.notify(IMU_CHARACTERISTIC, vec![0u8; 19]);
    h.fake.notify(
        IMU_CHARACTERISTIC,
        imu_payload([16384, 0, 0, 0, 2048, 0, -2048, 160, 0, 0]),
    );

    wait_until("imu sample", || !imu.lock().unwrap().is_empty());

    let emg = emg.lock().unwrap();
    assert_eq!(emg.len(), 1);
    let (bank, samples, raw) = &emg[0];
    assert_eq!(*bank, 3);
    let samples = samples.unwrap();
    assert_eq!(samples[0][0], -1);
    assert_eq!(samples[1][7], 127);
    assert_eq!(raw, "ff00000000000000000000000000007f");

    let imu = imu.lock().unwrap();
    assert_eq!(imu.len(), 1);
    let s = &imu[0];
    assert!((s.orientation.w - 1.0).abs() < 1e-6);
    assert_eq!(s.orientation.x, 0.0);
    assert!((s.accelerometer.x - 1.0).abs() < 1e-6);
    assert!((s.accelerometer.z + 1.0).abs() < 1e-6);
    assert!((s.gyroscope.x - 10.0).abs() < 1e-6);
}

#[test]
fn emg_frame_is_withheld_when_emg_is_disabled() {
    let h = harness(FakeTransport::new());
    let frames = Arc::new(Mutex::new(vec![]));
    let sink = Arc::clone(&frames);
    h.session.set_emg_handler(move |bank, frame, _ts, raw| {
        sink.lock()
            .unwrap()
            .push((bank, frame.is_some(), raw.len()));
    });

    h.session
        .connect_with_modes(ARMBAND, EmgMode::None, ImuMode::DataStreams)
        .unwrap();
    h.fake.notify(EMG_CHARACTERISTICS[1], vec![1u8; 16]);

    wait_until("emg callback", || !frames.lock().unwrap().is_empty());
    assert_eq!(*frames.lock().unwrap(), vec![(1, false, 32)]);
}

// ── Link loss ─────────────────────────────────────────────────────────────────

#[test]
fn unsolicited_disconnect_returns_to_idle() {
    let h = harness(FakeTransport::new());
    h.session.connect(ARMBAND).unwrap();

    h.fake.inject(LinkEvent::Disconnected);
    wait_until("idle after link loss", || {
        h.session.state() == ConnectionState::Idle
    });
    wait_until("link-lost notification", || h.changes().len() == 2);

    assert_eq!(
        h.changes()[1],
        (false, ConnectionReason::UnexpectedDisconnect)
    );
    assert_eq!(h.fake.open_links(), 0);
    assert_eq!(h.session.battery(), None);

    // The session is reusable afterwards.
    h.session.connect(ARMBAND).unwrap();
    assert!(h.session.connected());
}

#[test]
fn link_drop_during_connect_ends_idle() {
    let h = harness(FakeTransport {
        drop_during_open: true,
        ..FakeTransport::new()
    });

    h.session.connect(ARMBAND).unwrap();
    wait_until("idle after link loss", || {
        h.session.state() == ConnectionState::Idle
    });
    wait_until("link-lost notification", || h.changes().len() == 2);

    assert_eq!(
        h.changes(),
        vec![
            (true, ConnectionReason::Connected),
            (false, ConnectionReason::UnexpectedDisconnect)
        ]
    );
    assert_eq!(h.fake.open_links(), 0);
}

// ── Shutdown ──────────────────────────────────────────────────────────────────

#[test]
fn shutdown_is_idempotent_and_rejects_later_calls() {
    let h = harness(FakeTransport::new());
    h.session.connect(ARMBAND).unwrap();

    h.session.shutdown(Duration::from_secs(1)).unwrap();
    h.session.shutdown(Duration::from_secs(1)).unwrap();

    assert_eq!(h.session.state(), ConnectionState::ShuttingDown);
    assert!(!h.session.state().holds_link());
    assert_eq!(h.fake.open_links(), 0);
    // Released without protocol writes.
    assert_eq!(h.fake.ops().last(), Some(&Op::Disconnect));

    h.fake.clear_ops();
    assert_eq!(
        h.session.connect(ARMBAND),
        Err(MyoError::ShutdownInProgress)
    );
    assert_eq!(h.session.scan(), Ok(vec![]));
    assert!(!h.session.update_modes(Some(EmgMode::Raw), None));
    h.session.vibrate(VibrationPattern::Short);
    h.session.deep_sleep();
    h.session.disconnect();
    thread::sleep(Duration::from_millis(50));
    assert!(h.fake.ops().is_empty());
    // Only the connect notification; handlers were dropped on shutdown.
    assert_eq!(h.changes(), vec![(true, ConnectionReason::Connected)]);
}

#[test]
fn shutdown_from_a_handler_still_releases_the_link() {
    let h = harness(FakeTransport::new());
    let weak = Arc::downgrade(&h.session);
    let outcome = Arc::new(Mutex::new(None));
    let sink = Arc::clone(&outcome);
    h.session.set_connection_callback(move |connected, _reason| {
        if let (true, Some(session)) = (connected, weak.upgrade()) {
            *sink.lock().unwrap() = Some(session.shutdown(Duration::from_secs(1)));
        }
    });

    h.session.connect(ARMBAND).unwrap();
    wait_until("link released", || h.fake.open_links() == 0);

    assert_eq!(*outcome.lock().unwrap(), Some(Ok(())));
    assert_eq!(h.session.state(), ConnectionState::ShuttingDown);
    assert_eq!(h.session.shutdown(Duration::from_secs(1)), Ok(()));
    assert_eq!(h.fake.ops().last(), Some(&Op::Disconnect));
}

#[test]
fn shutdown_cancels_an_in_flight_connect() {
    let h = harness(FakeTransport {
        open_delay: Duration::from_secs(1),
        ..FakeTransport::new()
    });

    let session = Arc::clone(&h.session);
    let connecting = thread::spawn(move || session.connect(ARMBAND));
    wait_until("connecting", || {
        h.session.state() == ConnectionState::Connecting
    });

    let started = Instant::now();
    h.session.shutdown(Duration::from_millis(500)).unwrap();
    assert!(started.elapsed() < Duration::from_millis(500));

    assert_eq!(
        connecting.join().unwrap(),
        Err(MyoError::ShutdownInProgress)
    );
    assert_eq!(h.fake.open_links(), 0);
    assert!(h.changes().is_empty());
}

#[test]
fn concurrent_connect_disconnect_shutdown_stays_consistent() {
    for round in 0..6 {
        let h = harness(FakeTransport {
            drop_during_open: round % 2 == 1,
            ..FakeTransport::new()
        });
        let mut workers = vec![];
        for worker in 0..4 {
            let session = Arc::clone(&h.session);
            workers.push(thread::spawn(move || {
                for step in 0..10 {
                    match (worker + step) % 3 {
                        0 => {
                            let result = session.connect(ARMBAND);
                            assert!(
                                matches!(result, Ok(()) | Err(MyoError::ShutdownInProgress)),
                                "{result:?}"
                            );
                        }
                        1 => session.disconnect(),
                        _ => {
                            let _ = session.update_modes(Some(EmgMode::Filtered), None);
                        }
                    }
                }
            }));
        }
        let stopper = {
            let session = Arc::clone(&h.session);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(5 * round));
                session.shutdown(Duration::from_secs(2))
            })
        };

        for worker in workers {
            worker.join().unwrap();
        }
        stopper.join().unwrap().unwrap();

        assert_eq!(h.session.state(), ConnectionState::ShuttingDown);
        wait_until("every link released", || h.fake.open_links() == 0);
    }
}

#[test]
fn concurrent_connect_disconnect_settles_on_idle_or_ready() {
    let h = harness(FakeTransport::new());
    let workers: Vec<_> = (0..4)
        .map(|worker| {
            let session = Arc::clone(&h.session);
            thread::spawn(move || {
                for step in 0..10 {
                    if (worker + step) % 2 == 0 {
                        session.connect(ARMBAND).unwrap();
                    } else {
                        session.disconnect();
                    }
                }
            })
        })
        .collect();
    let dropping = Arc::new(AtomicBool::new(true));
    let dropper = {
        let fake = Arc::clone(&h.fake);
        let dropping = Arc::clone(&dropping);
        thread::spawn(move || {
            while dropping.load(Ordering::SeqCst) {
                fake.try_inject(LinkEvent::Disconnected);
                thread::sleep(Duration::from_millis(3));
            }
        })
    };
    for worker in workers {
        worker.join().unwrap();
    }
    dropping.store(false, Ordering::SeqCst);
    dropper.join().unwrap();

    // Queue behind any pending disconnects.
    h.session.scan().unwrap();
    wait_until("consistent link ownership", || {
        let state = h.session.state();
        let links = h.fake.open_links();
        matches!(state, ConnectionState::Idle | ConnectionState::Ready)
            && links <= 1
            && (links == 1) == h.session.connected()
    });
}
