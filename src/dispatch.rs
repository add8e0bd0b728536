//! Notification consumer loop.
//!
//! The transport pushes raw notifications into a bounded queue; one task per
//! link drains it, decodes, and invokes the registered handlers.  Handlers
//! therefore run on the executor, never on the transport library's own
//! delivery thread.

use std::sync::{Arc, Weak};

use log::{debug, info};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::machine::{Machine, Shared};
use crate::parse::{decode_emg, decode_imu};
use crate::protocol::{EmgMode, EMG_CHARACTERISTICS, IMU_CHARACTERISTIC};
use crate::transport::LinkEvent;

/// Drain `events` until the link reports a drop or the queue closes.
pub(crate) async fn run(
    mut events: mpsc::Receiver<LinkEvent>,
    shared: Arc<Shared>,
    machine: Weak<Machine>,
    generation: u64,
) {
    let mut count: u64 = 0;
    while let Some(event) = events.recv().await {
        match event {
            LinkEvent::Notification {
                characteristic,
                value,
            } => {
                count += 1;
                if count <= 5 || count % 500 == 0 {
                    debug!("notif #{count} uuid={characteristic} len={}", value.len());
                }
                if shared.is_streaming() {
                    deliver(&shared, characteristic, &value);
                }
            }
            LinkEvent::Disconnected => {
                info!("link generation {generation} reported a disconnect");
                if let Some(machine) = machine.upgrade() {
                    // Separate task: teardown aborts this one.
                    tokio::spawn(machine.on_link_lost(generation));
                }
                break;
            }
        }
    }
    debug!("dispatcher for generation {generation} finished after {count} notification(s)");
}

/// Decode one notification and hand it to the matching handler.
///
/// Malformed payloads are dropped without invoking anything.
pub(crate) fn deliver(shared: &Shared, characteristic: Uuid, value: &[u8]) {
    if let Some(bank) = EMG_CHARACTERISTICS.iter().position(|&u| u == characteristic) {
        let frame = match decode_emg(bank as u8, value) {
            Ok(frame) => frame,
            Err(e) => {
                debug!("EMG bank {bank}: {e}, dropped");
                return;
            }
        };
        if let Some(handler) = shared.emg_handler() {
            let emg_enabled = shared.snapshot().emg_mode != EmgMode::None;
            let visible = if emg_enabled { Some(&frame) } else { None };
            handler(frame.bank, visible, frame.timestamp_us, &frame.raw_hex);
        }
    } else if characteristic == IMU_CHARACTERISTIC {
        match decode_imu(value) {
            Ok(sample) => {
                if let Some(handler) = shared.imu_handler() {
                    handler(&sample);
                }
            }
            Err(e) => debug!("IMU: {e}, dropped"),
        }
    } else {
        debug!("notification from unexpected characteristic {characteristic}");
    }
}
