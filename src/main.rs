use std::io::{self, BufRead};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use log::{info, warn};

use myo_rs::prelude::*;

fn main() -> Result<()> {
    // ── Logging ───────────────────────────────────────────────────────────────
    // Set RUST_LOG=debug for verbose output, e.g.:
    //   RUST_LOG=myo_rs=debug cargo run
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    // ── Configuration ─────────────────────────────────────────────────────────
    let config = SessionConfig::default();

    let executor = Arc::new(Executor::new()?);
    let session = MyoSession::bluetooth(Arc::clone(&executor), config);

    // ── Handlers ──────────────────────────────────────────────────────────────
    session.set_connection_callback(|connected, reason| {
        if connected {
            info!("✅  Connected ({reason})");
        } else {
            info!("❌  Disconnected ({reason})");
        }
    });

    // Print one line per 50 packets; the armband sends ~200 EMG packets/s.
    let emg_count = Arc::new(AtomicU64::new(0));
    let counter = Arc::clone(&emg_count);
    session.set_emg_handler(move |bank, frame, ts, _raw| {
        let n = counter.fetch_add(1, Ordering::Relaxed);
        if n % 50 != 0 {
            return;
        }
        match frame {
            Some(f) => println!("[EMG] bank={bank} ts={ts}  {:?} {:?}", f.samples[0], f.samples[1]),
            None => println!("[EMG] bank={bank} ts={ts}  (emg disabled)"),
        }
    });

    let imu_count = Arc::new(AtomicU64::new(0));
    let counter = Arc::clone(&imu_count);
    session.set_imu_handler(move |s| {
        if counter.fetch_add(1, Ordering::Relaxed) % 50 != 0 {
            return;
        }
        let q = &s.orientation;
        println!(
            "[IMU] q=({:+.3},{:+.3},{:+.3},{:+.3})  acc=({:+.3},{:+.3},{:+.3})g  gyro=({:+.1},{:+.1},{:+.1})°/s",
            q.w, q.x, q.y, q.z,
            s.accelerometer.x, s.accelerometer.y, s.accelerometer.z,
            s.gyroscope.x, s.gyroscope.y, s.gyroscope.z,
        );
    });

    // ── Connect ───────────────────────────────────────────────────────────────
    info!("Scanning for Myo armbands …");
    let devices = session.scan()?;
    for d in &devices {
        info!("  found {} [{}]", d.name, d.address);
    }
    let Some(device) = devices.into_iter().next() else {
        session.shutdown(Duration::from_secs(2))?;
        bail!("no Myo armband found");
    };

    info!("Connecting to {} …", device.name);
    session.connect(&device.address)?;
    info!(
        "{}  firmware={}  battery={}",
        session.model_name(),
        session.firmware().as_deref().unwrap_or("?"),
        session
            .battery()
            .map(|b| format!("{b}%"))
            .unwrap_or_else(|| "?".into()),
    );

    info!("Commands (type + Enter):");
    info!("  v [short|medium|long]  – vibrate");
    info!("  b                      – refresh and show battery");
    info!("  m <emg> <imu>          – set modes by byte value, e.g. 'm 3 1'");
    info!("  s                      – deep sleep (wake with USB power)");
    info!("  d                      – disconnect");
    info!("  c                      – reconnect");
    info!("  q                      – quit\n");

    // ── Stdin command loop ────────────────────────────────────────────────────
    let stdin = io::stdin();
    for line in stdin.lock().lines() {
        let line = line?;
        let mut words = line.split_whitespace();
        let Some(cmd) = words.next() else {
            continue;
        };
        match cmd {
            "q" => {
                info!("Quit requested.");
                break;
            }
            "v" => session.vibrate(VibrationPattern::from_name(words.next().unwrap_or("medium"))),
            "b" => {
                session.refresh_battery();
                match session.battery() {
                    Some(b) => info!("battery: {b}% (refresh pending)"),
                    None => info!("battery: unknown"),
                }
            }
            "m" => {
                let emg = words.next().and_then(|w| w.parse::<u8>().ok());
                let imu = words.next().and_then(|w| w.parse::<u8>().ok());
                let emg = emg.map(EmgMode::try_from).transpose();
                let imu = imu.map(ImuMode::try_from).transpose();
                match (emg, imu) {
                    (Ok(emg), Ok(imu)) => {
                        if session.update_modes(emg, imu) {
                            info!(
                                "modes now emg={:?} imu={:?}",
                                session.emg_mode(),
                                session.imu_mode()
                            );
                        } else {
                            warn!("mode update failed (state {:?})", session.state());
                        }
                    }
                    (Err(b), _) | (_, Err(b)) => warn!("unknown mode byte {b:#04x}"),
                }
            }
            "s" => session.deep_sleep(),
            "d" => session.disconnect(),
            "c" => {
                if let Err(e) = session.connect(&device.address) {
                    warn!("reconnect failed: {e}");
                }
            }
            other => warn!("unknown command '{other}'"),
        }
    }

    // ── Shutdown ──────────────────────────────────────────────────────────────
    session.shutdown(Duration::from_secs(2))?;
    executor.shutdown(Duration::from_secs(1));
    info!(
        "Received {} EMG and {} IMU packet(s) – exiting.",
        emg_count.load(Ordering::Relaxed),
        imu_count.load(Ordering::Relaxed)
    );
    Ok(())
}
