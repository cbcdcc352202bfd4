use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use std::io::{BufRead, BufReader, ErrorKind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::calibration::round_to;
use crate::health::SensorHealth;
use crate::nmea::{parse_sentence, NmeaError, Sentence};

pub const KNOTS_TO_KMH: f64 = 1.852;

/// Serial read timeout; bounds how long `stop()` takes to be observed
const PORT_TIMEOUT: Duration = Duration::from_millis(500);
const ERROR_BACKOFF: Duration = Duration::from_millis(200);
const MAX_LINE: usize = 1024;

/// Latest resolved position. Position fields are meaningless while `has_fix` is false.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Fix {
    pub timestamp: Option<DateTime<Utc>>,
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: Option<f64>,
    pub speed_knots: f64,
    pub has_fix: bool,
}

impl Fix {
    pub fn speed_kmh(&self) -> f64 {
        round_to(self.speed_knots * KNOTS_TO_KMH, 2)
    }
}

/// Single-writer/single-reader cell holding the latest [`Fix`]
///
/// Writers replace the whole value under the lock, so a reader copying it out
/// can never see fields from two different fixes.
#[derive(Debug, Default)]
pub struct FixSlot {
    inner: Mutex<Fix>,
}

impl FixSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn store(&self, fix: Fix) {
        // A poisoned lock still holds a whole Fix: stores are single assignments
        let mut guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        *guard = fix;
    }

    pub fn snapshot(&self) -> Fix {
        *self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Merges GGA and RMC sentences into one running fix
#[derive(Debug, Default)]
pub struct FixTracker {
    fix: Fix,
    last_date: Option<NaiveDate>,
}

impl FixTracker {
    pub fn apply(&mut self, sentence: Sentence) -> Fix {
        match sentence {
            Sentence::Rmc(rmc) => {
                self.last_date = Some(rmc.timestamp.date_naive());
                self.fix.timestamp = Some(rmc.timestamp);
                let position = rmc.latitude.zip(rmc.longitude);
                self.fix.has_fix = rmc.valid && position.is_some();
                if let (true, Some((lat, lon))) = (rmc.valid, position) {
                    self.fix.latitude = lat;
                    self.fix.longitude = lon;
                    if let Some(speed) = rmc.speed_knots {
                        self.fix.speed_knots = speed;
                    }
                }
            }
            Sentence::Gga(gga) => {
                if let Some(date) = self.last_date {
                    let mut stamp = date.and_time(gga.time).and_utc();
                    // GGA time wrapped past midnight before the next RMC moved the date on
                    if let Some(previous) = self.fix.timestamp {
                        if previous - stamp > chrono::Duration::hours(12) {
                            stamp += chrono::Duration::days(1);
                        }
                    }
                    self.fix.timestamp = Some(stamp);
                }
                let position = gga.latitude.zip(gga.longitude);
                self.fix.has_fix = gga.quality > 0 && position.is_some();
                if let (true, Some((lat, lon))) = (gga.quality > 0, position) {
                    self.fix.latitude = lat;
                    self.fix.longitude = lon;
                    if gga.altitude.is_some() {
                        self.fix.altitude = gga.altitude;
                    }
                }
            }
        }
        self.fix
    }

    /// Invalidate the fix when the receiver stops delivering. The last position is kept.
    pub fn lose_fix(&mut self) -> Fix {
        self.fix.has_fix = false;
        self.fix
    }
}

/// Background task parsing an NMEA feed into a shared [`FixSlot`]
pub struct PositionStream {
    slot: Arc<FixSlot>,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl PositionStream {
    /// Open the receiver's serial port and start streaming. Failure here is fatal to the caller.
    pub fn open(port_name: &str, baud_rate: u32) -> Result<Self> {
        let port = serialport::new(port_name, baud_rate)
            .timeout(PORT_TIMEOUT)
            .open()
            .with_context(|| format!("Failed to open GPS serial port {}", port_name))?;
        log::info!("[gps] opened {} at {} baud", port_name, baud_rate);
        Ok(Self::start(BufReader::new(port)))
    }

    /// Spawn the reader on tokio's blocking pool. Must be called inside a runtime.
    pub fn start<R>(source: R) -> Self
    where
        R: BufRead + Send + 'static,
    {
        let slot = Arc::new(FixSlot::new());
        let stop = Arc::new(AtomicBool::new(false));

        let task_slot = slot.clone();
        let task_stop = stop.clone();
        let handle = tokio::task::spawn_blocking(move || {
            read_loop(source, &task_slot, &task_stop);
        });

        PositionStream {
            slot,
            stop,
            handle: Some(handle),
        }
    }

    /// Non-blocking copy of the latest fix
    pub fn latest(&self) -> Fix {
        self.slot.snapshot()
    }

    pub fn stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
    }

    pub fn is_running(&self) -> bool {
        self.handle
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }

    /// Wait for the reader to exit. Call [`stop`](Self::stop) first.
    pub async fn join(&mut self) {
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                log::error!("[gps] reader task failed: {}", e);
            }
        }
    }
}

impl Drop for PositionStream {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
    }
}

fn read_loop<R: BufRead>(mut source: R, slot: &FixSlot, stop: &AtomicBool) {
    let mut tracker = FixTracker::default();
    let mut health = SensorHealth::new("GPS receiver", 1);
    let mut line = Vec::with_capacity(128);
    let mut sentences = 0u64;
    let mut discarded = 0u64;

    while !stop.load(Ordering::Relaxed) {
        match source.read_until(b'\n', &mut line) {
            Ok(0) => {
                log::warn!("[gps] stream closed after {} sentences", sentences);
                break;
            }
            Ok(_) => {
                health.record_success();
                let text = String::from_utf8_lossy(&line);
                match parse_sentence(&text) {
                    Ok(sentence) => {
                        slot.store(tracker.apply(sentence));
                        sentences += 1;
                    }
                    Err(NmeaError::Unsupported(_)) => {}
                    Err(e) => {
                        discarded += 1;
                        log::debug!("[gps] discarded line ({} total): {}", discarded, e);
                    }
                }
                line.clear();
            }
            // Partial line stays buffered until the rest arrives
            Err(e) if matches!(
                e.kind(),
                ErrorKind::TimedOut | ErrorKind::WouldBlock | ErrorKind::Interrupted
            ) => {
                if line.len() > MAX_LINE {
                    line.clear();
                }
            }
            Err(e) => {
                health.record_failure(&e);
                slot.store(tracker.lose_fix());
                line.clear();
                thread::sleep(ERROR_BACKOFF);
            }
        }
    }

    // No reader means no fix; consumers must not keep sampling a frozen position
    slot.store(tracker.lose_fix());
    log::debug!("[gps] reader exiting ({} sentences, {} discarded)", sentences, discarded);
}
