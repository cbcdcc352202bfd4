use std::io::{ErrorKind, Read};
use std::time::{Duration, Instant};

use super::{ParticulateRaw, ParticulateSensor};
use crate::error::{SensorError, SensorResult};

const FRAME_LEN: usize = 10;
const HEAD: u8 = 0xAA;
const CMD_DATA: u8 = 0xC0;
const TAIL: u8 = 0xAB;

/// Read timeout of the underlying port; the frame deadline is enforced separately
const PORT_TIMEOUT: Duration = Duration::from_millis(100);

/// Decode one measurement frame `AA C0 d1..d6 cs AB`
pub fn decode_frame(frame: &[u8; FRAME_LEN]) -> SensorResult<ParticulateRaw> {
    if frame[0] != HEAD || frame[1] != CMD_DATA || frame[9] != TAIL {
        return Err(SensorError::Protocol(format!(
            "bad frame framing {:02X} {:02X} .. {:02X}",
            frame[0], frame[1], frame[9]
        )));
    }

    let expected = frame[2..8].iter().fold(0u8, |acc, b| acc.wrapping_add(*b));
    if expected != frame[8] {
        return Err(SensorError::Checksum {
            expected,
            actual: frame[8],
        });
    }

    let pm2_5 = u16::from_le_bytes([frame[2], frame[3]]) as f64 / 10.0;
    let pm10 = u16::from_le_bytes([frame[4], frame[5]]) as f64 / 10.0;
    Ok(ParticulateRaw { pm2_5, pm10 })
}

/// Pulls frames out of a byte stream, resynchronising on the header byte
pub struct FrameReader<R: Read> {
    inner: R,
}

impl<R: Read> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        FrameReader { inner }
    }

    /// Return the first valid frame seen before `timeout` elapses.
    /// A corrupt frame is skipped and scanning continues until the deadline.
    pub fn next_measurement(&mut self, timeout: Duration) -> SensorResult<ParticulateRaw> {
        let deadline = Instant::now() + timeout;
        let mut last_err = SensorError::Timeout;

        loop {
            if Instant::now() >= deadline {
                return Err(last_err);
            }

            if self.read_byte(deadline)? != HEAD {
                continue;
            }

            let mut frame = [0u8; FRAME_LEN];
            frame[0] = HEAD;
            for slot in frame.iter_mut().skip(1) {
                *slot = self.read_byte(deadline)?;
            }

            match decode_frame(&frame) {
                Ok(reading) => return Ok(reading),
                Err(e) => {
                    log::debug!("[sds011] dropping frame: {}", e);
                    last_err = e;
                }
            }
        }
    }

    fn read_byte(&mut self, deadline: Instant) -> SensorResult<u8> {
        let mut byte = [0u8; 1];
        loop {
            if Instant::now() >= deadline {
                return Err(SensorError::Timeout);
            }
            match self.inner.read(&mut byte) {
                Ok(1) => return Ok(byte[0]),
                Ok(_) => return Err(SensorError::Timeout),
                Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock) => {
                    continue
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(SensorError::Io(e)),
            }
        }
    }
}

/// Nova SDS011 on a serial port, opened lazily so an unplugged sensor only
/// degrades its own fields
pub struct Sds011 {
    port_name: String,
    baud_rate: u32,
    timeout: Duration,
    reader: Option<FrameReader<Box<dyn serialport::SerialPort>>>,
}

impl Sds011 {
    pub fn new(port_name: &str, baud_rate: u32, timeout: Duration) -> Self {
        Sds011 {
            port_name: port_name.to_string(),
            baud_rate,
            timeout,
            reader: None,
        }
    }

    fn ensure_open(&mut self) -> SensorResult<&mut FrameReader<Box<dyn serialport::SerialPort>>> {
        if self.reader.is_none() {
            let port = serialport::new(&self.port_name, self.baud_rate)
                .timeout(PORT_TIMEOUT)
                .open()
                .map_err(|e| SensorError::NotPresent(format!("{}: {}", self.port_name, e)))?;
            log::info!("[sds011] opened {}", self.port_name);
            self.reader = Some(FrameReader::new(port));
        }
        self.reader
            .as_mut()
            .ok_or_else(|| SensorError::NotPresent(self.port_name.clone()))
    }
}

impl ParticulateSensor for Sds011 {
    fn read(&mut self) -> SensorResult<ParticulateRaw> {
        let timeout = self.timeout;
        let reader = self.ensure_open()?;

        // Drop stale frames so the value belongs to this cycle
        if let Err(e) = reader.inner.clear(serialport::ClearBuffer::Input) {
            log::debug!("[sds011] failed to clear input buffer: {}", e);
        }

        let result = reader.next_measurement(timeout);
        if let Err(SensorError::Io(e)) = &result {
            log::warn!("[sds011] I/O error on {}, will reopen: {}", self.port_name, e);
            self.reader = None;
        }
        result
    }
}
