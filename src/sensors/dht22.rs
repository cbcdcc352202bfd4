use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use super::{ThermoHygroRaw, ThermoHygroSensor};
use crate::error::{SensorError, SensorResult};

const TEMPERATURE_FILE: &str = "in_temp_input";
const HUMIDITY_FILE: &str = "in_humidityrelative_input";
const RETRY_DELAY: Duration = Duration::from_millis(100);

/// DHT22 exposed by the Linux IIO `dht11` driver
///
/// The kernel does the single-wire timing and checksum; a failed transfer
/// surfaces as `ETIMEDOUT` or `EIO` on the sysfs read.
pub struct Dht22 {
    device_dir: PathBuf,
    attempts: u32,
}

impl Dht22 {
    pub fn new(device_dir: impl Into<PathBuf>, attempts: u32) -> Self {
        Dht22 {
            device_dir: device_dir.into(),
            attempts: attempts.max(1),
        }
    }

    fn read_once(&self) -> SensorResult<ThermoHygroRaw> {
        if !self.device_dir.is_dir() {
            return Err(SensorError::NotPresent(self.device_dir.display().to_string()));
        }

        let temperature = read_milli(&self.device_dir.join(TEMPERATURE_FILE))?;
        let humidity = read_milli(&self.device_dir.join(HUMIDITY_FILE))?;

        Ok(ThermoHygroRaw {
            temperature,
            humidity,
        })
    }
}

impl ThermoHygroSensor for Dht22 {
    fn read(&mut self) -> SensorResult<ThermoHygroRaw> {
        let mut last_err = SensorError::Timeout;
        for attempt in 1..=self.attempts {
            match self.read_once() {
                Ok(reading) => return Ok(reading),
                Err(e @ SensorError::NotPresent(_)) => return Err(e),
                Err(e) => {
                    log::debug!("[dht22] attempt {}/{} failed: {}", attempt, self.attempts, e);
                    last_err = e;
                }
            }
            if attempt < self.attempts {
                thread::sleep(RETRY_DELAY);
            }
        }
        Err(last_err)
    }
}

/// Read an IIO processed value given in thousandths
fn read_milli(path: &Path) -> SensorResult<f64> {
    let text = fs::read_to_string(path).map_err(|e| match e.kind() {
        ErrorKind::NotFound => SensorError::NotPresent(path.display().to_string()),
        ErrorKind::TimedOut => SensorError::Timeout,
        _ => SensorError::Io(e),
    })?;
    parse_milli(&text)
}

fn parse_milli(text: &str) -> SensorResult<f64> {
    let value: i64 = text
        .trim()
        .parse()
        .map_err(|_| SensorError::Protocol(format!("unexpected IIO value {:?}", text.trim())))?;
    Ok(value as f64 / 1000.0)
}
