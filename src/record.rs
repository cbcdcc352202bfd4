use chrono::{DateTime, SecondsFormat, Utc};

use crate::calibration::CalibratedThermo;
use crate::identity::DeviceIdentity;
use crate::position::Fix;
use crate::sensors::ParticulateRaw;

/// Column order of the durable record
pub const COLUMNS: [&str; 16] = [
    "id",
    "record",
    "raspberry_time",
    "gps_time",
    "altitude",
    "latitude",
    "longitude",
    "speed",
    "temperature",
    "temperature_raw",
    "rel_humidity",
    "rel_humidity_raw",
    "vapour_pressure",
    "pm10",
    "pm2_5",
    "mac",
];

/// Written in place of any value that could not be measured
pub const MISSING: &str = "nan";

/// One row per sampling cycle
#[derive(Clone, Debug, PartialEq)]
pub struct Record {
    pub device_id: u32,
    pub sequence: u64,
    pub captured_at: DateTime<Utc>,
    pub fix_time: Option<DateTime<Utc>>,
    pub altitude: Option<f64>,
    pub latitude: f64,
    pub longitude: f64,
    pub speed_kmh: f64,
    pub thermo: Option<CalibratedThermo>,
    pub particulate: Option<ParticulateRaw>,
    pub network_id: String,
}

impl Record {
    pub fn assemble(
        sequence: u64,
        captured_at: DateTime<Utc>,
        fix: &Fix,
        thermo: Option<CalibratedThermo>,
        particulate: Option<ParticulateRaw>,
        identity: &DeviceIdentity,
    ) -> Self {
        Record {
            device_id: identity.device_id,
            sequence,
            captured_at,
            fix_time: fix.timestamp,
            altitude: fix.altitude,
            latitude: fix.latitude,
            longitude: fix.longitude,
            speed_kmh: fix.speed_kmh(),
            thermo,
            particulate,
            network_id: identity.network_id.clone(),
        }
    }

    /// Render every column, substituting [`MISSING`] for absent values
    pub fn fields(&self) -> [String; 16] {
        let thermo = self.thermo.as_ref();
        let pm = self.particulate.as_ref();

        [
            self.device_id.to_string(),
            self.sequence.to_string(),
            self.captured_at.format("%Y-%m-%d %H:%M:%S").to_string(),
            self.fix_time
                .map(|t| t.to_rfc3339_opts(SecondsFormat::Millis, true))
                .unwrap_or_else(|| MISSING.to_string()),
            number(self.altitude),
            number(Some(self.latitude)),
            number(Some(self.longitude)),
            number(Some(self.speed_kmh)),
            number(thermo.map(|t| t.temperature)),
            number(thermo.map(|t| t.temperature_raw)),
            number(thermo.map(|t| t.humidity)),
            number(thermo.map(|t| t.humidity_raw)),
            number(thermo.map(|t| t.vapor_pressure)),
            number(pm.map(|p| p.pm10)),
            number(pm.map(|p| p.pm2_5)),
            quote(&self.network_id),
        ]
    }

    pub fn to_csv_line(&self) -> String {
        let mut line = self.fields().join(",");
        line.push('\n');
        line
    }
}

pub fn header_line() -> String {
    let mut line = COLUMNS.join(",");
    line.push('\n');
    line
}

fn number(value: Option<f64>) -> String {
    match value {
        Some(v) if v.is_finite() => v.to_string(),
        _ => MISSING.to_string(),
    }
}

/// RFC 4180 quoting for free-text fields
fn quote(value: &str) -> String {
    if value.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}
