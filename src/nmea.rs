/// Minimal NMEA 0183 parsing for GGA and RMC sentences
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use std::fmt::{Display, Formatter};

/// Why a line was discarded. Never surfaced past the position task.
#[derive(Debug, Clone, PartialEq)]
pub enum NmeaError {
    NotNmea,
    BadChecksum { expected: u8, actual: u8 },
    Unsupported(String),
    MissingField(&'static str),
    BadField(&'static str, String),
}

impl Display for NmeaError {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        match self {
            NmeaError::NotNmea => write!(f, "Not an NMEA sentence"),
            NmeaError::BadChecksum { expected, actual } => {
                write!(f, "Checksum mismatch: expected {:02X}, got {:02X}", expected, actual)
            }
            NmeaError::Unsupported(kind) => write!(f, "Unsupported sentence: {}", kind),
            NmeaError::MissingField(name) => write!(f, "Missing field: {}", name),
            NmeaError::BadField(name, value) => write!(f, "Bad field {}: {:?}", name, value),
        }
    }
}

impl std::error::Error for NmeaError {}

/// Fix data (GGA)
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Gga {
    pub time: NaiveTime,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub quality: u8,
    pub altitude: Option<f64>,
}

/// Recommended minimum data (RMC)
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Rmc {
    pub timestamp: DateTime<Utc>,
    pub valid: bool,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub speed_knots: Option<f64>,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Sentence {
    Gga(Gga),
    Rmc(Rmc),
}

/// Parse one line, verifying the checksum when one is present
pub fn parse_sentence(line: &str) -> Result<Sentence, NmeaError> {
    let line = line.trim();
    let body = line.strip_prefix('$').ok_or(NmeaError::NotNmea)?;

    let body = match body.split_once('*') {
        Some((data, checksum)) => {
            let actual = u8::from_str_radix(checksum.trim(), 16)
                .map_err(|_| NmeaError::BadField("checksum", checksum.to_string()))?;
            let expected = data.bytes().fold(0u8, |acc, b| acc ^ b);
            if expected != actual {
                return Err(NmeaError::BadChecksum { expected, actual });
            }
            data
        }
        None => body,
    };

    let fields: Vec<&str> = body.split(',').collect();
    let kind = fields[0];
    if kind.len() != 5 || !kind.is_ascii() {
        return Err(NmeaError::NotNmea);
    }

    // Talker id (GP, GN, GL, ...) is ignored
    match &kind[2..] {
        "GGA" => parse_gga(&fields).map(Sentence::Gga),
        "RMC" => parse_rmc(&fields).map(Sentence::Rmc),
        other => Err(NmeaError::Unsupported(other.to_string())),
    }
}

fn field<'a>(fields: &[&'a str], idx: usize, name: &'static str) -> Result<&'a str, NmeaError> {
    fields.get(idx).copied().ok_or(NmeaError::MissingField(name))
}

fn parse_gga(fields: &[&str]) -> Result<Gga, NmeaError> {
    let time = parse_time(field(fields, 1, "time")?)?;
    let latitude = parse_coordinate(field(fields, 2, "latitude")?, field(fields, 3, "N/S")?, 2)?;
    let longitude = parse_coordinate(field(fields, 4, "longitude")?, field(fields, 5, "E/W")?, 3)?;
    let quality_str = field(fields, 6, "quality")?;
    let quality = if quality_str.is_empty() {
        0
    } else {
        quality_str
            .parse()
            .map_err(|_| NmeaError::BadField("quality", quality_str.to_string()))?
    };
    let altitude = parse_optional_f64(field(fields, 9, "altitude")?, "altitude")?;

    Ok(Gga {
        time,
        latitude,
        longitude,
        quality,
        altitude,
    })
}

fn parse_rmc(fields: &[&str]) -> Result<Rmc, NmeaError> {
    let time = parse_time(field(fields, 1, "time")?)?;
    let valid = match field(fields, 2, "status")? {
        "A" => true,
        "V" => false,
        other => return Err(NmeaError::BadField("status", other.to_string())),
    };
    let latitude = parse_coordinate(field(fields, 3, "latitude")?, field(fields, 4, "N/S")?, 2)?;
    let longitude = parse_coordinate(field(fields, 5, "longitude")?, field(fields, 6, "E/W")?, 3)?;
    let speed_knots = parse_optional_f64(field(fields, 7, "speed")?, "speed")?;
    let date = parse_date(field(fields, 9, "date")?)?;

    Ok(Rmc {
        timestamp: date.and_time(time).and_utc(),
        valid,
        latitude,
        longitude,
        speed_knots,
    })
}

/// `hhmmss[.sss]`
fn parse_time(s: &str) -> Result<NaiveTime, NmeaError> {
    let bad = || NmeaError::BadField("time", s.to_string());
    if s.len() < 6 || !s.is_ascii() {
        return Err(bad());
    }
    // Digits only, so "nan", signs and exponents never reach the numeric parsers
    let (clock, fraction) = s.split_at(6);
    if !clock.bytes().all(|b| b.is_ascii_digit())
        || !fraction.bytes().all(|b| b.is_ascii_digit() || b == b'.')
    {
        return Err(bad());
    }
    let hour: u32 = s[0..2].parse().map_err(|_| bad())?;
    let minute: u32 = s[2..4].parse().map_err(|_| bad())?;
    let seconds: f64 = s[4..].parse().map_err(|_| bad())?;
    let whole = seconds.trunc() as u32;
    let millis = ((seconds - seconds.trunc()) * 1000.0).round() as u32;
    NaiveTime::from_hms_milli_opt(hour, minute, whole, millis.min(999)).ok_or_else(bad)
}

/// `ddmmyy`, years 2000-2099
fn parse_date(s: &str) -> Result<NaiveDate, NmeaError> {
    let bad = || NmeaError::BadField("date", s.to_string());
    if s.len() != 6 || !s.is_ascii() {
        return Err(bad());
    }
    let day: u32 = s[0..2].parse().map_err(|_| bad())?;
    let month: u32 = s[2..4].parse().map_err(|_| bad())?;
    let year: i32 = s[4..6].parse().map_err(|_| bad())?;
    NaiveDate::from_ymd_opt(2000 + year, month, day).ok_or_else(bad)
}

/// `(d)ddmm.mmmm` plus hemisphere into signed decimal degrees
fn parse_coordinate(
    value: &str,
    hemisphere: &str,
    degree_digits: usize,
) -> Result<Option<f64>, NmeaError> {
    if value.is_empty() {
        return Ok(None);
    }
    let bad = || NmeaError::BadField("coordinate", value.to_string());
    if value.len() <= degree_digits || !value.is_ascii() {
        return Err(bad());
    }
    let degrees: f64 = value[..degree_digits].parse().map_err(|_| bad())?;
    let minutes: f64 = value[degree_digits..].parse().map_err(|_| bad())?;
    if minutes >= 60.0 {
        return Err(bad());
    }
    let decimal = degrees + minutes / 60.0;
    match hemisphere {
        "N" | "E" => Ok(Some(decimal)),
        "S" | "W" => Ok(Some(-decimal)),
        other => Err(NmeaError::BadField("hemisphere", other.to_string())),
    }
}

fn parse_optional_f64(s: &str, name: &'static str) -> Result<Option<f64>, NmeaError> {
    if s.is_empty() {
        return Ok(None);
    }
    s.parse()
        .map(Some)
        .map_err(|_| NmeaError::BadField(name, s.to_string()))
}
