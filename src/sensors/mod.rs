pub mod dht22;
pub mod sds011;

use serde::{Deserialize, Serialize};

use crate::error::SensorResult;

pub use dht22::Dht22;
pub use sds011::Sds011;

/// Uncalibrated temperature (°C) and relative humidity (%RH)
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ThermoHygroRaw {
    pub temperature: f64,
    pub humidity: f64,
}

/// Particulate mass concentrations in µg/m³
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ParticulateRaw {
    pub pm2_5: f64,
    pub pm10: f64,
}

/// Blocking temperature/humidity driver
pub trait ThermoHygroSensor: Send {
    fn read(&mut self) -> SensorResult<ThermoHygroRaw>;
}

/// Blocking particulate-matter driver. One read may take up to its own timeout.
pub trait ParticulateSensor: Send {
    fn read(&mut self) -> SensorResult<ParticulateRaw>;
}
