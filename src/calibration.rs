/// Linear sensor calibration and vapour pressure model.
///
/// All functions here are pure so they can be checked against reference points.
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::error::ConfigError;
use crate::sensors::ThermoHygroRaw;

/// Upper bound for reported relative humidity (DHT22 overshoots near saturation)
pub const MAX_HUMIDITY: f64 = 100.0;

/// Latent heat of vaporisation over gas constant of water vapour (K)
const L_OVER_RV: f64 = 2_501_000.0 / 461.5;
const T0_KELVIN: f64 = 273.15;
/// Saturation vapour pressure at 0 °C (kPa)
const ES0_KPA: f64 = 0.6113;

/// Linear coefficients loaded once from `calibration.json`
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct CalibrationCoefficients {
    #[serde(rename = "temp_cal_a0")]
    pub temp_a0: f64,
    #[serde(rename = "temp_cal_a1")]
    pub temp_a1: f64,
    #[serde(rename = "hum_cal_a0")]
    pub hum_a0: f64,
    #[serde(rename = "hum_cal_a1")]
    pub hum_a1: f64,
}

impl CalibrationCoefficients {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let coefficients: Self =
            serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
                path: path.display().to_string(),
                source,
            })?;
        coefficients.validate()?;
        Ok(coefficients)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, a1) in [("temp_cal_a1", self.temp_a1), ("hum_cal_a1", self.hum_a1)] {
            if !a1.is_finite() || a1 == 0.0 {
                return Err(ConfigError::Invalid(format!(
                    "{} must be finite and non-zero, got {}",
                    name, a1
                )));
            }
        }
        for (name, a0) in [("temp_cal_a0", self.temp_a0), ("hum_cal_a0", self.hum_a0)] {
            if !a0.is_finite() {
                return Err(ConfigError::Invalid(format!("{} must be finite", name)));
            }
        }
        Ok(())
    }

    /// Convert one raw thermo-hygro reading into calibrated physical values
    pub fn apply(&self, raw: ThermoHygroRaw) -> CalibratedThermo {
        let temperature = calibrate_temperature(raw.temperature, self.temp_a0, self.temp_a1);
        let humidity = calibrate_humidity(raw.humidity, self.hum_a0, self.hum_a1);
        let saturation = saturation_vapor_pressure(temperature);

        CalibratedThermo {
            temperature,
            temperature_raw: round_to(raw.temperature, 5),
            humidity,
            humidity_raw: round_to(raw.humidity, 5),
            vapor_pressure: vapor_pressure(humidity, saturation),
        }
    }
}

/// Calibrated values plus the raw readings kept for audit
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CalibratedThermo {
    pub temperature: f64,
    pub temperature_raw: f64,
    pub humidity: f64,
    pub humidity_raw: f64,
    pub vapor_pressure: f64,
}

/// Round half away from zero to `decimals` places
pub fn round_to(value: f64, decimals: i32) -> f64 {
    let scale = 10f64.powi(decimals);
    (value * scale).round() / scale
}

/// `raw / a1 - a0`, rounded to 3 decimals (°C)
pub fn calibrate_temperature(raw: f64, a0: f64, a1: f64) -> f64 {
    round_to(raw / a1 - a0, 3)
}

/// Same linear form as temperature, clamped to [`MAX_HUMIDITY`] (%RH)
pub fn calibrate_humidity(raw: f64, a0: f64, a1: f64) -> f64 {
    round_to(raw / a1 - a0, 3).min(MAX_HUMIDITY)
}

/// Saturation vapour pressure over water in kPa (Clausius-Clapeyron, constant latent heat)
pub fn saturation_vapor_pressure(temperature_c: f64) -> f64 {
    ES0_KPA * (L_OVER_RV * (1.0 / T0_KELVIN - 1.0 / (temperature_c + T0_KELVIN))).exp()
}

/// Actual vapour pressure in kPa, rounded to 5 decimals
pub fn vapor_pressure(relative_humidity: f64, saturation_pressure: f64) -> f64 {
    round_to(relative_humidity / 100.0 * saturation_pressure, 5)
}
