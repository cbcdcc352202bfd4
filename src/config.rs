use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ConfigError;

/// Longest accepted sampling period, in seconds (one day)
pub const MAX_SAMPLING_RATE: f64 = 86_400.0;

/// Contents of `config.json`
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    pub user: UserConfig,
    #[serde(default)]
    pub devices: DeviceConfig,
}

/// Rider and logging settings
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UserConfig {
    pub bike_nr: u32,
    pub studentname: String,
    pub logfile_path: PathBuf,
    #[serde(default)]
    pub pm_sensor: bool,
    /// Seconds between records
    pub sampling_rate: f64,
}

/// Hardware endpoints
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub gps_port: String,
    pub gps_baud: u32,
    pub pm_port: String,
    pub pm_baud: u32,
    pub pm_timeout_ms: u64,
    pub thermo_path: PathBuf,
    pub thermo_attempts: u32,
    pub network_interface: String,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        DeviceConfig {
            gps_port: "/dev/serial0".to_string(),
            gps_baud: 9600,
            pm_port: "/dev/ttyUSB0".to_string(),
            pm_baud: 9600,
            pm_timeout_ms: 1200,
            thermo_path: PathBuf::from("/sys/bus/iio/devices/iio:device0"),
            thermo_attempts: 3,
            network_interface: "wlan0".to_string(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&text).map_err(|e| match e {
            ConfigError::Parse { source, .. } => ConfigError::Parse {
                path: path.display().to_string(),
                source,
            },
            other => other,
        })
    }

    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_json::from_str(text).map_err(|source| ConfigError::Parse {
            path: "<inline>".to_string(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let rate = self.user.sampling_rate;
        if !rate.is_finite() || rate <= 0.0 || rate > MAX_SAMPLING_RATE {
            return Err(ConfigError::Invalid(format!(
                "sampling_rate must be between 0 and {} seconds, got {}",
                MAX_SAMPLING_RATE, rate
            )));
        }
        if self.user.studentname.trim().is_empty() {
            return Err(ConfigError::Invalid("studentname must not be empty".to_string()));
        }
        Ok(())
    }

    pub fn sampling_period(&self) -> Duration {
        Duration::from_secs_f64(self.user.sampling_rate)
    }

    pub fn pm_timeout(&self) -> Duration {
        Duration::from_millis(self.devices.pm_timeout_ms)
    }

    /// `{bike_nr}_{studentname}_{YYYY-mm-dd_HHMMSS}.csv` inside `logfile_path`
    pub fn logfile_for(&self, started: DateTime<Utc>) -> PathBuf {
        let name = format!(
            "{}_{}_{}.csv",
            self.user.bike_nr,
            self.user.studentname,
            started.format("%Y-%m-%d_%H%M%S")
        );
        self.user.logfile_path.join(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const MINIMAL: &str = r#"{
        "user": {
            "bike_nr": 7,
            "studentname": "kim",
            "logfile_path": "/tmp/crowdbike",
            "pm_sensor": true,
            "sampling_rate": 5
        }
    }"#;

    #[test]
    fn test_minimal_config_uses_device_defaults() {
        let config = Config::from_json(MINIMAL).unwrap();
        assert_eq!(config.user.bike_nr, 7);
        assert!(config.user.pm_sensor);
        assert_eq!(config.sampling_period(), Duration::from_secs(5));
        assert_eq!(config.devices.gps_port, "/dev/serial0");
        assert_eq!(config.pm_timeout(), Duration::from_millis(1200));
    }

    #[test]
    fn test_partial_device_section() {
        let json = r#"{
            "user": {"bike_nr": 1, "studentname": "a", "logfile_path": "out", "sampling_rate": 2.5},
            "devices": {"pm_port": "/dev/ttyAMA1"}
        }"#;
        let config = Config::from_json(json).unwrap();
        assert!(!config.user.pm_sensor);
        assert_eq!(config.devices.pm_port, "/dev/ttyAMA1");
        assert_eq!(config.devices.gps_baud, 9600);
        assert_eq!(config.sampling_period(), Duration::from_millis(2500));
    }

    #[test]
    fn test_rejects_non_positive_rate() {
        let json = MINIMAL.replace("\"sampling_rate\": 5", "\"sampling_rate\": 0");
        assert!(matches!(
            Config::from_json(&json),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_rejects_oversized_rate() {
        let json = MINIMAL.replace("\"sampling_rate\": 5", "\"sampling_rate\": 1e300");
        assert!(matches!(
            Config::from_json(&json),
            Err(ConfigError::Invalid(_))
        ));

        let json = MINIMAL.replace("\"sampling_rate\": 5", "\"sampling_rate\": 86400");
        assert_eq!(
            Config::from_json(&json).unwrap().sampling_period(),
            Duration::from_secs(86_400)
        );
    }

    #[test]
    fn test_rejects_malformed_json() {
        assert!(matches!(
            Config::from_json("{\"user\": "),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn test_logfile_name() {
        let config = Config::from_json(MINIMAL).unwrap();
        let started = Utc.with_ymd_and_hms(2020, 4, 1, 9, 5, 3).unwrap();
        assert_eq!(
            config.logfile_for(started),
            PathBuf::from("/tmp/crowdbike/7_kim_2020-04-01_090503.csv")
        );
    }
}
