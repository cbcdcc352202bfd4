use thiserror::Error;

/// Failure of a single sensor read. Never fatal to the sampling loop.
#[derive(Error, Debug)]
pub enum SensorError {
    #[error("Sensor read timed out")]
    Timeout,

    #[error("Checksum mismatch: expected {expected:#04x}, got {actual:#04x}")]
    Checksum { expected: u8, actual: u8 },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Device not present: {0}")]
    NotPresent(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration and calibration loading errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("Failed to parse {path}: {source}")]
    Parse {
        path: String,
        source: serde_json::Error,
    },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

pub type SensorResult<T> = Result<T, SensorError>;
