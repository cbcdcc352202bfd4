// Crowdbike environmental logger
// GPS, temperature/humidity and particulate sampling at a fixed cadence

pub mod calibration;
pub mod config;
pub mod error;
pub mod health;
pub mod identity;
pub mod nmea;
pub mod position;
pub mod record;
pub mod scheduler;
pub mod sensors;
pub mod storage;

pub use calibration::{CalibratedThermo, CalibrationCoefficients};
pub use config::Config;
pub use error::{ConfigError, SensorError, SensorResult};
pub use identity::DeviceIdentity;
pub use position::{Fix, FixSlot, PositionStream};
pub use record::Record;
pub use scheduler::{RunSummary, SampleScheduler, SchedulerState};
pub use storage::{CsvRecordSink, RecordSink};
