//! Fixed-period sampling loop.
//!
//! Each cycle snapshots the latest fix, reads the slow sensors one after another,
//! calibrates, and appends one record. The time the cycle itself took is
//! subtracted from the next sleep so the long-run period stays constant.

use chrono::Utc;
use std::future::Future;
use std::time::Duration;
use tokio::runtime::{Handle, RuntimeFlavor};
use tokio::time::{sleep, Instant};

use crate::calibration::CalibrationCoefficients;
use crate::health::{SensorHealth, DEFAULT_FAILURE_THRESHOLD};
use crate::identity::DeviceIdentity;
use crate::position::{Fix, PositionStream};
use crate::record::Record;
use crate::sensors::{ParticulateSensor, ThermoHygroSensor};
use crate::storage::RecordSink;

/// Scheduler lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    /// No position yet; nothing is written
    AwaitingFix,
    Sampling,
    ShuttingDown,
    Terminated,
}

/// Outcome of a completed run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub records_written: u64,
    pub last_sequence: u64,
    pub write_failures: u64,
    pub thermo_failures: u64,
    pub particulate_failures: u64,
    pub final_state: SchedulerState,
}

/// Remaining sleep for a cycle that took `elapsed`, never negative.
///
/// `elapsed` is clamped to `period`, so an overrun costs at most one missed
/// cycle instead of a burst of catch-up cycles.
pub fn sleep_duration(period: Duration, elapsed: Duration) -> Duration {
    period - elapsed.min(period)
}

pub struct SampleScheduler {
    position: PositionStream,
    thermo: Box<dyn ThermoHygroSensor>,
    particulate: Option<Box<dyn ParticulateSensor>>,
    sink: Box<dyn RecordSink>,
    calibration: CalibrationCoefficients,
    identity: DeviceIdentity,
    period: Duration,
    sequence: u64,
    state: SchedulerState,
    thermo_health: SensorHealth,
    particulate_health: SensorHealth,
    records_written: u64,
    write_failures: u64,
}

impl SampleScheduler {
    /// `particulate` is `None` when the PM sensor is disabled for this run
    pub fn new(
        position: PositionStream,
        thermo: Box<dyn ThermoHygroSensor>,
        particulate: Option<Box<dyn ParticulateSensor>>,
        sink: Box<dyn RecordSink>,
        calibration: CalibrationCoefficients,
        identity: DeviceIdentity,
        period: Duration,
    ) -> Self {
        SampleScheduler {
            position,
            thermo,
            particulate,
            sink,
            calibration,
            identity,
            period,
            sequence: 0,
            state: SchedulerState::AwaitingFix,
            thermo_health: SensorHealth::new("DHT22", DEFAULT_FAILURE_THRESHOLD),
            particulate_health: SensorHealth::new("SDS011", DEFAULT_FAILURE_THRESHOLD),
            records_written: 0,
            write_failures: 0,
        }
    }

    pub fn state(&self) -> SchedulerState {
        self.state
    }

    /// Sample until `shutdown` resolves, then stop the position task and close the sink.
    ///
    /// Shutdown is only observed between cycles, so a row is either fully
    /// written or not started.
    pub async fn run<F>(mut self, shutdown: F) -> RunSummary
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        log::info!(
            "Sampling every {:.1}s, particulate sensor {}",
            self.period.as_secs_f64(),
            if self.particulate.is_some() { "enabled" } else { "disabled" }
        );
        log::info!("Waiting for GPS fix...");

        loop {
            let started = Instant::now();
            self.tick_blocking();
            let pause = sleep_duration(self.period, started.elapsed());

            tokio::select! {
                biased;
                _ = &mut shutdown => break,
                _ = sleep(pause) => {}
            }
        }

        self.shutdown().await
    }

    /// Run [`tick`](Self::tick) without stalling other tasks on this worker.
    ///
    /// Sensor reads sleep and wait on serial ports. A current-thread runtime has
    /// no other worker to hand tasks to, so there the cycle runs in place.
    fn tick_blocking(&mut self) {
        match Handle::current().runtime_flavor() {
            RuntimeFlavor::CurrentThread => self.tick(),
            _ => tokio::task::block_in_place(|| self.tick()),
        }
    }

    /// One loop iteration: emit a record if a fix is available
    fn tick(&mut self) {
        let fix = self.position.latest();

        if !fix.has_fix {
            if self.state == SchedulerState::Sampling {
                log::warn!("GPS fix lost after record {}, pausing", self.sequence);
                self.state = SchedulerState::AwaitingFix;
            }
            return;
        }

        if self.state == SchedulerState::AwaitingFix {
            log::info!(
                "GPS fix acquired at {:.6}, {:.6}; sampling",
                fix.latitude,
                fix.longitude
            );
            self.state = SchedulerState::Sampling;
        }

        let record = self.sample(&fix);
        match self.sink.append(&record) {
            Ok(()) => {
                self.records_written += 1;
                log::debug!("Wrote record {}", record.sequence);
            }
            Err(e) => {
                self.write_failures += 1;
                log::error!("Failed to write record {}: {:#}", record.sequence, e);
            }
        }
    }

    /// Read sensors and build the next record. Always advances the sequence.
    pub(crate) fn sample(&mut self, fix: &Fix) -> Record {
        let captured_at = Utc::now();

        let thermo = match self.thermo.read() {
            Ok(raw) => {
                self.thermo_health.record_success();
                Some(self.calibration.apply(raw))
            }
            Err(e) => {
                self.thermo_health.record_failure(&e);
                None
            }
        };

        let particulate = match self.particulate.as_mut() {
            Some(sensor) => match sensor.read() {
                Ok(pm) => {
                    self.particulate_health.record_success();
                    Some(pm)
                }
                Err(e) => {
                    self.particulate_health.record_failure(&e);
                    None
                }
            },
            None => None,
        };

        self.sequence += 1;
        Record::assemble(
            self.sequence,
            captured_at,
            fix,
            thermo,
            particulate,
            &self.identity,
        )
    }

    async fn shutdown(mut self) -> RunSummary {
        self.state = SchedulerState::ShuttingDown;
        log::info!("Shutting down after {} records", self.sequence);

        self.position.stop();
        self.position.join().await;

        if let Err(e) = self.sink.close() {
            log::warn!("Failed to close record sink: {:#}", e);
        }

        self.state = SchedulerState::Terminated;
        self.summary()
    }

    fn summary(&self) -> RunSummary {
        RunSummary {
            records_written: self.records_written,
            last_sequence: self.sequence,
            write_failures: self.write_failures,
            thermo_failures: self.thermo_health.total_failures(),
            particulate_failures: self.particulate_health.total_failures(),
            final_state: self.state,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use crate::error::{SensorError, SensorResult};
    use crate::position::testing::{nmea_line, ChannelReader};
    use crate::record::{COLUMNS, MISSING};
    use crate::sensors::{ParticulateRaw, ThermoHygroRaw};
    use crate::storage::CsvRecordSink;
    use std::fs;
    use std::io::{BufReader, Cursor};
    use std::sync::mpsc;
    use std::sync::{Arc, Mutex};
    use tempfile::tempdir;

    const RMC_VALID: &str = "GPRMC,101500.00,A,5128.500,N,00720.100,E,010.0,090.0,010420,,,A";
    const RMC_NO_FIX: &str = "GPRMC,101500.00,V,,,,,,,010420,,,N";

    struct FixedThermo(ThermoHygroRaw);

    impl ThermoHygroSensor for FixedThermo {
        fn read(&mut self) -> SensorResult<ThermoHygroRaw> {
            Ok(self.0)
        }
    }

    struct FailingThermo;

    impl ThermoHygroSensor for FailingThermo {
        fn read(&mut self) -> SensorResult<ThermoHygroRaw> {
            Err(SensorError::Timeout)
        }
    }

    struct FailingParticulate;

    impl ParticulateSensor for FailingParticulate {
        fn read(&mut self) -> SensorResult<ParticulateRaw> {
            Err(SensorError::NotPresent("/dev/ttyUSB0".to_string()))
        }
    }

    struct FixedParticulate;

    impl ParticulateSensor for FixedParticulate {
        fn read(&mut self) -> SensorResult<ParticulateRaw> {
            Ok(ParticulateRaw {
                pm2_5: 3.4,
                pm10: 7.9,
            })
        }
    }

    /// Keeps every appended record in memory
    #[derive(Clone, Default)]
    struct MemorySink {
        records: Arc<Mutex<Vec<Record>>>,
        closed: Arc<Mutex<bool>>,
    }

    impl RecordSink for MemorySink {
        fn append(&mut self, record: &Record) -> Result<()> {
            self.records.lock().unwrap().push(record.clone());
            Ok(())
        }

        fn close(&mut self) -> Result<()> {
            *self.closed.lock().unwrap() = true;
            Ok(())
        }
    }

    fn coefficients() -> CalibrationCoefficients {
        CalibrationCoefficients {
            temp_a0: 0.0,
            temp_a1: 1.0,
            hum_a0: 0.0,
            hum_a1: 1.0,
        }
    }

    fn identity() -> DeviceIdentity {
        DeviceIdentity {
            device_id: 4,
            operator: "kim".to_string(),
            network_id: "b8:27:eb:00:00:04".to_string(),
        }
    }

    fn scheduler(
        position: PositionStream,
        thermo: Box<dyn ThermoHygroSensor>,
        particulate: Option<Box<dyn ParticulateSensor>>,
        sink: Box<dyn RecordSink>,
        period: Duration,
    ) -> SampleScheduler {
        SampleScheduler::new(
            position,
            thermo,
            particulate,
            sink,
            coefficients(),
            identity(),
            period,
        )
    }

    fn valid_fix() -> Fix {
        Fix {
            latitude: 51.475,
            longitude: 7.335,
            altitude: Some(95.5),
            speed_knots: 10.0,
            has_fix: true,
            ..Fix::default()
        }
    }

    #[test]
    fn test_sleep_duration_compensates_cycle_time() {
        let period = Duration::from_secs(5);
        assert_eq!(sleep_duration(period, Duration::from_secs(2)), Duration::from_secs(3));
        assert_eq!(sleep_duration(period, Duration::from_secs(7)), Duration::ZERO);
        assert_eq!(sleep_duration(period, period), Duration::ZERO);
        assert_eq!(sleep_duration(period, Duration::ZERO), period);
    }

    #[tokio::test]
    async fn test_sequence_advances_when_every_sensor_fails() {
        let mut s = scheduler(
            PositionStream::start(Cursor::new(Vec::new())),
            Box::new(FailingThermo),
            Some(Box::new(FailingParticulate)),
            Box::new(MemorySink::default()),
            Duration::from_secs(5),
        );

        let fix = valid_fix();
        let sequences: Vec<u64> = (0..4).map(|_| s.sample(&fix).sequence).collect();
        assert_eq!(sequences, vec![1, 2, 3, 4]);

        let record = s.sample(&fix);
        assert!(record.thermo.is_none());
        assert!(record.particulate.is_none());
        let fields = record.fields();
        assert_eq!(fields[8], MISSING);
        assert_eq!(fields[13], MISSING);
        assert_eq!(fields[5], "51.475");

        let summary = s.summary();
        assert_eq!(summary.thermo_failures, 5);
        assert_eq!(summary.particulate_failures, 5);
    }

    #[tokio::test]
    async fn test_disabled_particulate_yields_missing_pm() {
        let mut s = scheduler(
            PositionStream::start(Cursor::new(Vec::new())),
            Box::new(FixedThermo(ThermoHygroRaw {
                temperature: 20.0,
                humidity: 50.0,
            })),
            None,
            Box::new(MemorySink::default()),
            Duration::from_secs(5),
        );

        let record = s.sample(&valid_fix());
        let thermo = record.thermo.unwrap();
        assert_eq!(thermo.temperature, 20.0);
        assert!((thermo.vapor_pressure - 1.18324).abs() < 1e-4);
        assert!(record.particulate.is_none());
    }

    #[tokio::test]
    async fn test_particulate_values_flow_into_record() {
        let mut s = scheduler(
            PositionStream::start(Cursor::new(Vec::new())),
            Box::new(FailingThermo),
            Some(Box::new(FixedParticulate)),
            Box::new(MemorySink::default()),
            Duration::from_secs(5),
        );

        let fields = s.sample(&valid_fix()).fields();
        assert_eq!(fields[13], "7.9");
        assert_eq!(fields[14], "3.4");
    }

    #[tokio::test]
    async fn test_no_record_until_first_fix() {
        let (tx, rx) = mpsc::channel();
        let position = PositionStream::start(BufReader::new(ChannelReader::new(rx)));
        let sink = MemorySink::default();

        let mut s = scheduler(
            position,
            Box::new(FailingThermo),
            None,
            Box::new(sink.clone()),
            Duration::from_millis(10),
        );

        tx.send(nmea_line(RMC_NO_FIX)).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        s.tick();
        s.tick();
        assert_eq!(s.state(), SchedulerState::AwaitingFix);
        assert!(sink.records.lock().unwrap().is_empty());

        tx.send(nmea_line(RMC_VALID)).unwrap();
        for _ in 0..100 {
            if s.position.latest().has_fix {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let first_fix = s.position.latest();
        s.tick();
        assert_eq!(s.state(), SchedulerState::Sampling);

        {
            let records = sink.records.lock().unwrap();
            assert_eq!(records.len(), 1);
            assert_eq!(records[0].sequence, 1);
            assert_eq!(records[0].latitude, first_fix.latitude);
            assert_eq!(records[0].longitude, first_fix.longitude);
            assert_eq!(records[0].fix_time, first_fix.timestamp);
        }

        tx.send(nmea_line(RMC_NO_FIX)).unwrap();
        for _ in 0..100 {
            if !s.position.latest().has_fix {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        s.tick();
        assert_eq!(s.state(), SchedulerState::AwaitingFix);
        assert_eq!(sink.records.lock().unwrap().len(), 1);

        let summary = s.run(async {}).await;
        assert_eq!(summary.last_sequence, 1);
        drop(tx);
    }

    #[tokio::test]
    async fn test_shutdown_leaves_only_complete_rows() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("run.csv");
        let sink = CsvRecordSink::open(&path).unwrap();

        let (tx, rx) = mpsc::channel();
        let position = PositionStream::start(BufReader::new(ChannelReader::new(rx)));
        tx.send(nmea_line(RMC_VALID)).unwrap();
        for _ in 0..100 {
            if position.latest().has_fix {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let s = scheduler(
            position,
            Box::new(FixedThermo(ThermoHygroRaw {
                temperature: 18.0,
                humidity: 105.0,
            })),
            Some(Box::new(FailingParticulate)),
            Box::new(sink),
            Duration::from_millis(20),
        );

        let summary = s
            .run(tokio::time::sleep(Duration::from_millis(150)))
            .await;
        drop(tx);

        assert!(summary.records_written >= 2);
        assert_eq!(summary.records_written, summary.last_sequence);
        assert_eq!(summary.write_failures, 0);

        let text = fs::read_to_string(&path).unwrap();
        assert!(text.ends_with('\n'));
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len() as u64, summary.records_written + 1);
        for (i, line) in lines.iter().skip(1).enumerate() {
            let fields: Vec<&str> = line.split(',').collect();
            assert_eq!(fields.len(), COLUMNS.len());
            assert_eq!(fields[1], (i + 1).to_string());
            assert_eq!(fields[10], "100");
            assert_eq!(fields[14], MISSING);
        }
    }

    /// Thermo sensor whose read takes `delay`, counting started reads
    struct SlowThermo {
        delay: Duration,
        reads: Arc<Mutex<u32>>,
    }

    impl ThermoHygroSensor for SlowThermo {
        fn read(&mut self) -> SensorResult<ThermoHygroRaw> {
            *self.reads.lock().unwrap() += 1;
            std::thread::sleep(self.delay);
            Ok(ThermoHygroRaw {
                temperature: 21.0,
                humidity: 40.0,
            })
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_termination_during_sensor_read_finishes_the_row() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("run.csv");
        let sink = CsvRecordSink::open(&path).unwrap();

        let (tx, rx) = mpsc::channel();
        let position = PositionStream::start(BufReader::new(ChannelReader::new(rx)));
        tx.send(nmea_line(RMC_VALID)).unwrap();
        for _ in 0..100 {
            if position.latest().has_fix {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(position.latest().has_fix);

        let reads = Arc::new(Mutex::new(0));
        let s = scheduler(
            position,
            Box::new(SlowThermo {
                delay: Duration::from_millis(300),
                reads: reads.clone(),
            }),
            None,
            Box::new(sink),
            Duration::from_millis(20),
        );

        // Fires while the first cycle is still inside the thermo read
        let summary = tokio::time::timeout(
            Duration::from_secs(5),
            s.run(tokio::time::sleep(Duration::from_millis(100))),
        )
        .await
        .expect("scheduler did not shut down");

        assert_eq!(*reads.lock().unwrap(), 1);
        assert_eq!(summary.records_written, 1);
        assert_eq!(summary.last_sequence, 1);
        assert_eq!(summary.final_state, SchedulerState::Terminated);

        let text = fs::read_to_string(&path).unwrap();
        assert!(text.ends_with('\n'));
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        let fields: Vec<&str> = lines[1].split(',').collect();
        assert_eq!(fields.len(), COLUMNS.len());
        assert_eq!(fields[1], "1");
        assert_eq!(fields[8], "21");

        // The reader task has exited and dropped its end of the feed
        assert!(tx.send(nmea_line(RMC_VALID)).is_err());
    }

    #[tokio::test]
    async fn test_run_stops_position_task_and_closes_sink() {
        let (tx, rx) = mpsc::channel::<Vec<u8>>();
        let position = PositionStream::start(BufReader::new(ChannelReader::new(rx)));
        let sink = MemorySink::default();

        let s = scheduler(
            position,
            Box::new(FailingThermo),
            None,
            Box::new(sink.clone()),
            Duration::from_millis(10),
        );

        let summary = tokio::time::timeout(
            Duration::from_secs(3),
            s.run(tokio::time::sleep(Duration::from_millis(50))),
        )
        .await
        .expect("scheduler did not shut down");

        assert_eq!(summary.records_written, 0);
        assert_eq!(summary.final_state, SchedulerState::Terminated);
        assert!(*sink.closed.lock().unwrap());
        drop(tx);
    }
}
