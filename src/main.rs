use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use std::future::Future;
use std::path::PathBuf;

use crowdbike_rs::sensors::{Dht22, ParticulateSensor, Sds011};
use crowdbike_rs::{
    CalibrationCoefficients, Config, CsvRecordSink, DeviceIdentity, PositionStream,
    SampleScheduler,
};

#[derive(Parser, Debug)]
#[command(name = "crowdbike")]
#[command(about = "Bike-mounted GPS, temperature/humidity and particulate logger", long_about = None)]
struct Args {
    /// Rider and logging configuration
    #[arg(long, default_value = "config.json")]
    config: PathBuf,

    /// Sensor calibration coefficients
    #[arg(long, default_value = "calibration.json")]
    calibration: PathBuf,

    /// Override the GPS serial port
    #[arg(long)]
    gps_port: Option<String>,

    /// Override the particulate sensor serial port
    #[arg(long)]
    pm_port: Option<String>,

    /// Override the DHT22 IIO device directory
    #[arg(long)]
    thermo_path: Option<PathBuf>,

    /// Override the log directory
    #[arg(long)]
    output_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    let shutdown = termination_signal()?;

    let mut config = Config::load(&args.config)?;
    if let Some(port) = args.gps_port {
        config.devices.gps_port = port;
    }
    if let Some(port) = args.pm_port {
        config.devices.pm_port = port;
    }
    if let Some(path) = args.thermo_path {
        config.devices.thermo_path = path;
    }
    if let Some(dir) = args.output_dir {
        config.user.logfile_path = dir;
    }
    let coefficients = CalibrationCoefficients::load(&args.calibration)?;
    let identity = DeviceIdentity::resolve(&config);

    log::info!("Crowdbike logger starting");
    log::info!(
        "  Bike: {} ({}, {})",
        identity.device_id,
        identity.operator,
        identity.network_id
    );
    log::info!("  Sampling rate: {} s", config.user.sampling_rate);
    log::info!("  GPS: {} @ {}", config.devices.gps_port, config.devices.gps_baud);
    log::info!("  DHT22: {}", config.devices.thermo_path.display());
    log::info!(
        "  PM sensor: {}",
        if config.user.pm_sensor { config.devices.pm_port.as_str() } else { "disabled" }
    );

    let logfile = config.logfile_for(Utc::now());
    let sink = CsvRecordSink::open(&logfile).context("Log file is not writable")?;
    let position = PositionStream::open(&config.devices.gps_port, config.devices.gps_baud)?;

    let thermo = Box::new(Dht22::new(
        config.devices.thermo_path.clone(),
        config.devices.thermo_attempts,
    ));
    let particulate = if config.user.pm_sensor {
        Some(Box::new(Sds011::new(
            &config.devices.pm_port,
            config.devices.pm_baud,
            config.pm_timeout(),
        )) as Box<dyn ParticulateSensor>)
    } else {
        None
    };

    let scheduler = SampleScheduler::new(
        position,
        thermo,
        particulate,
        Box::new(sink),
        coefficients,
        identity,
        config.sampling_period(),
    );

    let summary = scheduler.run(shutdown).await;

    log::info!("=== Final Stats ===");
    log::info!("Records written: {}", summary.records_written);
    log::info!("Write failures: {}", summary.write_failures);
    log::info!("DHT22 failures: {}", summary.thermo_failures);
    log::info!("SDS011 failures: {}", summary.particulate_failures);
    log::info!("Log file: {}", logfile.display());

    Ok(())
}

/// Install the SIGINT/SIGTERM handlers now; the returned future resolves on either
#[cfg(unix)]
fn termination_signal() -> Result<impl Future<Output = ()>> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut interrupt =
        signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?;
    let mut terminate =
        signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;

    Ok(async move {
        tokio::select! {
            _ = interrupt.recv() => log::info!("SIGINT received"),
            _ = terminate.recv() => log::info!("SIGTERM received"),
        }
    })
}

#[cfg(not(unix))]
fn termination_signal() -> Result<impl Future<Output = ()>> {
    Ok(async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::warn!("Ctrl-C handler failed: {}", e);
        }
        log::info!("Ctrl-C received");
    })
}
