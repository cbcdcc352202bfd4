use anyhow::{Context, Result};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;

use crate::record::{header_line, Record};

/// Durable destination for per-cycle records
pub trait RecordSink: Send {
    /// Persist one record before returning
    fn append(&mut self, record: &Record) -> Result<()>;

    /// Flush whatever is still pending. Called once on shutdown.
    fn close(&mut self) -> Result<()>;
}

/// Append-only CSV file, reopened for every row
pub struct CsvRecordSink {
    path: PathBuf,
    rows_written: u64,
}

impl CsvRecordSink {
    /// Create the directory and header if needed. An existing file is never truncated.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory {}", dir.display()))?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("Failed to open log file {}", path.display()))?;

        let is_empty = file
            .metadata()
            .with_context(|| format!("Failed to stat {}", path.display()))?
            .len()
            == 0;
        if is_empty {
            file.write_all(header_line().as_bytes())
                .and_then(|_| file.sync_data())
                .with_context(|| format!("Failed to write header to {}", path.display()))?;
            log::info!("Created log file {}", path.display());
        } else {
            log::info!("Appending to existing log file {}", path.display());
        }

        Ok(CsvRecordSink {
            path,
            rows_written: 0,
        })
    }

    pub fn rows_written(&self) -> u64 {
        self.rows_written
    }
}

impl RecordSink for CsvRecordSink {
    fn append(&mut self, record: &Record) -> Result<()> {
        let mut file = OpenOptions::new()
            .append(true)
            .open(&self.path)
            .with_context(|| format!("Failed to open {} for append", self.path.display()))?;

        // Single write per row so a crash leaves at most one short line
        file.write_all(record.to_csv_line().as_bytes())
            .and_then(|_| file.sync_data())
            .with_context(|| {
                format!("Failed to append record {} to {}", record.sequence, self.path.display())
            })?;

        self.rows_written += 1;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        let file = File::open(&self.path)
            .with_context(|| format!("Failed to reopen {} for sync", self.path.display()))?;
        file.sync_all()
            .with_context(|| format!("Failed to sync {}", self.path.display()))?;
        log::info!(
            "Closed {} after {} records",
            self.path.display(),
            self.rows_written
        );
        Ok(())
    }
}
