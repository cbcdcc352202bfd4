use std::fmt::Display;
use std::time::Instant;

/// Consecutive failures before a sensor is reported as degraded
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 3;

/// Tracks the read outcome of one sensor across cycles
#[derive(Clone, Debug)]
pub struct SensorHealth {
    pub name: String,
    failure_threshold: u32,
    consecutive_failures: u32,
    total_failures: u64,
    last_success: Option<Instant>,
}

impl SensorHealth {
    pub fn new(name: &str, failure_threshold: u32) -> Self {
        SensorHealth {
            name: name.to_string(),
            failure_threshold: failure_threshold.max(1),
            consecutive_failures: 0,
            total_failures: 0,
            last_success: None,
        }
    }

    pub fn record_success(&mut self) {
        if self.is_degraded() {
            log::info!(
                "[health] {} recovered after {} failed reads",
                self.name,
                self.consecutive_failures
            );
        }
        self.consecutive_failures = 0;
        self.last_success = Some(Instant::now());
    }

    /// Warns once, on the read that crosses the threshold
    pub fn record_failure(&mut self, error: &impl Display) {
        self.consecutive_failures += 1;
        self.total_failures += 1;

        if self.consecutive_failures == self.failure_threshold {
            let since = self
                .last_success
                .map(|t| format!("{:.1}s ago", t.elapsed().as_secs_f64()))
                .unwrap_or_else(|| "never".to_string());
            log::warn!(
                "[health] {} degraded: {} consecutive failures (last success {}), latest: {}",
                self.name,
                self.consecutive_failures,
                since,
                error
            );
        } else {
            log::debug!("[health] {} read failed: {}", self.name, error);
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.consecutive_failures >= self.failure_threshold
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn total_failures(&self) -> u64 {
        self.total_failures
    }
}
