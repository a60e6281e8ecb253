//! Health monitoring types and structures.

use indexmap::IndexSet;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

/// Health level of a worker, ordered by severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HealthLevel {
    /// No check recorded yet
    Unknown,
    /// Responding normally
    Healthy,
    /// Responding, but slowly or anomalously
    Warning,
    /// The most recent check failed
    Critical,
    /// Too many failures in the recent window
    Fatal,
}

impl HealthLevel {
    /// CRITICAL or FATAL.
    pub fn is_hard_failure(self) -> bool {
        matches!(self, HealthLevel::Critical | HealthLevel::Fatal)
    }

    /// HEALTHY or WARNING.
    pub fn is_responsive(self) -> bool {
        matches!(self, HealthLevel::Healthy | HealthLevel::Warning)
    }

    /// Numeric code for gauges (0 = unknown .. 4 = fatal).
    pub fn code(self) -> i64 {
        match self {
            HealthLevel::Unknown => 0,
            HealthLevel::Healthy => 1,
            HealthLevel::Warning => 2,
            HealthLevel::Critical => 3,
            HealthLevel::Fatal => 4,
        }
    }
}

impl fmt::Display for HealthLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthLevel::Unknown => write!(f, "UNKNOWN"),
            HealthLevel::Healthy => write!(f, "HEALTHY"),
            HealthLevel::Warning => write!(f, "WARNING"),
            HealthLevel::Critical => write!(f, "CRITICAL"),
            HealthLevel::Fatal => write!(f, "FATAL"),
        }
    }
}

/// Health monitor configuration. Fixed at construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Master switch; a disabled monitor ignores registrations
    pub enabled: bool,

    /// Target time for one full round-robin pass
    #[serde(with = "humantime_serde")]
    pub round_robin_interval: Duration,

    /// How long to wait for a PONG before recording a failure
    #[serde(with = "humantime_serde")]
    pub pong_timeout: Duration,

    /// Scheduler polling granularity (not the check interval)
    #[serde(with = "humantime_serde")]
    pub tick_interval: Duration,

    /// M: outcomes kept in the check history
    pub window_size: usize,

    /// N: failures within the history that mean FATAL
    pub fatal_threshold: usize,

    /// Response times kept for slow detection
    pub slow_window: usize,

    /// Slow responses within `slow_window` that mean WARNING
    pub slow_threshold: usize,

    /// A response slower than this is "slow"
    pub slow_response_ms: f64,

    /// Samples kept for transit anomaly detection
    pub transit_window: usize,

    /// k: standard deviations above the mean that count as an anomaly
    pub transit_stddev_multiplier: f64,

    /// Metrics requested from workers registered without an explicit list
    pub default_metrics: Vec<String>,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            round_robin_interval: Duration::from_secs(10),
            pong_timeout: Duration::from_secs(1),
            tick_interval: Duration::from_millis(10),
            window_size: 10,
            fatal_threshold: 3,
            slow_window: 5,
            slow_threshold: 2,
            slow_response_ms: 1000.0,
            // 3 minutes at a 10 s cycle
            transit_window: 18,
            transit_stddev_multiplier: 2.0,
            default_metrics: vec!["uptime".into(), "mem".into(), "errors".into()],
        }
    }
}

impl MonitorConfig {
    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.window_size == 0 {
            return Err("window_size must be at least 1".to_string());
        }
        if self.fatal_threshold == 0 || self.fatal_threshold > self.window_size {
            return Err(format!(
                "fatal_threshold must be between 1 and window_size ({})",
                self.window_size
            ));
        }
        if self.slow_window == 0 {
            return Err("slow_window must be at least 1".to_string());
        }
        if self.slow_threshold == 0 || self.slow_threshold > self.slow_window {
            return Err(format!(
                "slow_threshold must be between 1 and slow_window ({})",
                self.slow_window
            ));
        }
        if !self.slow_response_ms.is_finite() || self.slow_response_ms < 0.0 {
            return Err("slow_response_ms must be a non-negative number".to_string());
        }
        if self.transit_window < 2 {
            return Err("transit_window must hold at least 2 samples".to_string());
        }
        if !self.transit_stddev_multiplier.is_finite() || self.transit_stddev_multiplier < 0.0 {
            return Err("transit_stddev_multiplier must be a non-negative number".to_string());
        }
        if self.pong_timeout.is_zero() {
            return Err("pong_timeout must be greater than zero".to_string());
        }
        if self.tick_interval.is_zero() || self.tick_interval >= self.round_robin_interval {
            return Err("tick_interval must be non-zero and shorter than round_robin_interval".to_string());
        }
        Ok(())
    }
}

/// Point-in-time view of one worker's health, for UI and telemetry consumers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub worker: String,
    pub level: HealthLevel,
    pub previous_level: HealthLevel,
    /// Latency of the most recent PONG
    pub response_time_ms: Option<f64>,
    pub consecutive_failures: u32,
    pub failures_in_window: usize,
    pub checks_in_window: usize,
    pub slow_responses: usize,
    pub transit_window_len: usize,
    pub transit_anomaly: bool,
    pub transit_mean_ms: Option<f64>,
    pub transit_stddev_ms: Option<f64>,
    pub last_error: Option<String>,
    pub requested_metrics: IndexSet<String>,
    /// Extra values reported alongside the last PONG
    pub metrics: BTreeMap<String, String>,
}

impl StatusSnapshot {
    /// One-line human summary of the current level.
    pub fn summary(&self) -> String {
        match self.level {
            HealthLevel::Unknown => "UNKNOWN: no data".to_string(),
            HealthLevel::Healthy => match self.response_time_ms {
                Some(ms) => format!("HEALTHY: {:.0}ms", ms),
                None => "HEALTHY".to_string(),
            },
            HealthLevel::Warning if self.transit_anomaly => format!(
                "WARNING: transit anomaly {:.0}ms (mean {:.0}ms, stddev {:.0}ms)",
                self.response_time_ms.unwrap_or_default(),
                self.transit_mean_ms.unwrap_or_default(),
                self.transit_stddev_ms.unwrap_or_default(),
            ),
            HealthLevel::Warning => format!(
                "WARNING: {} slow responses",
                self.slow_responses
            ),
            HealthLevel::Critical => format!(
                "CRITICAL: {}",
                self.last_error.as_deref().unwrap_or("no response")
            ),
            HealthLevel::Fatal => format!(
                "FATAL: {}/{} checks failed",
                self.failures_in_window, self.checks_in_window
            ),
        }
    }
}

/// Events published by the health monitor.
#[derive(Debug, Clone, PartialEq)]
pub enum HealthEvent {
    /// Emitted after every recorded check
    StatusUpdated { worker: String, snapshot: StatusSnapshot },
    /// Entered WARNING
    Warning { worker: String, message: String },
    /// Entered CRITICAL
    Critical { worker: String, message: String },
    /// Entered FATAL
    Fatal { worker: String, message: String },
    /// Entered CRITICAL or FATAL; for the controller/operator path
    Escalate { worker: String, snapshot: StatusSnapshot },
    /// Returned to HEALTHY from a degraded level
    Recovered { worker: String, from: HealthLevel },
    /// A round-robin pass finished
    CycleComplete { cycle_time: Duration },
    /// A round-robin pass took longer than its target (advisory)
    TimingWarning { actual: Duration, target: Duration },
    /// A ZULU frame went out; `None` means broadcast
    TimeSyncSent { worker: Option<String> },
}

impl HealthEvent {
    /// Worker the event concerns, if any.
    pub fn worker(&self) -> Option<&str> {
        match self {
            HealthEvent::StatusUpdated { worker, .. }
            | HealthEvent::Warning { worker, .. }
            | HealthEvent::Critical { worker, .. }
            | HealthEvent::Fatal { worker, .. }
            | HealthEvent::Escalate { worker, .. }
            | HealthEvent::Recovered { worker, .. } => Some(worker),
            HealthEvent::TimeSyncSent { worker } => worker.as_deref(),
            HealthEvent::CycleComplete { .. } | HealthEvent::TimingWarning { .. } => None,
        }
    }
}
