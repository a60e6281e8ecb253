//! Per-worker health state machine.
//!
//! Level is recomputed after every recorded check, first match wins:
//!
//! ```text
//! FATAL     failures in check history >= fatal_threshold   (clears transit window)
//! CRITICAL  most recent check failed                       (clears transit window)
//! WARNING   transit window full and latest > mean + k * stddev
//! WARNING   slow responses in slow window >= slow_threshold
//! HEALTHY   otherwise
//! ```

use crate::types::{HealthLevel, MonitorConfig, StatusSnapshot};
use crate::window::SlidingWindow;
use indexmap::IndexSet;
use std::collections::BTreeMap;
use tokio::time::Instant;

const TRANSIT_ANOMALY_ERROR: &str = "Transit time anomaly detected";

/// Classification thresholds, copied out of [`MonitorConfig`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Thresholds {
    pub window_size: usize,
    pub fatal_threshold: usize,
    pub slow_window: usize,
    pub slow_threshold: usize,
    pub slow_response_ms: f64,
    pub transit_window: usize,
    pub transit_stddev_multiplier: f64,
}

impl From<&MonitorConfig> for Thresholds {
    fn from(config: &MonitorConfig) -> Self {
        Self {
            window_size: config.window_size,
            fatal_threshold: config.fatal_threshold,
            slow_window: config.slow_window,
            slow_threshold: config.slow_threshold,
            slow_response_ms: config.slow_response_ms,
            transit_window: config.transit_window,
            transit_stddev_multiplier: config.transit_stddev_multiplier,
        }
    }
}

impl Default for Thresholds {
    fn default() -> Self {
        Self::from(&MonitorConfig::default())
    }
}

/// Health of one worker, derived from three sliding windows.
#[derive(Debug, Clone)]
pub struct HealthStatus {
    worker: String,
    thresholds: Thresholds,
    check_history: SlidingWindow<bool>,
    response_times: SlidingWindow<f64>,
    transit_times: SlidingWindow<f64>,
    level: HealthLevel,
    previous_level: HealthLevel,
    consecutive_failures: u32,
    last_ping_time: Option<Instant>,
    last_pong_time: Option<Instant>,
    last_response_ms: Option<f64>,
    last_error: Option<String>,
    transit_anomaly_detected: bool,
    requested_metrics: IndexSet<String>,
    reported_metrics: BTreeMap<String, String>,
}

impl HealthStatus {
    /// Create a status at UNKNOWN with empty windows.
    pub fn new(worker: impl Into<String>, thresholds: Thresholds) -> Self {
        Self {
            worker: worker.into(),
            thresholds,
            check_history: SlidingWindow::new(thresholds.window_size),
            response_times: SlidingWindow::new(thresholds.slow_window),
            transit_times: SlidingWindow::new(thresholds.transit_window),
            level: HealthLevel::Unknown,
            previous_level: HealthLevel::Unknown,
            consecutive_failures: 0,
            last_ping_time: None,
            last_pong_time: None,
            last_response_ms: None,
            last_error: None,
            transit_anomaly_detected: false,
            requested_metrics: IndexSet::new(),
            reported_metrics: BTreeMap::new(),
        }
    }

    /// Set the telemetry fields this worker is expected to report.
    pub fn with_requested_metrics<I, S>(mut self, metrics: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.requested_metrics = metrics.into_iter().map(Into::into).collect();
        self
    }

    /// Record a PONG received `latency_ms` after its PING.
    pub fn record_success(&mut self, latency_ms: f64, at: Instant) {
        self.check_history.push(true);
        self.response_times.push(latency_ms);
        self.transit_times.push(latency_ms);
        self.last_pong_time = Some(at);
        self.last_response_ms = Some(latency_ms);
        self.consecutive_failures = 0;
        self.update_level();
    }

    /// Record a failed check (timeout or send error).
    pub fn record_failure(&mut self, reason: impl Into<String>) {
        self.check_history.push(false);
        self.consecutive_failures += 1;
        self.last_error = Some(reason.into());
        self.update_level();
    }

    /// Note that a PING went out.
    pub fn mark_ping_sent(&mut self, at: Instant) {
        self.last_ping_time = Some(at);
    }

    /// Replace the extra values reported with the last PONG. Empty maps are ignored.
    pub fn update_reported_metrics(&mut self, metrics: BTreeMap<String, String>) {
        if !metrics.is_empty() {
            self.reported_metrics = metrics;
        }
    }

    fn update_level(&mut self) {
        self.previous_level = self.level;

        if self.check_history.is_empty() {
            self.level = HealthLevel::Unknown;
            return;
        }

        if self.failures_in_window() >= self.thresholds.fatal_threshold {
            self.level = HealthLevel::Fatal;
            self.transit_times.clear();
            self.transit_anomaly_detected = false;
            return;
        }

        if self.check_history.latest() == Some(&false) {
            self.level = HealthLevel::Critical;
            self.transit_times.clear();
            self.transit_anomaly_detected = false;
            return;
        }

        self.transit_anomaly_detected = self.is_transit_anomaly();
        if self.transit_anomaly_detected {
            self.level = HealthLevel::Warning;
            self.last_error = Some(TRANSIT_ANOMALY_ERROR.to_string());
            return;
        }

        if self.slow_responses() >= self.thresholds.slow_threshold {
            self.level = HealthLevel::Warning;
            return;
        }

        self.level = HealthLevel::Healthy;
        self.last_error = None;
    }

    fn is_transit_anomaly(&self) -> bool {
        if !self.transit_times.is_full() {
            return false;
        }
        let (Some(mean), Some(stddev), Some(&latest)) = (
            self.transit_times.mean(),
            self.transit_times.sample_stddev(),
            self.transit_times.latest(),
        ) else {
            return false;
        };
        if stddev <= 0.0 {
            return false;
        }
        latest > mean + self.thresholds.transit_stddev_multiplier * stddev
    }

    pub fn worker(&self) -> &str {
        &self.worker
    }

    pub fn level(&self) -> HealthLevel {
        self.level
    }

    pub fn previous_level(&self) -> HealthLevel {
        self.previous_level
    }

    /// True when the last recompute moved to a different level.
    pub fn level_changed(&self) -> bool {
        self.level != self.previous_level
    }

    /// The next PING should carry a timestamp: first contact, or just
    /// recovered from CRITICAL/FATAL.
    pub fn needs_timestamped_ping(&self) -> bool {
        self.level == HealthLevel::Unknown || self.just_recovered()
    }

    /// Last recompute went from UNKNOWN/CRITICAL/FATAL to HEALTHY/WARNING.
    pub fn regained_contact(&self) -> bool {
        self.level.is_responsive()
            && (self.previous_level == HealthLevel::Unknown || self.previous_level.is_hard_failure())
    }

    fn just_recovered(&self) -> bool {
        self.previous_level.is_hard_failure() && self.level.is_responsive()
    }

    /// A PONG was recorded at or after `ping_time`.
    pub fn answered_since(&self, ping_time: Instant) -> bool {
        self.last_pong_time.is_some_and(|pong| pong >= ping_time)
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn failures_in_window(&self) -> usize {
        self.check_history.iter().filter(|&&ok| !ok).count()
    }

    pub fn slow_responses(&self) -> usize {
        self.response_times.count_above(self.thresholds.slow_response_ms)
    }

    pub fn transit_anomaly_detected(&self) -> bool {
        self.transit_anomaly_detected
    }

    pub fn transit_window_len(&self) -> usize {
        self.transit_times.len()
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn last_ping_time(&self) -> Option<Instant> {
        self.last_ping_time
    }

    pub fn last_pong_time(&self) -> Option<Instant> {
        self.last_pong_time
    }

    pub fn requested_metrics(&self) -> &IndexSet<String> {
        &self.requested_metrics
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        StatusSnapshot {
            worker: self.worker.clone(),
            level: self.level,
            previous_level: self.previous_level,
            response_time_ms: self.last_response_ms,
            consecutive_failures: self.consecutive_failures,
            failures_in_window: self.failures_in_window(),
            checks_in_window: self.check_history.len(),
            slow_responses: self.slow_responses(),
            transit_window_len: self.transit_times.len(),
            transit_anomaly: self.transit_anomaly_detected,
            transit_mean_ms: self.transit_times.mean(),
            transit_stddev_ms: self.transit_times.sample_stddev(),
            last_error: self.last_error.clone(),
            requested_metrics: self.requested_metrics.clone(),
            metrics: self.reported_metrics.clone(),
        }
    }
}
