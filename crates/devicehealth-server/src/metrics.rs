//! Prometheus metrics for the device health server.

use devicehealth::HealthLevel;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{Histogram, exponential_buckets};
use prometheus_client::registry::Registry;
use std::time::Duration;

/// Labels for per-worker metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct WorkerLabels {
    pub worker: String,
}

/// Labels for check result metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct CheckLabels {
    pub worker: String,
    /// success or failure
    pub result: String,
}

/// Labels for level transition metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct TransitionLabels {
    pub worker: String,
    pub from: String,
    pub to: String,
}

/// Metrics registry with all device health metrics
pub struct MetricsRegistry {
    /// Prometheus registry
    pub registry: Registry,

    // Per-worker metrics
    checks_total: Family<CheckLabels, Counter>,
    response_time_seconds: Family<WorkerLabels, Histogram>,
    /// Current level (0=unknown .. 4=fatal)
    level: Family<WorkerLabels, Gauge>,
    level_transitions_total: Family<TransitionLabels, Counter>,
    escalations_total: Family<WorkerLabels, Counter>,

    // Scheduler metrics
    cycle_duration_seconds: Histogram,
    cycle_overruns_total: Counter,
    workers_active: Gauge,
}

impl MetricsRegistry {
    /// Create a new metrics registry
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let checks_total = Family::<CheckLabels, Counter>::default();
        registry.register(
            "devicehealth_checks",
            "Total health checks recorded",
            checks_total.clone(),
        );

        // 1ms to ~4s
        let response_time_seconds = Family::<WorkerLabels, Histogram>::new_with_constructor(|| {
            Histogram::new(exponential_buckets(0.001, 2.0, 13))
        });
        registry.register(
            "devicehealth_response_time_seconds",
            "PING to PONG round trip time in seconds",
            response_time_seconds.clone(),
        );

        let level = Family::<WorkerLabels, Gauge>::default();
        registry.register(
            "devicehealth_level",
            "Current health level (0=unknown, 1=healthy, 2=warning, 3=critical, 4=fatal)",
            level.clone(),
        );

        let level_transitions_total = Family::<TransitionLabels, Counter>::default();
        registry.register(
            "devicehealth_level_transitions",
            "Total health level transitions",
            level_transitions_total.clone(),
        );

        let escalations_total = Family::<WorkerLabels, Counter>::default();
        registry.register(
            "devicehealth_escalations",
            "Total escalations to CRITICAL or FATAL",
            escalations_total.clone(),
        );

        let cycle_duration_seconds = Histogram::new(exponential_buckets(0.01, 2.0, 12));
        registry.register(
            "devicehealth_cycle_duration_seconds",
            "Round-robin cycle duration in seconds",
            cycle_duration_seconds.clone(),
        );

        let cycle_overruns_total = Counter::default();
        registry.register(
            "devicehealth_cycle_overruns",
            "Round-robin cycles that exceeded the target interval",
            cycle_overruns_total.clone(),
        );

        let workers_active = Gauge::default();
        registry.register(
            "devicehealth_workers_active",
            "Number of registered workers",
            workers_active.clone(),
        );

        Self {
            registry,
            checks_total,
            response_time_seconds,
            level,
            level_transitions_total,
            escalations_total,
            cycle_duration_seconds,
            cycle_overruns_total,
            workers_active,
        }
    }

    /// Record a health check result. Response time is only known on success.
    pub fn record_check(&self, worker: &str, success: bool, response_time: Option<Duration>) {
        let result = if success { "success" } else { "failure" };
        self.checks_total
            .get_or_create(&CheckLabels {
                worker: worker.to_string(),
                result: result.to_string(),
            })
            .inc();

        if let Some(response_time) = response_time {
            self.response_time_seconds
                .get_or_create(&worker_labels(worker))
                .observe(response_time.as_secs_f64());
        }
    }

    /// Update health level gauge
    pub fn set_level(&self, worker: &str, level: HealthLevel) {
        self.level.get_or_create(&worker_labels(worker)).set(level.code());
    }

    /// Record a level transition
    pub fn record_transition(&self, worker: &str, from: HealthLevel, to: HealthLevel) {
        self.level_transitions_total
            .get_or_create(&TransitionLabels {
                worker: worker.to_string(),
                from: level_label(from),
                to: level_label(to),
            })
            .inc();
    }

    pub fn record_escalation(&self, worker: &str) {
        self.escalations_total.get_or_create(&worker_labels(worker)).inc();
    }

    pub fn record_cycle(&self, duration: Duration) {
        self.cycle_duration_seconds.observe(duration.as_secs_f64());
    }

    pub fn record_cycle_overrun(&self) {
        self.cycle_overruns_total.inc();
    }

    /// Update active worker count
    pub fn set_workers_active(&self, count: usize) {
        self.workers_active.set(count as i64);
    }

    /// Encode all metrics in Prometheus text format
    pub fn encode(&self) -> Result<String, std::fmt::Error> {
        let mut buffer = String::new();
        encode(&mut buffer, &self.registry)?;
        Ok(buffer)
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn worker_labels(worker: &str) -> WorkerLabels {
    WorkerLabels {
        worker: worker.to_string(),
    }
}

/// Lowercase level name for labels
fn level_label(level: HealthLevel) -> String {
    level.to_string().to_ascii_lowercase()
}
