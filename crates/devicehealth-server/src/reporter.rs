//! Reporter for health events: escalation logging and metrics.

use crate::metrics::MetricsRegistry;
use devicehealth::{HealthEvent, StatusSnapshot};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, info, warn};

/// Reporter consumes monitor events and forwards them to the operator log and metrics
pub struct Reporter {
    /// Event receiver
    events: broadcast::Receiver<HealthEvent>,

    /// Metrics registry (optional)
    metrics: Option<Arc<MetricsRegistry>>,
}

impl Reporter {
    /// Create a new reporter
    pub fn new(events: broadcast::Receiver<HealthEvent>, metrics: Option<Arc<MetricsRegistry>>) -> Self {
        Self { events, metrics }
    }

    /// Run the reporter task until the monitor is dropped
    pub async fn run(mut self) {
        info!("Reporter task started");

        loop {
            match self.events.recv().await {
                Ok(event) => self.handle(&event),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Reporter fell behind, health events dropped");
                }
                Err(RecvError::Closed) => break,
            }
        }

        info!("Reporter task stopped");
    }

    /// Handle a single event
    pub fn handle(&self, event: &HealthEvent) {
        match event {
            HealthEvent::StatusUpdated { worker, snapshot } => {
                self.record_status(worker, snapshot);
            }
            HealthEvent::Escalate { worker, snapshot } => {
                warn!(
                    worker = %worker,
                    level = %snapshot.level,
                    summary = %snapshot.summary(),
                    "Escalating to operator"
                );
                if let Some(ref m) = self.metrics {
                    m.record_escalation(worker);
                }
            }
            HealthEvent::CycleComplete { cycle_time } => {
                if let Some(ref m) = self.metrics {
                    m.record_cycle(*cycle_time);
                }
            }
            HealthEvent::TimingWarning { .. } => {
                if let Some(ref m) = self.metrics {
                    m.record_cycle_overrun();
                }
            }
            HealthEvent::TimeSyncSent { worker } => {
                debug!(worker = worker.as_deref().unwrap_or("broadcast"), "Time sync sent");
            }
            // Already logged by the monitor at the transition
            HealthEvent::Warning { .. }
            | HealthEvent::Critical { .. }
            | HealthEvent::Fatal { .. }
            | HealthEvent::Recovered { .. } => {}
        }
    }

    fn record_status(&self, worker: &str, snapshot: &StatusSnapshot) {
        let Some(ref m) = self.metrics else {
            return;
        };

        // Each update follows exactly one recorded check
        let success = snapshot.consecutive_failures == 0;
        let response_time = if success {
            snapshot
                .response_time_ms
                .map(|ms| Duration::from_secs_f64(ms.max(0.0) / 1000.0))
        } else {
            None
        };
        m.record_check(worker, success, response_time);
        m.set_level(worker, snapshot.level);

        if snapshot.level != snapshot.previous_level {
            m.record_transition(worker, snapshot.previous_level, snapshot.level);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use devicehealth::{HealthLevel, HealthStatus, Thresholds};
    use tokio::time::Instant;

    fn reporter() -> (Reporter, Arc<MetricsRegistry>) {
        let (_tx, rx) = broadcast::channel(16);
        let metrics = Arc::new(MetricsRegistry::new());
        (Reporter::new(rx, Some(metrics.clone())), metrics)
    }

    #[tokio::test]
    async fn test_status_update_records_check() {
        let (reporter, metrics) = reporter();
        let mut status = HealthStatus::new("drive-1", Thresholds::default());
        status.record_success(15.0, Instant::now());

        reporter.handle(&HealthEvent::StatusUpdated {
            worker: "drive-1".to_string(),
            snapshot: status.snapshot(),
        });

        let text = metrics.encode().unwrap();
        assert!(text.contains(r#"devicehealth_checks_total{worker="drive-1",result="success"} 1"#));
        assert!(text.contains(r#"devicehealth_level{worker="drive-1"} 1"#));
        assert!(text.contains(
            r#"devicehealth_level_transitions_total{worker="drive-1",from="unknown",to="healthy"} 1"#
        ));
    }

    #[test]
    fn test_failure_has_no_response_time() {
        let (reporter, metrics) = reporter();
        let mut status = HealthStatus::new("drive-1", Thresholds::default());
        status.record_failure("No PONG within 1.0s");
        assert_eq!(status.level(), HealthLevel::Critical);

        reporter.handle(&HealthEvent::StatusUpdated {
            worker: "drive-1".to_string(),
            snapshot: status.snapshot(),
        });
        reporter.handle(&HealthEvent::Escalate {
            worker: "drive-1".to_string(),
            snapshot: status.snapshot(),
        });

        let text = metrics.encode().unwrap();
        assert!(text.contains(r#"devicehealth_checks_total{worker="drive-1",result="failure"} 1"#));
        assert!(!text.contains(r#"devicehealth_response_time_seconds_count{worker="drive-1"}"#));
        assert!(text.contains(r#"devicehealth_escalations_total{worker="drive-1"} 1"#));
    }

    #[test]
    fn test_cycle_events() {
        let (reporter, metrics) = reporter();
        reporter.handle(&HealthEvent::CycleComplete {
            cycle_time: Duration::from_millis(30),
        });
        reporter.handle(&HealthEvent::TimingWarning {
            actual: Duration::from_secs(12),
            target: Duration::from_secs(10),
        });

        let text = metrics.encode().unwrap();
        assert!(text.contains("devicehealth_cycle_duration_seconds_count 1"));
        assert!(text.contains("devicehealth_cycle_overruns_total 1"));
    }

    #[test]
    fn test_without_metrics() {
        let (_tx, rx) = broadcast::channel(16);
        let reporter = Reporter::new(rx, None);
        reporter.handle(&HealthEvent::TimeSyncSent { worker: None });
    }
}
