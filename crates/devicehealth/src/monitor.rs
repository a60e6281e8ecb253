//! Round-robin health monitor.
//!
//! The monitor is polled by a fixed tick that only decides whether work is
//! due. Each tick sends at most one PING; a full pass over all registered
//! workers is started once per `round_robin_interval`. Every PING arms a
//! cancellable watchdog that records a failure if no PONG arrives within
//! `pong_timeout`.
//!
//! All state is owned by one execution context; see [`crate::driver`] for
//! the task that runs it.

use crate::codec::{Frame, TrackingKey};
use crate::status::{HealthStatus, Thresholds};
use crate::transport::Transport;
use crate::types::{HealthEvent, HealthLevel, MonitorConfig, StatusSnapshot};
use chrono::Utc;
use common::{Error, Result};
use indexmap::IndexMap;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::future::poll_fn;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tokio_util::time::{DelayQueue, delay_queue};
use tracing::{debug, error, info, warn};

/// Default capacity of the event channel
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// A PING still waiting for its PONG. Kept after its watchdog fires so a
/// late PONG is still recorded with its real latency.
#[derive(Debug)]
struct PendingPing {
    sent_at: Instant,
    /// `None` once the watchdog has fired
    watchdog: Option<delay_queue::Key>,
}

/// Timeout armed for one PING.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Watchdog {
    pub worker: String,
    pub key: TrackingKey,
    pub sent_at: Instant,
}

struct WorkerEntry {
    transport: Arc<dyn Transport>,
    status: HealthStatus,
    pending: HashMap<TrackingKey, PendingPing>,
}

/// Position within the current round-robin pass.
#[derive(Debug)]
struct CycleState {
    cycle_start: Instant,
    /// Set once the pass is complete; the next pass starts at this deadline
    next_cycle_deadline: Option<Instant>,
    checked: HashSet<String>,
    current_index: usize,
}

impl CycleState {
    fn new(now: Instant) -> Self {
        Self {
            cycle_start: now,
            next_cycle_deadline: None,
            checked: HashSet::new(),
            current_index: 0,
        }
    }

    fn begin(&mut self, now: Instant) {
        self.cycle_start = now;
        self.next_cycle_deadline = None;
        self.checked.clear();
        self.current_index = 0;
    }
}

/// Health monitor for a set of workers reached over datagram transports.
pub struct HealthMonitor {
    config: MonitorConfig,
    thresholds: Thresholds,
    workers: IndexMap<String, WorkerEntry>,
    /// `Some` while started
    cycle: Option<CycleState>,
    watchdogs: DelayQueue<Watchdog>,
    broadcast_transport: Option<Arc<dyn Transport>>,
    events: broadcast::Sender<HealthEvent>,
}

impl HealthMonitor {
    /// Create a new health monitor
    pub fn new(config: MonitorConfig) -> Result<Self> {
        Self::with_event_capacity(config, DEFAULT_EVENT_CAPACITY)
    }

    /// Create a monitor whose event channel buffers `capacity` events per subscriber.
    pub fn with_event_capacity(config: MonitorConfig, capacity: usize) -> Result<Self> {
        config.validate().map_err(Error::config)?;
        if !config.enabled {
            info!("Health monitor disabled; registrations will be ignored");
        }
        let (events, _) = broadcast::channel(capacity.max(1));
        Ok(Self {
            thresholds: Thresholds::from(&config),
            config,
            workers: IndexMap::new(),
            cycle: None,
            watchdogs: DelayQueue::new(),
            broadcast_transport: None,
            events,
        })
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    /// Subscribe to health events.
    pub fn subscribe(&self) -> broadcast::Receiver<HealthEvent> {
        self.events.subscribe()
    }

    /// Sender side of the event channel, for subscribing after the monitor
    /// has moved onto its task.
    pub fn event_sender(&self) -> broadcast::Sender<HealthEvent> {
        self.events.clone()
    }

    /// Transport used for broadcast time sync.
    pub fn set_broadcast_transport(&mut self, transport: Arc<dyn Transport>) {
        self.broadcast_transport = Some(transport);
    }

    /// Register a worker at UNKNOWN. Re-registering a name replaces its
    /// transport and resets its history. Returns false when monitoring is
    /// disabled.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        transport: Arc<dyn Transport>,
        requested_metrics: Option<Vec<String>>,
    ) -> bool {
        let name = name.into();
        if !self.config.enabled {
            debug!(worker = %name, "Ignoring registration, health monitoring disabled");
            return false;
        }

        let metrics = requested_metrics.unwrap_or_else(|| self.config.default_metrics.clone());
        let status = HealthStatus::new(name.clone(), self.thresholds).with_requested_metrics(metrics);
        info!(worker = %name, metrics = ?status.requested_metrics(), "Registered worker");

        let entry = WorkerEntry {
            transport,
            status,
            pending: HashMap::new(),
        };
        if let Some(previous) = self.workers.insert(name.clone(), entry) {
            debug!(worker = %name, "Replaced existing registration");
            cancel_pending(&mut self.watchdogs, previous.pending.into_values());
        }
        true
    }

    /// Remove a worker. Its watchdogs are cancelled. Returns false if it
    /// was not registered.
    pub fn unregister(&mut self, name: &str) -> bool {
        let Some(entry) = self.workers.shift_remove(name) else {
            return false;
        };
        cancel_pending(&mut self.watchdogs, entry.pending.into_values());
        if let Some(cycle) = self.cycle.as_mut() {
            cycle.checked.remove(name);
        }
        info!(worker = %name, "Unregistered worker");
        true
    }

    /// Remove every worker.
    pub fn unregister_all(&mut self) {
        for (_, entry) in self.workers.drain(..) {
            cancel_pending(&mut self.watchdogs, entry.pending.into_values());
        }
        if let Some(cycle) = self.cycle.as_mut() {
            cycle.checked.clear();
        }
        info!("Unregistered all workers");
    }

    /// Begin round-robin checking. Returns false (and stays stopped) when
    /// disabled or when no workers are registered.
    pub fn start(&mut self, now: Instant) -> bool {
        if !self.config.enabled {
            info!("Not starting, health monitoring disabled");
            return false;
        }
        if self.workers.is_empty() {
            info!("Not starting, no workers registered");
            return false;
        }
        self.cycle = Some(CycleState::new(now));
        info!(workers = self.workers.len(), "Started health monitoring");
        true
    }

    /// Halt scheduling and cancel every outstanding watchdog.
    pub fn stop(&mut self) {
        self.watchdogs.clear();
        for entry in self.workers.values_mut() {
            entry.pending.clear();
        }
        if self.cycle.take().is_some() {
            info!("Stopped health monitoring");
        }
    }

    pub fn is_running(&self) -> bool {
        self.cycle.is_some()
    }

    /// Advance the round-robin schedule. Sends at most one PING.
    pub fn tick(&mut self, now: Instant) {
        if self.workers.is_empty() {
            return;
        }
        let Some(cycle) = self.cycle.as_mut() else {
            return;
        };

        if let Some(deadline) = cycle.next_cycle_deadline {
            if now < deadline {
                return;
            }
            cycle.begin(now);
        }

        if self.workers.keys().all(|name| cycle.checked.contains(name)) {
            self.complete_cycle(now);
            return;
        }

        let count = self.workers.len();
        let mut next = None;
        for _ in 0..count {
            let index = cycle.current_index % count;
            cycle.current_index = (index + 1) % count;
            if let Some((name, _)) = self.workers.get_index(index) {
                if !cycle.checked.contains(name) {
                    next = Some(name.clone());
                    break;
                }
            }
        }

        if let Some(name) = next {
            cycle.checked.insert(name.clone());
            // Send failures are already recorded against the worker
            let _ = self.send_ping(&name, now);
        }
    }

    fn complete_cycle(&mut self, now: Instant) {
        let Some(cycle) = self.cycle.as_mut() else {
            return;
        };
        let target = self.config.round_robin_interval;
        let cycle_time = now.saturating_duration_since(cycle.cycle_start);
        cycle.next_cycle_deadline = Some(cycle.cycle_start + target);

        debug!(cycle_ms = cycle_time.as_millis(), "Round-robin cycle complete");
        self.emit(HealthEvent::CycleComplete { cycle_time });

        if cycle_time > target {
            warn!(
                actual_ms = cycle_time.as_millis(),
                target_ms = target.as_millis(),
                "Round-robin cycle exceeded target interval"
            );
            self.emit(HealthEvent::TimingWarning {
                actual: cycle_time,
                target,
            });
        }
    }

    /// Send one PING to `name` and arm its watchdog. A send failure is
    /// recorded as a failed check and also returned.
    pub fn send_ping(&mut self, name: &str, now: Instant) -> Result<()> {
        let Some(entry) = self.workers.get_mut(name) else {
            return Err(Error::unknown_worker(name));
        };

        let key = if entry.status.needs_timestamped_ping() {
            debug!(worker = %name, level = %entry.status.level(), "Sending timestamped PING");
            TrackingKey::at(Utc::now())
        } else {
            TrackingKey::Bare
        };
        entry.status.mark_ping_sent(now);
        // Timed-out PINGs are superseded by this one
        entry.pending.retain(|_, pending| pending.watchdog.is_some());

        if let Err(e) = entry.transport.send(&Frame::Ping(key.clone()).encode()) {
            warn!(worker = %name, error = %e, "Failed to send PING");
            entry.status.record_failure(format!("Ping send error: {}", e));
            self.publish(name);
            return Err(e.into());
        }

        let watchdog = self.watchdogs.insert_at(
            Watchdog {
                worker: name.to_string(),
                key: key.clone(),
                sent_at: now,
            },
            now + self.config.pong_timeout,
        );
        debug!(worker = %name, key = %key, "PING sent");
        let pending = PendingPing {
            sent_at: now,
            watchdog: Some(watchdog),
        };
        if let Some(replaced) = entry.pending.insert(key, pending) {
            cancel_pending(&mut self.watchdogs, Some(replaced));
        }
        Ok(())
    }

    /// Ping one worker, or every worker when `name` is `None`, outside the
    /// round-robin order. Does not wait for replies.
    pub fn trigger_manual_check(&mut self, name: Option<&str>, now: Instant) -> Result<()> {
        if !self.config.enabled {
            return Ok(());
        }
        match name {
            Some(name) => {
                if !self.workers.contains_key(name) {
                    return Err(Error::unknown_worker(name));
                }
                info!(worker = %name, "Manual health check");
                self.send_ping(name, now)
            }
            None => {
                let names: Vec<String> = self.workers.keys().cloned().collect();
                info!(workers = names.len(), "Manual health check of all workers");
                for name in names {
                    let _ = self.send_ping(&name, now);
                }
                Ok(())
            }
        }
    }

    /// Correlate a decoded PONG with its pending PING. Unmatched PONGs are ignored.
    pub fn handle_pong(&mut self, name: &str, key: TrackingKey, now: Instant) -> Result<()> {
        let entry = self
            .workers
            .get_mut(name)
            .ok_or_else(|| Error::unknown_worker(name))?;
        let Some(pending) = entry.pending.remove(&key) else {
            debug!(worker = %name, key = %key, "Ignoring PONG without a pending PING");
            return Ok(());
        };
        let sent_at = pending.sent_at;
        cancel_pending(&mut self.watchdogs, Some(pending));
        self.on_pong(name, sent_at, BTreeMap::new(), now)
    }

    /// Record a successful round trip for the PING sent at `original_ping_time`.
    pub fn on_pong(
        &mut self,
        name: &str,
        original_ping_time: Instant,
        metrics: BTreeMap<String, String>,
        now: Instant,
    ) -> Result<()> {
        let entry = self
            .workers
            .get_mut(name)
            .ok_or_else(|| Error::unknown_worker(name))?;

        let latency_ms = now.saturating_duration_since(original_ping_time).as_secs_f64() * 1000.0;
        entry.status.update_reported_metrics(metrics);
        entry.status.record_success(latency_ms, now);
        debug!(worker = %name, latency_ms, level = %entry.status.level(), "PONG received");

        let regained = entry.status.regained_contact();
        self.publish(name);
        if regained {
            // Time sync is best effort
            let _ = self.send_time_sync(name);
        }
        Ok(())
    }

    /// Handle an expired watchdog. No-op if the worker is gone or answered.
    pub fn on_timeout(&mut self, watchdog: Watchdog) {
        let Some(entry) = self.workers.get_mut(&watchdog.worker) else {
            debug!(worker = %watchdog.worker, "Watchdog fired for unregistered worker");
            return;
        };
        if let Some(pending) = entry
            .pending
            .get_mut(&watchdog.key)
            .filter(|pending| pending.sent_at == watchdog.sent_at)
        {
            pending.watchdog = None;
        }
        if entry.status.answered_since(watchdog.sent_at) {
            return;
        }

        entry.status.record_failure(format!(
            "No PONG within {:.1}s",
            self.config.pong_timeout.as_secs_f64()
        ));
        warn!(
            worker = %watchdog.worker,
            consecutive = entry.status.consecutive_failures(),
            "PING timed out"
        );
        self.publish(&watchdog.worker);
    }

    /// Send a ZULU time sync to one worker.
    pub fn send_time_sync(&mut self, name: &str) -> Result<()> {
        let entry = self
            .workers
            .get(name)
            .ok_or_else(|| Error::unknown_worker(name))?;
        let payload = Frame::time_sync(Utc::now()).encode();
        if let Err(e) = entry.transport.send(&payload) {
            warn!(worker = %name, error = %e, "Failed to send time sync");
            return Err(e.into());
        }
        info!(worker = %name, "Sent time sync");
        self.emit(HealthEvent::TimeSyncSent {
            worker: Some(name.to_string()),
        });
        Ok(())
    }

    /// Broadcast a ZULU time sync over the broadcast transport.
    pub fn broadcast_time_sync(&mut self) -> Result<()> {
        let transport = self
            .broadcast_transport
            .as_ref()
            .ok_or_else(|| Error::config("no broadcast transport configured"))?;
        transport.broadcast(&Frame::time_sync(Utc::now()).encode())?;
        info!("Broadcast time sync");
        self.emit(HealthEvent::TimeSyncSent { worker: None });
        Ok(())
    }

    /// True while any watchdog is armed.
    pub fn has_watchdogs(&self) -> bool {
        !self.watchdogs.is_empty()
    }

    /// Wait for the next watchdog to expire. Resolves to `None` immediately
    /// when none are armed.
    pub async fn next_expired(&mut self) -> Option<Watchdog> {
        poll_fn(|cx| self.watchdogs.poll_expired(cx))
            .await
            .map(|expired| expired.into_inner())
    }

    pub fn status(&self, name: &str) -> Option<StatusSnapshot> {
        self.workers.get(name).map(|entry| entry.status.snapshot())
    }

    /// Snapshots in registration order.
    pub fn statuses(&self) -> Vec<StatusSnapshot> {
        self.workers
            .values()
            .map(|entry| entry.status.snapshot())
            .collect()
    }

    pub fn worker_names(&self) -> Vec<String> {
        self.workers.keys().cloned().collect()
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.workers.contains_key(name)
    }

    /// PINGs sent to `name` that are still awaiting a PONG.
    pub fn pending_pings(&self, name: &str) -> usize {
        self.workers.get(name).map_or(0, |entry| entry.pending.len())
    }

    /// Emit the status update, plus level alerts when the level changed.
    fn publish(&self, name: &str) {
        let Some(entry) = self.workers.get(name) else {
            return;
        };
        let status = &entry.status;
        let snapshot = status.snapshot();
        let level = status.level();
        let previous = status.previous_level();
        let changed = status.level_changed();

        self.emit(HealthEvent::StatusUpdated {
            worker: name.to_string(),
            snapshot: snapshot.clone(),
        });

        if !changed {
            debug!(worker = %name, level = %level, "Health level unchanged");
            return;
        }

        match level {
            HealthLevel::Fatal => {
                let message = status.last_error().unwrap_or("Fatal error").to_string();
                error!(worker = %name, error = %message, "Worker is FATAL");
                self.emit(HealthEvent::Fatal {
                    worker: name.to_string(),
                    message,
                });
                self.emit(HealthEvent::Escalate {
                    worker: name.to_string(),
                    snapshot,
                });
            }
            HealthLevel::Critical => {
                let message = status.last_error().unwrap_or("Critical error").to_string();
                warn!(worker = %name, error = %message, "Worker is CRITICAL");
                self.emit(HealthEvent::Critical {
                    worker: name.to_string(),
                    message,
                });
                self.emit(HealthEvent::Escalate {
                    worker: name.to_string(),
                    snapshot,
                });
            }
            HealthLevel::Warning => {
                let message = if status.transit_anomaly_detected() {
                    "Transit time anomaly detected"
                } else {
                    "Slow response times detected"
                };
                warn!(worker = %name, "Worker is WARNING: {}", message);
                self.emit(HealthEvent::Warning {
                    worker: name.to_string(),
                    message: message.to_string(),
                });
            }
            HealthLevel::Healthy if previous != HealthLevel::Unknown => {
                info!(worker = %name, from = %previous, "Worker recovered");
                self.emit(HealthEvent::Recovered {
                    worker: name.to_string(),
                    from: previous,
                });
            }
            HealthLevel::Healthy | HealthLevel::Unknown => {}
        }
    }

    fn emit(&self, event: HealthEvent) {
        // No subscribers is not an error
        let _ = self.events.send(event);
    }
}

fn cancel_pending(
    watchdogs: &mut DelayQueue<Watchdog>,
    pending: impl IntoIterator<Item = PendingPing>,
) {
    for key in pending.into_iter().filter_map(|ping| ping.watchdog) {
        watchdogs.try_remove(&key);
    }
}
