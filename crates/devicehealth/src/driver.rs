//! Task that owns a [`HealthMonitor`] and the handle used to talk to it.
//!
//! The driver multiplexes the scheduler tick, expired watchdogs and
//! commands from [`MonitorHandle`]s in one `select!` loop, so monitor state
//! is only ever touched from that task.

use crate::codec::{Frame, TrackingKey};
use crate::monitor::HealthMonitor;
use crate::transport::{Dispatcher, Transport};
use crate::types::{HealthEvent, StatusSnapshot};
use bytes::Bytes;
use common::{Error, Result};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval};
use tracing::{debug, info, trace, warn};

/// Requests forwarded from a handle to the driver task.
enum Command {
    Register {
        name: String,
        transport: Arc<dyn Transport>,
        requested_metrics: Option<Vec<String>>,
        reply: oneshot::Sender<bool>,
    },
    Unregister {
        name: String,
        reply: oneshot::Sender<bool>,
    },
    UnregisterAll,
    Start {
        reply: oneshot::Sender<bool>,
    },
    Stop,
    ManualCheck {
        name: Option<String>,
        reply: oneshot::Sender<Result<()>>,
    },
    Pong {
        worker: String,
        key: TrackingKey,
    },
    PongAt {
        worker: String,
        original_ping_time: Instant,
        metrics: BTreeMap<String, String>,
    },
    Status {
        name: String,
        reply: oneshot::Sender<Option<StatusSnapshot>>,
    },
    Statuses {
        reply: oneshot::Sender<Vec<StatusSnapshot>>,
    },
    BroadcastTimeSync {
        reply: oneshot::Sender<Result<()>>,
    },
    Shutdown,
}

/// Runs a health monitor on its own task
pub struct MonitorDriver {
    monitor: HealthMonitor,
    commands: mpsc::UnboundedReceiver<Command>,
}

impl MonitorDriver {
    /// Create a driver and the handle that controls it
    pub fn new(monitor: HealthMonitor) -> (Self, MonitorHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = MonitorHandle {
            commands: tx,
            events: monitor.event_sender(),
        };
        (
            Self {
                monitor,
                commands: rx,
            },
            handle,
        )
    }

    /// Spawn the driver onto the current runtime
    pub fn spawn(monitor: HealthMonitor) -> (MonitorHandle, JoinHandle<()>) {
        let (driver, handle) = Self::new(monitor);
        let task = tokio::spawn(driver.run());
        (handle, task)
    }

    /// Run until shut down or every handle is dropped
    pub async fn run(mut self) {
        info!("Health monitor task started");

        let mut ticker = interval(self.monitor.config().tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.monitor.tick(Instant::now());
                }

                Some(watchdog) = self.monitor.next_expired(), if self.monitor.has_watchdogs() => {
                    self.monitor.on_timeout(watchdog);
                }

                command = self.commands.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.apply(command),
                },
            }
        }

        self.monitor.stop();
        info!("Health monitor task stopped");
    }

    fn apply(&mut self, command: Command) {
        match command {
            Command::Register {
                name,
                transport,
                requested_metrics,
                reply,
            } => {
                let _ = reply.send(self.monitor.register(name, transport, requested_metrics));
            }
            Command::Unregister { name, reply } => {
                let _ = reply.send(self.monitor.unregister(&name));
            }
            Command::UnregisterAll => self.monitor.unregister_all(),
            Command::Start { reply } => {
                let _ = reply.send(self.monitor.start(Instant::now()));
            }
            Command::Stop => self.monitor.stop(),
            Command::ManualCheck { name, reply } => {
                let result = self
                    .monitor
                    .trigger_manual_check(name.as_deref(), Instant::now());
                if let Err(e) = &result {
                    warn!(error = %e, "Manual health check failed");
                }
                let _ = reply.send(result);
            }
            Command::Pong { worker, key } => {
                if let Err(e) = self.monitor.handle_pong(&worker, key, Instant::now()) {
                    debug!(worker = %worker, error = %e, "Dropping PONG");
                }
            }
            Command::PongAt {
                worker,
                original_ping_time,
                metrics,
            } => {
                if let Err(e) =
                    self.monitor
                        .on_pong(&worker, original_ping_time, metrics, Instant::now())
                {
                    debug!(worker = %worker, error = %e, "Dropping PONG");
                }
            }
            Command::Status { name, reply } => {
                let _ = reply.send(self.monitor.status(&name));
            }
            Command::Statuses { reply } => {
                let _ = reply.send(self.monitor.statuses());
            }
            Command::BroadcastTimeSync { reply } => {
                let _ = reply.send(self.monitor.broadcast_time_sync());
            }
            Command::Shutdown => {}
        }
    }
}

/// Cloneable handle to a running [`MonitorDriver`].
#[derive(Clone)]
pub struct MonitorHandle {
    commands: mpsc::UnboundedSender<Command>,
    events: broadcast::Sender<HealthEvent>,
}

impl MonitorHandle {
    fn send(&self, command: Command) -> Result<()> {
        self.commands.send(command).map_err(|_| closed())
    }

    async fn request<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.send(command(tx))?;
        rx.await.map_err(|_| closed())
    }

    /// Subscribe to health events
    pub fn subscribe(&self) -> broadcast::Receiver<HealthEvent> {
        self.events.subscribe()
    }

    /// Register a worker. `Ok(false)` when monitoring is disabled.
    pub async fn register(
        &self,
        name: impl Into<String>,
        transport: Arc<dyn Transport>,
        requested_metrics: Option<Vec<String>>,
    ) -> Result<bool> {
        let name = name.into();
        self.request(|reply| Command::Register {
            name,
            transport,
            requested_metrics,
            reply,
        })
        .await
    }

    pub async fn unregister(&self, name: impl Into<String>) -> Result<bool> {
        let name = name.into();
        self.request(|reply| Command::Unregister { name, reply }).await
    }

    pub fn unregister_all(&self) -> Result<()> {
        self.send(Command::UnregisterAll)
    }

    /// Start round-robin checking
    pub async fn start(&self) -> Result<bool> {
        self.request(|reply| Command::Start { reply }).await
    }

    /// Stop checking and cancel outstanding watchdogs
    pub fn stop(&self) -> Result<()> {
        self.send(Command::Stop)
    }

    /// Ping one worker, or all when `name` is `None`
    pub async fn trigger_manual_check(&self, name: Option<String>) -> Result<()> {
        self.request(|reply| Command::ManualCheck { name, reply })
            .await?
    }

    /// Deliver a decoded PONG from `worker`
    pub fn pong(&self, worker: impl Into<String>, key: TrackingKey) -> Result<()> {
        self.send(Command::Pong {
            worker: worker.into(),
            key,
        })
    }

    /// Transport receive hook. PONGs are handed to the monitor and stray
    /// PING/ZULU frames dropped; application payloads are returned untouched
    /// for the command layer.
    pub fn deliver(&self, worker: &str, payload: &[u8]) -> Option<Bytes> {
        match Frame::decode(payload) {
            Frame::Pong(key) => {
                if let Err(e) = self.pong(worker, key) {
                    debug!(worker = %worker, error = %e, "Dropping PONG");
                }
                None
            }
            Frame::Ping(_) | Frame::TimeSync(_) => {
                trace!(worker = %worker, "Ignoring monitor-bound frame from worker");
                None
            }
            Frame::Other(bytes) => Some(bytes),
        }
    }

    /// Record a PONG for the PING sent at `original_ping_time`
    pub fn on_pong(
        &self,
        worker: impl Into<String>,
        original_ping_time: Instant,
        metrics: BTreeMap<String, String>,
    ) -> Result<()> {
        self.send(Command::PongAt {
            worker: worker.into(),
            original_ping_time,
            metrics,
        })
    }

    pub async fn status(&self, name: impl Into<String>) -> Result<Option<StatusSnapshot>> {
        let name = name.into();
        self.request(|reply| Command::Status { name, reply }).await
    }

    pub async fn statuses(&self) -> Result<Vec<StatusSnapshot>> {
        self.request(|reply| Command::Statuses { reply }).await
    }

    pub async fn broadcast_time_sync(&self) -> Result<()> {
        self.request(|reply| Command::BroadcastTimeSync { reply })
            .await?
    }

    /// Stop the driver task
    pub fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown);
    }

    /// True once the driver task has exited
    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }
}

fn closed() -> Error {
    Error::other("health monitor task is not running")
}

/// Classifies payloads received from one worker: PONGs go to the monitor,
/// application traffic to the dispatcher, stray PING/ZULU frames are dropped.
pub struct InboundRouter {
    worker: String,
    monitor: MonitorHandle,
    dispatcher: Arc<dyn Dispatcher>,
}

impl InboundRouter {
    pub fn new(
        worker: impl Into<String>,
        monitor: MonitorHandle,
        dispatcher: Arc<dyn Dispatcher>,
    ) -> Self {
        Self {
            worker: worker.into(),
            monitor,
            dispatcher,
        }
    }

    pub fn worker(&self) -> &str {
        &self.worker
    }

    /// Route one received payload.
    pub fn route(&self, payload: &[u8]) {
        if let Some(bytes) = self.monitor.deliver(&self.worker, payload) {
            self.dispatcher.dispatch(&self.worker, bytes);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::TransportError;
    use crate::types::{HealthLevel, MonitorConfig};
    use std::sync::Mutex;

    #[derive(Default)]
    struct Collect {
        payloads: Mutex<Vec<(String, Bytes)>>,
    }

    impl Dispatcher for Collect {
        fn dispatch(&self, worker: &str, payload: Bytes) {
            self.payloads.lock().unwrap().push((worker.to_string(), payload));
        }
    }

    struct Silent;

    impl Transport for Silent {
        fn send(&self, _payload: &[u8]) -> std::result::Result<(), TransportError> {
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_handle_round_trip() {
        let monitor = HealthMonitor::new(MonitorConfig::default()).unwrap();
        let (handle, task) = MonitorDriver::spawn(monitor);

        assert!(!handle.start().await.unwrap());
        assert!(handle.register("drive-1", Arc::new(Silent), None).await.unwrap());
        assert!(handle.start().await.unwrap());

        let status = handle.status("drive-1").await.unwrap().unwrap();
        assert_eq!(status.level, HealthLevel::Unknown);
        assert!(handle.status("missing").await.unwrap().is_none());

        assert!(handle.unregister("drive-1").await.unwrap());
        assert!(!handle.unregister("drive-1").await.unwrap());

        handle.shutdown();
        task.await.unwrap();
        assert!(handle.is_closed());
        assert!(matches!(handle.statuses().await, Err(Error::Other(_))));
    }

    #[tokio::test]
    async fn test_router_passes_application_traffic() {
        let monitor = HealthMonitor::new(MonitorConfig::default()).unwrap();
        let (_driver, handle) = MonitorDriver::new(monitor);
        let collect = Arc::new(Collect::default());
        let router = InboundRouter::new("drive-1", handle, collect.clone());

        router.route(b"STATUS?");
        router.route(b"PING");
        router.route(b"ZULU:20240101:000000.000");
        router.route(b"pong");

        let payloads = collect.payloads.lock().unwrap();
        assert_eq!(
            *payloads,
            vec![
                ("drive-1".to_string(), Bytes::from_static(b"STATUS?")),
                ("drive-1".to_string(), Bytes::from_static(b"pong")),
            ]
        );
    }
}
