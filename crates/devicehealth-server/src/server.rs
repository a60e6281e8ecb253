//! Main device health server implementation.

use crate::config::Config;
use crate::http_server::MetricsServer;
use crate::metrics::MetricsRegistry;
use crate::reporter::Reporter;
use crate::udp::{BroadcastTransport, UdpTransport};
use anyhow::Context;
use bytes::Bytes;
use devicehealth::{Dispatcher, HealthMonitor, InboundRouter, MonitorDriver, MonitorHandle};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{info, warn};

/// Dispatcher that logs application traffic from devices
pub struct LoggingDispatcher;

impl Dispatcher for LoggingDispatcher {
    fn dispatch(&self, worker: &str, payload: Bytes) {
        info!(
            worker = %worker,
            len = payload.len(),
            payload = %String::from_utf8_lossy(&payload),
            "Application message from device"
        );
    }
}

/// Device health server
pub struct HealthServer {
    config: Config,
}

impl HealthServer {
    /// Create a new device health server
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    /// Run the server until Ctrl-C
    pub async fn run(self) -> anyhow::Result<()> {
        info!(devices = self.config.devices.len(), "Starting device health server");

        let mut monitor =
            HealthMonitor::with_event_capacity(self.config.monitor.clone(), self.config.channels.events)?;

        if self.config.time_sync.enabled {
            let target = BroadcastTransport::limited(self.config.time_sync.broadcast_port);
            let transport = BroadcastTransport::bind(target)
                .await
                .context("failed to bind broadcast socket")?;
            monitor.set_broadcast_transport(Arc::new(transport));
        }

        // Create metrics registry (optional)
        let metrics = if self.config.metrics.enabled {
            info!("Metrics enabled on {}", self.config.metrics.listen_addr);
            Some(Arc::new(MetricsRegistry::new()))
        } else {
            info!("Metrics disabled");
            None
        };

        let reporter = Reporter::new(monitor.subscribe(), metrics.clone());
        let (handle, mut monitor_task) = MonitorDriver::spawn(monitor);
        let mut tasks = vec![tokio::spawn(reporter.run())];

        let dispatcher: Arc<dyn Dispatcher> = Arc::new(LoggingDispatcher);
        let mut registered = 0;
        for device in &self.config.devices {
            let peer = device
                .resolve()
                .await
                .with_context(|| format!("failed to resolve device {}", device.name))?;
            let transport = UdpTransport::bind(peer)
                .await
                .with_context(|| format!("failed to bind socket for device {}", device.name))?;
            tasks.push(transport.spawn_receiver(InboundRouter::new(
                device.name.clone(),
                handle.clone(),
                dispatcher.clone(),
            )));

            if handle
                .register(device.name.clone(), Arc::new(transport), device.metrics.clone())
                .await?
            {
                registered += 1;
                info!(worker = %device.name, peer = %peer, "Device registered");
            }
        }
        if let Some(ref m) = metrics {
            m.set_workers_active(registered);
        }

        if !handle.start().await? {
            warn!("Health monitoring not started");
        }

        // Spawn HTTP metrics server (if enabled)
        if let Some(ref registry) = metrics {
            let server = MetricsServer::new(
                registry.clone(),
                handle.clone(),
                self.config.metrics.listen_addr.clone(),
            );
            tasks.push(tokio::spawn(async move {
                if let Err(e) = server.run().await {
                    warn!(error = %e, "Metrics server error");
                }
            }));
        }

        if self.config.time_sync.enabled {
            tasks.push(spawn_time_sync(
                handle.clone(),
                self.config.time_sync.broadcast_interval,
            ));
        }

        info!("All tasks spawned, server running");

        let monitor_exited = tokio::select! {
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    warn!(error = %e, "Failed to listen for shutdown signal");
                }
                info!("Shutdown signal received");
                false
            }
            _ = &mut monitor_task => {
                warn!("Health monitor task exited unexpectedly");
                true
            }
        };

        if !monitor_exited {
            let _ = handle.stop();
            let _ = handle.unregister_all();
            handle.shutdown();
            let _ = monitor_task.await;
        }
        for task in tasks {
            task.abort();
        }

        info!("Device health server stopped");
        Ok(())
    }
}

/// Broadcast a time sync every `every`, first one after a full interval
fn spawn_time_sync(handle: MonitorHandle, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(every);
        ticker.tick().await; // Skip first immediate tick

        loop {
            ticker.tick().await;
            if let Err(e) = handle.broadcast_time_sync().await {
                if handle.is_closed() {
                    break;
                }
                warn!(error = %e, "Time sync broadcast failed");
            }
        }
    })
}
