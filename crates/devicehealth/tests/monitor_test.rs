//! Integration tests for the health monitor driver
//!
//! Time is paused so round-robin cycles and PONG timeouts run on the
//! virtual clock.

use bytes::Bytes;
use devicehealth::{
    Dispatcher, Frame, HealthEvent, HealthLevel, HealthMonitor, InboundRouter, MonitorConfig,
    MonitorDriver, MonitorHandle, TrackingKey, Transport, TransportError,
};
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};

/// Transport that records every payload and optionally forwards it to a
/// simulated device task
#[derive(Default)]
struct Device {
    sent: Mutex<Vec<Bytes>>,
    wire: Option<mpsc::UnboundedSender<Bytes>>,
}

impl Device {
    fn pings(&self) -> Vec<TrackingKey> {
        self.frames()
            .into_iter()
            .filter_map(|frame| match frame {
                Frame::Ping(key) => Some(key),
                _ => None,
            })
            .collect()
    }

    fn time_syncs(&self) -> usize {
        self.frames()
            .iter()
            .filter(|frame| matches!(frame, Frame::TimeSync(_)))
            .count()
    }

    fn frames(&self) -> Vec<Frame> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .map(|payload| Frame::decode(payload))
            .collect()
    }
}

impl Transport for Device {
    fn send(&self, payload: &[u8]) -> Result<(), TransportError> {
        let payload = Bytes::copy_from_slice(payload);
        self.sent.lock().unwrap().push(payload.clone());
        if let Some(wire) = &self.wire {
            wire.send(payload).map_err(|_| TransportError::NotConnected)?;
        }
        Ok(())
    }
}

struct Discard;

impl Dispatcher for Discard {
    fn dispatch(&self, _worker: &str, _payload: Bytes) {}
}

/// Helper to spawn a device that answers PINGs while `responding` is set
fn echo_device(name: &str, handle: &MonitorHandle, responding: Arc<AtomicBool>) -> Arc<Device> {
    let (tx, mut rx) = mpsc::unbounded_channel::<Bytes>();
    let router = InboundRouter::new(name, handle.clone(), Arc::new(Discard));
    tokio::spawn(async move {
        while let Some(payload) = rx.recv().await {
            if let Frame::Ping(key) = Frame::decode(&payload) {
                if responding.load(Ordering::SeqCst) {
                    router.route(&Frame::Pong(key).encode());
                }
            }
        }
    });
    Arc::new(Device {
        sent: Mutex::new(Vec::new()),
        wire: Some(tx),
    })
}

fn spawn_monitor() -> MonitorHandle {
    let monitor = HealthMonitor::new(MonitorConfig::default()).unwrap();
    let (handle, _task) = MonitorDriver::spawn(monitor);
    handle
}

fn drain(events: &mut broadcast::Receiver<HealthEvent>) -> Vec<HealthEvent> {
    let mut drained = Vec::new();
    while let Ok(event) = events.try_recv() {
        drained.push(event);
    }
    drained
}

async fn sleep_ms(ms: u64) {
    tokio::time::sleep(Duration::from_millis(ms)).await;
}

#[tokio::test(start_paused = true)]
async fn test_one_ping_per_worker_per_cycle() {
    let handle = spawn_monitor();
    let devices: Vec<Arc<Device>> = (0..3).map(|_| Arc::new(Device::default())).collect();
    for (i, device) in devices.iter().enumerate() {
        handle
            .register(format!("drive-{}", i), device.clone(), None)
            .await
            .unwrap();
    }
    assert!(handle.start().await.unwrap());

    sleep_ms(9_990).await;
    for device in &devices {
        assert_eq!(device.pings().len(), 1);
    }

    sleep_ms(10_000).await;
    for device in &devices {
        assert_eq!(device.pings().len(), 2);
    }

    handle.shutdown();
}

#[tokio::test(start_paused = true)]
async fn test_responsive_worker_is_healthy() {
    let handle = spawn_monitor();
    let mut events = handle.subscribe();
    let device = echo_device("drive-1", &handle, Arc::new(AtomicBool::new(true)));
    handle.register("drive-1", device.clone(), None).await.unwrap();
    handle.start().await.unwrap();

    sleep_ms(100).await;
    let status = handle.status("drive-1").await.unwrap().unwrap();
    assert_eq!(status.level, HealthLevel::Healthy);
    assert_eq!(status.consecutive_failures, 0);
    assert_eq!(status.checks_in_window, 1);

    // First contact: timestamped PING answered, then a time sync
    let pings = device.pings();
    assert_eq!(pings.len(), 1);
    assert!(pings[0].is_timestamped());
    assert_eq!(device.time_syncs(), 1);

    sleep_ms(10_000).await;
    let pings = device.pings();
    assert_eq!(pings.len(), 2);
    assert_eq!(pings[1], TrackingKey::Bare);
    assert_eq!(device.time_syncs(), 1);

    let alerts: Vec<_> = drain(&mut events)
        .into_iter()
        .filter(|e| {
            matches!(
                e,
                HealthEvent::Critical { .. } | HealthEvent::Fatal { .. } | HealthEvent::Warning { .. }
            )
        })
        .collect();
    assert!(alerts.is_empty(), "unexpected alerts: {:?}", alerts);

    handle.shutdown();
}

#[tokio::test(start_paused = true)]
async fn test_silent_worker_escalates_once_per_level() {
    let handle = spawn_monitor();
    let mut events = handle.subscribe();
    let device = Arc::new(Device::default());
    handle.register("drive-1", device.clone(), None).await.unwrap();
    handle.start().await.unwrap();

    sleep_ms(1_500).await;
    let status = handle.status("drive-1").await.unwrap().unwrap();
    assert_eq!(status.level, HealthLevel::Critical);
    assert_eq!(status.last_error.as_deref(), Some("No PONG within 1.0s"));

    // Timeouts at 1s, 11s, 21s and 31s
    sleep_ms(30_000).await;
    let status = handle.status("drive-1").await.unwrap().unwrap();
    assert_eq!(status.level, HealthLevel::Fatal);
    assert_eq!(status.consecutive_failures, 4);

    let events = drain(&mut events);
    let count = |pred: fn(&HealthEvent) -> bool| events.iter().filter(|e| pred(e)).count();
    assert_eq!(count(|e| matches!(e, HealthEvent::Critical { .. })), 1);
    assert_eq!(count(|e| matches!(e, HealthEvent::Fatal { .. })), 1);
    assert_eq!(count(|e| matches!(e, HealthEvent::Escalate { .. })), 2);
    assert_eq!(count(|e| matches!(e, HealthEvent::StatusUpdated { .. })), 4);

    handle.shutdown();
}

#[tokio::test(start_paused = true)]
async fn test_recovery_resends_timestamped_ping() {
    let handle = spawn_monitor();
    let mut events = handle.subscribe();
    let responding = Arc::new(AtomicBool::new(false));
    let device = echo_device("drive-1", &handle, responding.clone());
    handle.register("drive-1", device.clone(), None).await.unwrap();
    handle.start().await.unwrap();

    sleep_ms(1_500).await;
    assert_eq!(
        handle.status("drive-1").await.unwrap().unwrap().level,
        HealthLevel::Critical
    );

    responding.store(true, Ordering::SeqCst);
    sleep_ms(10_000).await;
    assert_eq!(
        handle.status("drive-1").await.unwrap().unwrap().level,
        HealthLevel::Healthy
    );
    assert!(drain(&mut events).iter().any(|e| matches!(
        e,
        HealthEvent::Recovered {
            from: HealthLevel::Critical,
            ..
        }
    )));
    assert_eq!(device.time_syncs(), 1);

    sleep_ms(20_000).await;
    let stamped: Vec<bool> = device.pings().iter().map(TrackingKey::is_timestamped).collect();
    assert_eq!(stamped, vec![true, false, true, false]);

    handle.shutdown();
}

#[tokio::test(start_paused = true)]
async fn test_manual_check_without_start() {
    let handle = spawn_monitor();
    let a = Arc::new(Device::default());
    let b = Arc::new(Device::default());
    handle.register("a", a.clone(), None).await.unwrap();
    handle.register("b", b.clone(), None).await.unwrap();

    handle.trigger_manual_check(None).await.unwrap();
    assert_eq!(a.pings().len(), 1);
    assert_eq!(b.pings().len(), 1);

    handle.trigger_manual_check(Some("b".to_string())).await.unwrap();
    assert_eq!(a.pings().len(), 1);
    assert_eq!(b.pings().len(), 2);

    let missing = handle.trigger_manual_check(Some("c".to_string())).await;
    assert!(matches!(missing, Err(common::Error::UnknownWorker(_))));

    handle.shutdown();
}

#[tokio::test(start_paused = true)]
async fn test_unregister_with_ping_in_flight() {
    let handle = spawn_monitor();
    let mut events = handle.subscribe();
    let device = Arc::new(Device::default());
    handle.register("drive-1", device.clone(), None).await.unwrap();
    handle.start().await.unwrap();

    sleep_ms(500).await;
    assert_eq!(device.pings().len(), 1);
    assert!(handle.unregister("drive-1").await.unwrap());
    assert!(!handle.unregister("drive-1").await.unwrap());

    sleep_ms(2_000).await;
    assert!(handle.status("drive-1").await.unwrap().is_none());
    assert!(
        drain(&mut events)
            .iter()
            .all(|e| e.worker() != Some("drive-1"))
    );

    handle.shutdown();
}

#[tokio::test(start_paused = true)]
async fn test_stop_is_idempotent_and_restartable() {
    let handle = spawn_monitor();
    let device = Arc::new(Device::default());
    handle.register("drive-1", device.clone(), None).await.unwrap();
    handle.start().await.unwrap();
    sleep_ms(100).await;

    handle.stop().unwrap();
    handle.stop().unwrap();
    sleep_ms(30_000).await;
    assert_eq!(device.pings().len(), 1);

    // The outstanding PING's watchdog was cancelled
    let status = handle.status("drive-1").await.unwrap().unwrap();
    assert_eq!(status.level, HealthLevel::Unknown);

    assert!(handle.start().await.unwrap());
    sleep_ms(100).await;
    assert_eq!(device.pings().len(), 2);

    handle.shutdown();
}

#[tokio::test(start_paused = true)]
async fn test_disabled_monitor_ignores_workers() {
    let config = MonitorConfig {
        enabled: false,
        ..Default::default()
    };
    let (handle, task) = MonitorDriver::spawn(HealthMonitor::new(config).unwrap());
    let device = Arc::new(Device::default());

    assert!(!handle.register("drive-1", device.clone(), None).await.unwrap());
    assert!(!handle.start().await.unwrap());
    assert!(handle.statuses().await.unwrap().is_empty());

    handle.shutdown();
    task.await.unwrap();
    assert!(device.pings().is_empty());
}
