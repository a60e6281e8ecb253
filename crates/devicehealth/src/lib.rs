//! Round-robin PING/PONG health monitoring for networked devices.
//!
//! A controller registers each worker together with the datagram transport
//! it is reached over. The monitor then pings one worker per scheduler tick,
//! correlates PONG replies, and classifies every worker into a
//! [`HealthLevel`]:
//!
//! - FATAL when N of the last M checks failed
//! - CRITICAL when the most recent check failed
//! - WARNING on a transit-time anomaly or repeated slow responses
//! - HEALTHY otherwise, UNKNOWN before the first check
//!
//! Level transitions are published as [`HealthEvent`]s. Health frames share
//! the channel with application traffic; [`InboundRouter`] splits the two.
//!
//! # Example
//!
//! ```no_run
//! use devicehealth::{HealthMonitor, MonitorConfig, MonitorDriver, Transport, TransportError};
//! use std::sync::Arc;
//!
//! struct Loopback;
//!
//! impl Transport for Loopback {
//!     fn send(&self, _payload: &[u8]) -> Result<(), TransportError> {
//!         Ok(())
//!     }
//! }
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let monitor = HealthMonitor::new(MonitorConfig::default())?;
//! let (handle, _task) = MonitorDriver::spawn(monitor);
//! let mut events = handle.subscribe();
//!
//! handle.register("drive-1", Arc::new(Loopback), None).await?;
//! handle.start().await?;
//!
//! while let Ok(event) = events.recv().await {
//!     println!("{:?}", event);
//! }
//! # Ok(())
//! # }
//! ```

pub mod codec;
pub mod driver;
pub mod monitor;
pub mod status;
pub mod transport;
pub mod types;
pub mod window;

pub use codec::{Frame, TrackingKey};
pub use driver::{InboundRouter, MonitorDriver, MonitorHandle};
pub use monitor::{HealthMonitor, Watchdog};
pub use status::{HealthStatus, Thresholds};
pub use transport::{Dispatcher, Transport, TransportError};
pub use types::{HealthEvent, HealthLevel, MonitorConfig, StatusSnapshot};
pub use window::SlidingWindow;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_summary() {
        let status = HealthStatus::new("drive-1", Thresholds::default());
        assert_eq!(status.snapshot().summary(), "UNKNOWN: no data");
    }

    #[test]
    fn test_reexports_classify_frames() {
        assert_eq!(Frame::decode(b"PONG"), Frame::Pong(TrackingKey::Bare));
        assert!(Frame::decode(b"PONG").is_health_frame());
        assert!(!Frame::decode(b"HELLO").is_health_frame());
    }
}
