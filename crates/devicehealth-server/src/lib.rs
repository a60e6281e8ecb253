//! Device health server
//!
//! Runs the [`devicehealth`] monitor against devices reached over UDP.
//!
//! # Components
//!
//! - **Config**: YAML configuration with validation
//! - **UdpTransport**: one socket per device plus a receive task that
//!   routes PONGs to the monitor and everything else to the dispatcher
//! - **Reporter**: consumes health events for escalation logging and metrics
//! - **MetricsServer**: Prometheus `/metrics` and JSON `/status`

pub mod config;
pub mod http_server;
pub mod metrics;
pub mod reporter;
pub mod server;
pub mod udp;

pub use config::{Config, ConfigError};
pub use http_server::MetricsServer;
pub use metrics::MetricsRegistry;
pub use reporter::Reporter;
pub use server::{HealthServer, LoggingDispatcher};
pub use udp::{BroadcastTransport, UdpTransport};
