//! Seams to the surrounding application: the datagram transport a worker is
//! reached over, and the command layer that receives non-health traffic.

use bytes::Bytes;
use thiserror::Error;

/// Transport failure.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport is not connected")]
    NotConnected,

    #[error("transport does not support broadcast")]
    BroadcastUnsupported,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<TransportError> for common::Error {
    fn from(err: TransportError) -> Self {
        common::Error::transport(err)
    }
}

/// Outbound half of a worker's datagram channel.
///
/// Implementations must not block: the monitor calls `send` from its
/// scheduling loop.
#[cfg_attr(test, mockall::automock)]
pub trait Transport: Send + Sync {
    /// Send one payload to the worker.
    fn send(&self, payload: &[u8]) -> Result<(), TransportError>;

    /// Send one payload to every worker reachable on this transport's network.
    fn broadcast(&self, _payload: &[u8]) -> Result<(), TransportError> {
        Err(TransportError::BroadcastUnsupported)
    }
}

/// Receiver for application traffic that is not a health frame.
pub trait Dispatcher: Send + Sync {
    /// Handle a payload from `worker`, exactly as received.
    fn dispatch(&self, worker: &str, payload: Bytes);
}
