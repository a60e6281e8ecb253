//! Common error types for the device health components.

use std::fmt;

/// A specialized Result type for device health operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for device health operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Unknown worker: {0}")]
    UnknownWorker(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Unknown error: {0}")]
    Other(String),
}

impl Error {
    /// Create a new transport error.
    pub fn transport(msg: impl fmt::Display) -> Self {
        Error::Transport(msg.to_string())
    }

    /// Create a new unknown-worker error.
    pub fn unknown_worker(name: impl fmt::Display) -> Self {
        Error::UnknownWorker(name.to_string())
    }

    /// Create a new configuration error.
    pub fn config(msg: impl fmt::Display) -> Self {
        Error::Config(msg.to_string())
    }

    /// Create a new other error.
    pub fn other(msg: impl fmt::Display) -> Self {
        Error::Other(msg.to_string())
    }
}
