//! Common utilities and types shared across the device health components.

pub mod error;
pub mod logging;

pub use error::{Error, Result};
