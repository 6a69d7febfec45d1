//! Error types for packctl.

use thiserror::Error;

use crate::smbus::BusError;

/// Gauge-level errors.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    /// A bus transaction failed (transport, PEC or protocol)
    #[error("bus: {0}")]
    Bus(#[from] BusError),

    /// Request rejected before anything was written to the device
    #[error("validation: {0}")]
    Validation(String),

    /// Device read back something other than what was written
    #[error("verification of {field} failed: wrote {written}, read back {read}")]
    Verification {
        field: &'static str,
        written: String,
        read: String,
    },

    /// Bad configuration value
    #[error("configuration: {0}")]
    Config(String),
}

impl Error {
    pub fn validation(msg: impl Into<String>) -> Self {
        Error::Validation(msg.into())
    }
}

/// Convenient Result type for gauge operations.
pub type Result<T, E = Error> = std::result::Result<T, E>;
