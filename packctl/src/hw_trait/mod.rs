//! Hardware abstraction traits.
//!
//! The gauge driver talks to the outside world only through the traits in
//! this module, so the same code runs against a real bus adapter, the
//! simulated gauge in [`crate::sim`], or a test double.

pub mod delay;
pub mod i2c;

use thiserror::Error;

pub use delay::{Delay, NoDelay, StdDelay};
pub use i2c::{I2c, I2cError};

/// Errors raised by hardware implementations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HwError {
    /// Two-wire bus failure
    #[error("I2C error: {0}")]
    I2c(#[from] I2cError),

    /// Caller passed something the hardware cannot do
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),
}

/// Result type for hardware operations.
pub type Result<T> = std::result::Result<T, HwError>;
