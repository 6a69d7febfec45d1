//! Two-wire bus transport.

use thiserror::Error;

use super::Result;

/// Transport-level bus failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum I2cError {
    /// Target did not acknowledge its address or a data byte
    #[error("no acknowledge from 0x{0:02x}")]
    Nack(u8),

    /// Clock stretching or arbitration exceeded the adapter timeout
    #[error("bus timeout")]
    Timeout,

    /// Device delivered fewer bytes than the transaction needs
    #[error("short read: expected {expected} bytes, got {actual}")]
    ShortRead { expected: usize, actual: usize },

    /// Adapter-specific non-zero completion status
    #[error("bus status {0}")]
    Status(u8),
}

/// Blocking two-wire bus with a single transaction in flight.
///
/// `addr` is always the 7-bit device address. Reads return how many bytes
/// the device actually delivered, which may be fewer than `buffer.len()`.
pub trait I2c {
    /// Write `data`, then stop.
    fn write(&mut self, addr: u8, data: &[u8]) -> Result<()>;

    /// Start, read into `buffer`, then stop.
    fn read(&mut self, addr: u8, buffer: &mut [u8]) -> Result<usize>;

    /// Write `write`, repeated start, read into `read`, then stop.
    fn write_read(&mut self, addr: u8, write: &[u8], read: &mut [u8]) -> Result<usize>;
}

impl<T: I2c + ?Sized> I2c for &mut T {
    fn write(&mut self, addr: u8, data: &[u8]) -> Result<()> {
        (**self).write(addr, data)
    }

    fn read(&mut self, addr: u8, buffer: &mut [u8]) -> Result<usize> {
        (**self).read(addr, buffer)
    }

    fn write_read(&mut self, addr: u8, write: &[u8], read: &mut [u8]) -> Result<usize> {
        (**self).write_read(addr, write, read)
    }
}
