//! Configuration and telemetry controller for SMBus battery fuel gauges.
//!
//! The [`smbus`] layer frames word, manufacturer-access and dataflash
//! transactions with PEC and echo checking. [`gauge`] turns battery
//! profiles into verified dataflash writes and assembles status snapshots.
//! [`api`] exposes both as JSON commands behind a scoped lock.

pub mod api;
pub mod config;
pub mod error;
pub mod gauge;
pub mod hw_trait;
pub mod sim;
pub mod smbus;
pub mod tracing;
