//! Command surface.
//!
//! JSON requests in, JSON replies out. [`Controller`] owns the gauge and
//! runs each command, and each periodic refresh, under one lock so a
//! multi-step apply never interleaves with telemetry on the bus.

pub mod commands;
mod controller;

use std::time::Duration;

use crate::{config, error::Result};

pub use commands::{Command, Response};
pub use controller::{CommandError, CommandGuard, Controller};

/// Controller settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControllerConfig {
    /// Longest a command waits for the gauge before it is rejected
    pub lock_timeout: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            lock_timeout: Duration::from_millis(1000),
        }
    }
}

impl ControllerConfig {
    /// Defaults overridden by `PACKCTL_LOCK_TIMEOUT_MS`.
    pub fn from_env() -> Result<Self> {
        let mut controller = Self::default();
        if let Some(ms) = config::env_parse::<u64>("PACKCTL_LOCK_TIMEOUT_MS")? {
            controller.lock_timeout = Duration::from_millis(ms);
        }
        Ok(controller)
    }
}
