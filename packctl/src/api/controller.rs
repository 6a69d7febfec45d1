//! Command dispatch under the gauge lock.

use std::{
    cell::{RefCell, RefMut},
    time::Duration,
};

use parking_lot::{ReentrantMutex, ReentrantMutexGuard};
use thiserror::Error;

use super::{
    commands::{
        Ack, AdvanceMessage, Command, ErrorResponse, ProfileMessage, Response, StatusResponse,
        SyncResponse, MAX_SYNC_TIMES,
    },
    ControllerConfig,
};
use crate::{
    error::Error,
    gauge::{AdvancedProfile, Gauge},
    hw_trait::{Delay, I2c},
    tracing::prelude::*,
};

/// Why a command produced no result.
#[derive(Error, Debug)]
pub enum CommandError {
    #[error("malformed command: {0}")]
    Parse(#[from] serde_json::Error),

    #[error(transparent)]
    Gauge(#[from] Error),

    #[error("gauge busy, lock not acquired within {0:?}")]
    LockTimeout(Duration),

    #[error("gauge already borrowed by this command")]
    Reentered,
}

/// Serializes commands and periodic refreshes against one gauge.
///
/// The lock is reentrant so a command handler may call back into the
/// controller on the same thread.
pub struct Controller<I, D> {
    gauge: ReentrantMutex<RefCell<Gauge<I, D>>>,
    config: ControllerConfig,
}

/// Exclusive access to the gauge for the duration of one command.
pub struct CommandGuard<'a, I, D> {
    guard: ReentrantMutexGuard<'a, RefCell<Gauge<I, D>>>,
}

impl<I, D> CommandGuard<'_, I, D> {
    pub fn gauge(&self) -> Result<RefMut<'_, Gauge<I, D>>, CommandError> {
        self.guard
            .try_borrow_mut()
            .map_err(|_| CommandError::Reentered)
    }
}

impl<I: I2c, D: Delay> Controller<I, D> {
    pub fn new(gauge: Gauge<I, D>, config: ControllerConfig) -> Self {
        Self {
            gauge: ReentrantMutex::new(RefCell::new(gauge)),
            config,
        }
    }

    /// Take the gauge, waiting at most the configured lock timeout.
    pub fn lock(&self) -> Result<CommandGuard<'_, I, D>, CommandError> {
        let timeout = self.config.lock_timeout;
        match self.gauge.try_lock_for(timeout) {
            Some(guard) => Ok(CommandGuard { guard }),
            None => {
                warn!("Command rejected, gauge lock held for over {:?}", timeout);
                Err(CommandError::LockTimeout(timeout))
            }
        }
    }

    /// Run one command.
    pub fn handle(&self, command: &Command) -> Result<Vec<Response>, CommandError> {
        debug!(cmd = command.name(), "Handling command");
        let cmd = command.name().to_string();

        // Rejected before the bus is touched
        if let Command::Sync { times } = *command {
            if !(1..=MAX_SYNC_TIMES).contains(&times) {
                return Err(Error::validation(format!(
                    "sync times {} outside 1..={}",
                    times, MAX_SYNC_TIMES
                ))
                .into());
            }
        }

        let guard = self.lock()?;
        let mut gauge = guard.gauge()?;

        let response = match command {
            Command::Config(msg) => {
                let profile = msg.to_profile()?;
                let report = gauge.apply(&profile)?;
                vec![Response::Ack(Ack {
                    cmd,
                    ok: report.ok(),
                })]
            }
            Command::Advance(msg) => {
                let report = gauge.apply_advanced(&AdvancedProfile::from(msg));
                vec![Response::Ack(Ack {
                    cmd,
                    ok: report.ok(),
                })]
            }
            Command::Switch { fet_enable } => {
                gauge.set_fet_enabled(*fet_enable)?;
                vec![Response::Ack(Ack { cmd, ok: true })]
            }
            Command::Reset => {
                gauge.reset_gauge()?;
                vec![Response::Ack(Ack { cmd, ok: true })]
            }
            Command::Sync { times } => {
                let config = ProfileMessage::from(&gauge.read_basic_config()?);
                let advance = AdvanceMessage::from(&gauge.read_advanced_config()?);
                let sync = SyncResponse {
                    cmd,
                    config,
                    advance,
                };
                (0..*times).map(|_| Response::Sync(sync.clone())).collect()
            }
            Command::Status => vec![Response::Status(StatusResponse::new(&cmd, gauge.status()))],
            Command::Renew => {
                gauge.refresh_status();
                vec![Response::Status(StatusResponse::new(&cmd, gauge.status()))]
            }
        };
        Ok(response)
    }

    /// Parse and run one JSON line, returning the JSON reply lines.
    ///
    /// Failures come back as a single error reply; nothing here aborts.
    pub fn handle_line(&self, line: &str) -> Vec<String> {
        let (name, result) = match serde_json::from_str::<Command>(line) {
            Ok(command) => (command.name().to_string(), self.handle(&command)),
            Err(e) => (request_name(line), Err(e.into())),
        };
        let responses = result.unwrap_or_else(|e| {
            warn!(cmd = %name, "Command failed: {}", e);
            vec![Response::Error(ErrorResponse::new(&name, &e))]
        });
        responses.iter().filter_map(to_json).collect()
    }

    /// Periodic telemetry refresh.
    pub fn poll(&self) -> Result<bool, CommandError> {
        let guard = self.lock()?;
        let ok = guard.gauge()?.refresh_status();
        Ok(ok)
    }

    /// Record the emergency-shutdown input.
    pub fn set_emergency_shutdown(&self, active: bool) -> Result<(), CommandError> {
        let guard = self.lock()?;
        guard.gauge()?.set_emergency_shutdown(active);
        Ok(())
    }
}

/// Best-effort `cmd` of a request that failed to parse.
fn request_name(line: &str) -> String {
    serde_json::from_str::<serde_json::Value>(line)
        .ok()
        .and_then(|v| v.get("cmd").and_then(|c| c.as_str()).map(str::to_string))
        .unwrap_or_else(|| "unknown".to_string())
}

fn to_json(response: &Response) -> Option<String> {
    serde_json::to_string(response)
        .inspect_err(|e| error!("Response not serializable: {}", e))
        .ok()
}
