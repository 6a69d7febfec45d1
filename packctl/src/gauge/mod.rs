//! Fuel gauge driver: configuration and telemetry.
//!
//! [`Gauge`] owns the bus and the controller's view of the pack: the last
//! applied or synced profiles and the latest status snapshot. All device
//! traffic goes through [`Bus`].
//!
//! Dataflash writes are verified by reading them back. A failed field is
//! recorded in the [`ApplyReport`] and the batch carries on with the next
//! field; the report's [`ApplyReport::ok`] is the AND over every field.

pub mod catalog;
mod config;
mod telemetry;
pub mod types;

use std::fmt;

use crate::{
    error::Error,
    hw_trait::{Delay, I2c},
    smbus::Bus,
    tracing::prelude::*,
};
use catalog::DataflashField;

pub use types::{
    cell_count_bits, AdvancedProfile, BatteryProfile, BatteryStatus, CedvCurve, CellStatus,
    Chemistry, TemperatureWindow,
};

/// Value written to a field, for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue {
    Number(i32),
    Text(String),
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Number(n) => write!(f, "{}", n),
            FieldValue::Text(s) => write!(f, "{:?}", s),
        }
    }
}

/// Outcome of one verified write.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldReport {
    pub name: &'static str,
    pub address: u16,
    pub value: FieldValue,
    pub outcome: Result<(), Error>,
}

impl FieldReport {
    pub fn is_ok(&self) -> bool {
        self.outcome.is_ok()
    }
}

/// Per-field results of a configuration batch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ApplyReport {
    pub fields: Vec<FieldReport>,
}

impl ApplyReport {
    /// True when every field verified.
    pub fn ok(&self) -> bool {
        self.fields.iter().all(FieldReport::is_ok)
    }

    /// Number of fields that verified.
    pub fn verified(&self) -> usize {
        self.fields.iter().filter(|f| f.is_ok()).count()
    }

    pub fn failures(&self) -> impl Iterator<Item = &FieldReport> {
        self.fields.iter().filter(|f| !f.is_ok())
    }

    pub fn push(&mut self, report: FieldReport) {
        self.fields.push(report);
    }

    pub fn extend(&mut self, other: ApplyReport) {
        self.fields.extend(other.fields);
    }
}

/// The gauge and the controller's view of it.
pub struct Gauge<I, D> {
    bus: Bus<I, D>,
    profile: BatteryProfile,
    advanced: AdvancedProfile,
    status: BatteryStatus,
}

impl<I: I2c, D: Delay> Gauge<I, D> {
    /// Start from firmware defaults; nothing is read from or written to the
    /// device until asked.
    pub fn new(bus: Bus<I, D>) -> Self {
        Self {
            bus,
            profile: BatteryProfile::default(),
            advanced: AdvancedProfile::default(),
            status: BatteryStatus::default(),
        }
    }

    pub fn bus(&self) -> &Bus<I, D> {
        &self.bus
    }

    pub fn bus_mut(&mut self) -> &mut Bus<I, D> {
        &mut self.bus
    }

    pub fn profile(&self) -> &BatteryProfile {
        &self.profile
    }

    pub fn advanced(&self) -> &AdvancedProfile {
        &self.advanced
    }

    pub fn status(&self) -> &BatteryStatus {
        &self.status
    }

    /// Record the state of the external emergency-shutdown line.
    pub fn set_emergency_shutdown(&mut self, active: bool) {
        if active != self.status.emergency_shutdown {
            warn!(active, "Emergency shutdown state changed");
        }
        self.status.emergency_shutdown = active;
    }

    /// Write every `(field, value)` pair with read-back verification,
    /// continuing past failures.
    pub fn write_verified_batch(&mut self, writes: &[(DataflashField, i32)]) -> ApplyReport {
        let mut report = ApplyReport::default();
        for &(field, value) in writes {
            report.push(self.write_verified(&field, value));
        }
        report
    }

    /// Write a numeric field, settle, read it back and compare.
    pub fn write_verified(&mut self, field: &DataflashField, value: i32) -> FieldReport {
        let outcome = self.try_write_verified(field, value);
        Self::log_outcome(field, &FieldValue::Number(value), &outcome);
        FieldReport {
            name: field.name,
            address: field.address,
            value: FieldValue::Number(value),
            outcome,
        }
    }

    fn try_write_verified(&mut self, field: &DataflashField, value: i32) -> Result<(), Error> {
        let payload = field.encode(value).ok_or_else(|| {
            Error::validation(format!(
                "{} cannot hold {} in {} byte(s)",
                field.name, value, field.width
            ))
        })?;
        self.bus.write_dataflash(field.address, &payload)?;
        let block = self
            .bus
            .read_dataflash(field.address, field.width, field.kind)?;
        let read = field.decode(&block.data);
        if read != Some(value) {
            return Err(Error::Verification {
                field: field.name,
                written: value.to_string(),
                read: read.map_or_else(|| format!("{:02x?}", block.data), |r| r.to_string()),
            });
        }
        Ok(())
    }

    /// Write a length-prefixed string field and verify it.
    pub fn write_verified_text(&mut self, field: &DataflashField, text: &str) -> FieldReport {
        let outcome = self.try_write_verified_text(field, text);
        let value = FieldValue::Text(text.to_string());
        Self::log_outcome(field, &value, &outcome);
        FieldReport {
            name: field.name,
            address: field.address,
            value,
            outcome,
        }
    }

    fn try_write_verified_text(&mut self, field: &DataflashField, text: &str) -> Result<(), Error> {
        if !text.is_ascii() || text.len() + 1 > field.width {
            return Err(Error::validation(format!(
                "{} cannot hold {:?}",
                field.name, text
            )));
        }
        let mut payload = vec![0u8; field.width];
        payload[0] = text.len() as u8;
        payload[1..=text.len()].copy_from_slice(text.as_bytes());

        self.bus.write_dataflash(field.address, &payload)?;
        let block = self
            .bus
            .read_dataflash(field.address, field.width, field.kind)?;
        let read = block.text();
        if read != text {
            return Err(Error::Verification {
                field: field.name,
                written: text.to_string(),
                read,
            });
        }
        Ok(())
    }

    /// Read-modify-write the bits in `mask` of a one-byte field so they equal
    /// `bits`, then re-read and compare under the mask.
    pub fn update_bits(&mut self, field: &DataflashField, mask: u8, bits: u8) -> FieldReport {
        let bits = bits & mask;
        let mut written = None;
        let outcome = self
            .read_field(field)
            .and_then(|current| {
                let value = (current as u8 & !mask) | bits;
                written = Some(value);
                self.bus.write_dataflash(field.address, &[value])?;
                self.read_field(field)
            })
            .and_then(|read| {
                if read as u8 & mask == bits {
                    Ok(())
                } else {
                    Err(Error::Verification {
                        field: field.name,
                        written: format!("0x{:02x} under mask 0x{:02x}", bits, mask),
                        read: format!("0x{:02x}", read),
                    })
                }
            });
        let value = FieldValue::Number(written.map_or(-1, i32::from));
        Self::log_outcome(field, &value, &outcome);
        FieldReport {
            name: field.name,
            address: field.address,
            value,
            outcome,
        }
    }

    /// Read and decode a numeric field.
    pub fn read_field(&mut self, field: &DataflashField) -> Result<i32, Error> {
        let block = self
            .bus
            .read_dataflash(field.address, field.width, field.kind)?;
        field.decode(&block.data).ok_or_else(|| {
            Error::validation(format!("{} returned {} byte(s)", field.name, block.data.len()))
        })
    }

    fn log_outcome(field: &DataflashField, value: &FieldValue, outcome: &Result<(), Error>) {
        match outcome {
            Ok(()) => trace!("{} = {} verified", field.name, value),
            Err(e) => warn!("{} (0x{:04x}) = {} failed: {}", field.name, field.address, value, e),
        }
    }
}
