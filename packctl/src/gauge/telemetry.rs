//! Status snapshot assembly.

use super::{
    catalog::{self, df, reg, DA_CONFIG_CELL_MASK},
    types::deci_kelvin_to_celsius,
    Gauge,
};
use crate::{
    error::Result,
    hw_trait::{Delay, I2c},
    smbus::BusError,
    tracing::prelude::*,
};

type Step<I, D> = fn(&mut Gauge<I, D>) -> Result<()>;

/// Little-endian u16 at `offset` of a MAC block.
pub(super) fn le_u16(data: &[u8], offset: usize, command: u16) -> Result<u16, BusError> {
    match data.get(offset..offset + 2) {
        Some(&[lo, hi]) => Ok(u16::from_le_bytes([lo, hi])),
        _ => Err(BusError::Truncated {
            address: command,
            received: data.len(),
            needed: offset + 2,
        }),
    }
}

impl<I: I2c, D: Delay> Gauge<I, D> {
    /// Refresh the status snapshot.
    ///
    /// Reads run in a fixed order with the settle delay after each. A failed
    /// read leaves its fields at their previous values. Returns true if every
    /// read succeeded.
    pub fn refresh_status(&mut self) -> bool {
        let steps: [(&str, Step<I, D>); 8] = [
            ("current", Self::refresh_current),
            ("state of charge", Self::refresh_soc),
            ("cell count", Self::refresh_cell_count),
            ("temperatures", Self::refresh_temperatures),
            ("voltages", Self::refresh_voltages),
            ("learned capacity", Self::refresh_learned_capacity),
            ("FET state", Self::refresh_fet),
            ("protection status", Self::refresh_protection),
        ];

        let mut failed = Vec::new();
        for (name, step) in steps {
            if let Err(e) = step(self) {
                debug!("Status {} not refreshed: {}", name, e);
                failed.push(name);
            }
            self.bus.settle();
        }

        if failed.is_empty() {
            trace!("Status refreshed");
        } else {
            warn!("Status refresh incomplete, kept previous {:?}", failed);
        }
        failed.is_empty()
    }

    fn refresh_current(&mut self) -> Result<()> {
        self.status.charge_current_ma = self.bus.read_register(reg::CURRENT)?.signed();
        Ok(())
    }

    fn refresh_soc(&mut self) -> Result<()> {
        self.status.soc_percent = self.bus.read_register(reg::RELATIVE_STATE_OF_CHARGE)?.value;
        Ok(())
    }

    fn refresh_cell_count(&mut self) -> Result<()> {
        let raw = self.read_field(&df::DA_CONFIGURATION)? as u8;
        self.status.cell_count = ((raw & DA_CONFIG_CELL_MASK) + 1).min(4);
        Ok(())
    }

    // DAStatus2: internal, TS1..TS4, cell, FET; 0.1 K each.
    fn refresh_temperatures(&mut self) -> Result<()> {
        let block = catalog::DA_STATUS_2;
        let data = self.bus.read_mac_block(block.command, block.len)?;
        let mut temps = [0.0f32; 4];
        for (i, temp) in temps.iter_mut().enumerate() {
            let raw = le_u16(&data, 2 * (i + 1), block.command)? as i16;
            if i < self.status.cell_count as usize {
                *temp = deci_kelvin_to_celsius(raw);
            }
        }
        for (cell, temp) in self.status.cells.iter_mut().zip(temps) {
            cell.temperature_c = temp;
        }
        Ok(())
    }

    // DAStatus1: cell 1..4 voltages, then BAT and PACK voltages.
    fn refresh_voltages(&mut self) -> Result<()> {
        let block = catalog::DA_STATUS_1;
        let data = self.bus.read_mac_block(block.command, block.len)?;
        let mut cells = [0u16; 4];
        for (i, mv) in cells.iter_mut().enumerate() {
            *mv = le_u16(&data, 2 * i, block.command)?;
        }
        let total = le_u16(&data, 8, block.command)?;
        let pack = le_u16(&data, 10, block.command)?;

        for (cell, mv) in self.status.cells.iter_mut().zip(cells) {
            cell.voltage_mv = mv;
        }
        self.status.total_voltage_mv = total;
        self.status.pack_voltage_mv = pack;
        Ok(())
    }

    fn refresh_learned_capacity(&mut self) -> Result<()> {
        self.status.learned_capacity_mah = self.bus.read_register(reg::FULL_CHARGE_CAPACITY)?.value;
        Ok(())
    }

    fn refresh_fet(&mut self) -> Result<()> {
        self.status.fet_enabled = self.read_fet_enabled()?;
        Ok(())
    }

    fn refresh_protection(&mut self) -> Result<()> {
        let block = catalog::SAFETY_STATUS;
        let data = self.bus.read_mac_block(block.command, block.len)?;
        let bytes: [u8; 4] = data
            .get(..4)
            .and_then(|b| b.try_into().ok())
            .ok_or(BusError::Truncated {
                address: block.command,
                received: data.len(),
                needed: 4,
            })?;
        self.status.protection_status = u32::from_le_bytes(bytes);
        Ok(())
    }
}
