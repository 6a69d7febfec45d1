//! Simulated gauge for development and testing.
//!
//! Speaks the word register, MAC block and dataflash sub-protocols over the
//! [`I2c`] trait, backed by in-memory state. Dataflash is a flat byte space,
//! so whatever is written reads back unless a fault is injected. Starts out
//! as a healthy, idle four-cell LiFePO4 pack at room temperature.

use std::collections::{BTreeMap, HashMap, HashSet};

use crate::{
    gauge::catalog::{self, df, mac, reg},
    hw_trait::{self, HwError, I2c, I2cError},
    smbus::{pec, BLOCK_ACCESS, DEVICE_ADDRESS, MAX_BLOCK_LEN},
    tracing::prelude::*,
};

/// Room temperature in 0.1 K.
const ROOM_TEMP_DECI_K: u16 = 2981;

/// In-memory gauge.
pub struct SimulatedGauge {
    /// 7-bit address the device answers on
    address: u8,

    /// SBS word registers
    words: HashMap<u8, u16>,

    /// Dataflash contents; unwritten bytes read as zero
    dataflash: BTreeMap<u16, u8>,

    /// Readable MAC blocks by command
    mac_blocks: HashMap<u16, Vec<u8>>,

    /// Register selected by the last single-byte write
    selected_register: Option<u8>,

    /// MAC command or dataflash address selected by the last MAC write
    selected_block: Option<u16>,

    /// Dataflash write frames received, failed ones included
    dataflash_writes: usize,

    /// 1-based index of a dataflash write to NACK
    fail_write: Option<usize>,

    /// Dataflash addresses that acknowledge writes but keep their contents
    frozen: HashSet<u16>,

    /// Blocks answered with a wrong address echo
    corrupt_echo: HashSet<u16>,

    /// Blocks answered with a wrong PEC
    corrupt_pec: HashSet<u16>,

    /// MAC commands carried out once, then NACKed as if the ack was lost
    lost_ack: HashSet<u16>,

    /// Word reads left to fail with a clock-stretch timeout
    stalled_reads: usize,

    fet_toggles: u32,
    resets: u32,
}

impl SimulatedGauge {
    pub fn new() -> Self {
        let mut sim = Self {
            address: DEVICE_ADDRESS,
            words: HashMap::new(),
            dataflash: BTreeMap::new(),
            mac_blocks: HashMap::new(),
            selected_register: None,
            selected_block: None,
            dataflash_writes: 0,
            fail_write: None,
            frozen: HashSet::new(),
            corrupt_echo: HashSet::new(),
            corrupt_pec: HashSet::new(),
            lost_ack: HashSet::new(),
            stalled_reads: 0,
            fet_toggles: 0,
            resets: 0,
        };

        let cell_mv = 3300u16;
        let pack_mv = 4 * cell_mv;
        for (reg, value) in [
            (reg::CURRENT, 0),
            (reg::RELATIVE_STATE_OF_CHARGE, 80),
            (reg::FULL_CHARGE_CAPACITY, 3200),
        ] {
            sim.set_word(reg, value);
        }

        let mut da1 = Vec::with_capacity(catalog::DA_STATUS_1.len);
        for mv in [cell_mv, cell_mv, cell_mv, cell_mv, pack_mv, pack_mv - 10] {
            da1.extend_from_slice(&mv.to_le_bytes());
        }
        da1.resize(catalog::DA_STATUS_1.len, 0);
        let da2: Vec<u8> = std::iter::repeat(ROOM_TEMP_DECI_K.to_le_bytes())
            .take(catalog::DA_STATUS_2.len / 2)
            .flatten()
            .collect();

        sim.set_mac_block(catalog::SAFETY_STATUS.command, &[0; 4]);
        sim.set_mac_block(
            catalog::MANUFACTURER_STATUS.command,
            &catalog::FET_EN.to_le_bytes(),
        );
        sim.set_mac_block(catalog::DA_STATUS_1.command, &da1);
        sim.set_mac_block(catalog::DA_STATUS_2.command, &da2);

        sim.set_dataflash(df::DA_CONFIGURATION.address, &[0x03]);
        sim.set_dataflash(df::DEVICE_CHEMISTRY.address, &[4, b'L', b'F', b'E', b'4']);
        sim
    }

    pub fn set_word(&mut self, reg: u8, value: u16) {
        self.words.insert(reg, value);
    }

    pub fn word(&self, reg: u8) -> Option<u16> {
        self.words.get(&reg).copied()
    }

    /// Set the data returned for a MAC block, without the echo or PEC.
    pub fn set_mac_block(&mut self, command: u16, data: &[u8]) {
        self.mac_blocks.insert(command, data.to_vec());
    }

    pub fn set_dataflash(&mut self, address: u16, bytes: &[u8]) {
        for (addr, &b) in (address..).zip(bytes) {
            self.dataflash.insert(addr, b);
        }
    }

    pub fn dataflash(&self, address: u16, len: usize) -> Vec<u8> {
        (address..)
            .take(len)
            .map(|a| self.dataflash.get(&a).copied().unwrap_or(0))
            .collect()
    }

    /// Dataflash write frames received so far.
    pub fn dataflash_writes(&self) -> usize {
        self.dataflash_writes
    }

    /// NACK the `n`th dataflash write (1-based) from now on.
    pub fn fail_dataflash_write(&mut self, n: usize) {
        self.fail_write = Some(self.dataflash_writes + n);
    }

    /// Acknowledge writes to `address` without storing them.
    pub fn freeze_dataflash(&mut self, address: u16) {
        self.frozen.insert(address);
    }

    /// Answer reads of `address` with a wrong echo.
    pub fn corrupt_echo(&mut self, address: u16) {
        self.corrupt_echo.insert(address);
    }

    /// Answer reads of `address` with a wrong PEC.
    pub fn corrupt_pec(&mut self, address: u16) {
        self.corrupt_pec.insert(address);
    }

    /// Carry out the next `command` MAC but NACK it.
    pub fn lose_ack(&mut self, command: u16) {
        self.lost_ack.insert(command);
    }

    /// Time out the next `n` word reads.
    pub fn stall_word_reads(&mut self, n: usize) {
        self.stalled_reads = n;
    }

    pub fn fet_toggles(&self) -> u32 {
        self.fet_toggles
    }

    pub fn resets(&self) -> u32 {
        self.resets
    }

    fn check_address(&self, addr: u8) -> hw_trait::Result<()> {
        if addr == self.address {
            Ok(())
        } else {
            Err(I2cError::Nack(addr).into())
        }
    }

    fn run_mac(&mut self, command: u16) {
        match command {
            mac::FET_CONTROL => {
                let status = self
                    .mac_blocks
                    .entry(catalog::MANUFACTURER_STATUS.command)
                    .or_insert_with(|| vec![0; catalog::MANUFACTURER_STATUS.len]);
                status[0] ^= catalog::FET_EN as u8;
                self.fet_toggles += 1;
                debug!(fet_en = status[0] & catalog::FET_EN as u8 != 0, "Simulated FET toggle");
            }
            mac::DEVICE_RESET => {
                self.resets += 1;
                debug!("Simulated gauge reset");
            }
            _ => {}
        }
        self.selected_block = Some(command);
    }

    fn write_block(&mut self, address: u16, payload: &[u8]) -> hw_trait::Result<()> {
        self.dataflash_writes += 1;
        if self.fail_write == Some(self.dataflash_writes) {
            return Err(I2cError::Nack(self.address).into());
        }
        if !self.frozen.contains(&address) {
            self.set_dataflash(address, payload);
        }
        Ok(())
    }

    /// `[N, echo_lo, echo_hi, data..., PEC]` for the selected block.
    fn block_response(&self) -> hw_trait::Result<Vec<u8>> {
        let address = self
            .selected_block
            .ok_or_else(|| HwError::InvalidParameter("no block selected".into()))?;
        let data = match self.mac_blocks.get(&address) {
            Some(data) => data.clone(),
            None => self.dataflash(address, MAX_BLOCK_LEN),
        };
        let echo = if self.corrupt_echo.contains(&address) {
            address ^ 0x0100
        } else {
            address
        };

        let mut raw = Vec::with_capacity(data.len() + 4);
        raw.push((data.len() + 2) as u8);
        raw.extend_from_slice(&echo.to_le_bytes());
        raw.extend_from_slice(&data);
        let mut crc = pec::compute_parts(&[
            &[self.address << 1, BLOCK_ACCESS, (self.address << 1) | 1],
            &raw,
        ]);
        if self.corrupt_pec.contains(&address) {
            crc ^= 0xff;
        }
        raw.push(crc);
        Ok(raw)
    }
}

impl Default for SimulatedGauge {
    fn default() -> Self {
        Self::new()
    }
}

impl I2c for SimulatedGauge {
    fn write(&mut self, addr: u8, data: &[u8]) -> hw_trait::Result<()> {
        self.check_address(addr)?;
        match *data {
            [reg] => {
                self.selected_register = Some(reg);
                Ok(())
            }
            [BLOCK_ACCESS, 2, lo, hi, received] => {
                let expected = pec::compute(&[addr << 1, BLOCK_ACCESS, 2, lo, hi]);
                if received != expected {
                    return Err(I2cError::Nack(addr).into());
                }
                let command = u16::from_le_bytes([lo, hi]);
                self.run_mac(command);
                if self.lost_ack.remove(&command) {
                    return Err(I2cError::Nack(addr).into());
                }
                Ok(())
            }
            [BLOCK_ACCESS, count, lo, hi, ref payload @ ..]
                if count as usize == payload.len() + 2 && !payload.is_empty() =>
            {
                self.write_block(u16::from_le_bytes([lo, hi]), payload)
            }
            [reg, lo, hi] => {
                self.set_word(reg, u16::from_le_bytes([lo, hi]));
                Ok(())
            }
            _ => Err(HwError::InvalidParameter(format!(
                "unrecognized frame {:02x?}",
                data
            ))),
        }
    }

    fn read(&mut self, addr: u8, buffer: &mut [u8]) -> hw_trait::Result<usize> {
        self.check_address(addr)?;
        if self.stalled_reads > 0 {
            self.stalled_reads -= 1;
            self.selected_register = None;
            return Err(I2cError::Timeout.into());
        }
        let reg = self
            .selected_register
            .take()
            .ok_or_else(|| HwError::InvalidParameter("no register selected".into()))?;
        let value = self.words.get(&reg).copied().ok_or(I2cError::Nack(addr))?;
        let bytes = value.to_le_bytes();
        let n = buffer.len().min(bytes.len());
        buffer[..n].copy_from_slice(&bytes[..n]);
        Ok(n)
    }

    fn write_read(&mut self, addr: u8, write: &[u8], read: &mut [u8]) -> hw_trait::Result<usize> {
        self.check_address(addr)?;
        if write != [BLOCK_ACCESS] {
            return Err(HwError::InvalidParameter(format!(
                "block read through {:02x?}",
                write
            )));
        }
        let raw = self.block_response()?;
        let n = read.len().min(raw.len());
        read[..n].copy_from_slice(&raw[..n]);
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        hw_trait::NoDelay,
        smbus::{BlockKind, Bus, BusConfig, BusError},
    };

    fn bus() -> Bus<SimulatedGauge, NoDelay> {
        Bus::new(SimulatedGauge::new(), NoDelay, BusConfig::default())
    }

    #[test]
    fn other_address_is_nacked() {
        let mut sim = SimulatedGauge::new();
        assert_eq!(
            sim.write(0x0c, &[reg::CURRENT]),
            Err(HwError::I2c(I2cError::Nack(0x0c)))
        );
    }

    #[test]
    fn mac_command_with_bad_pec_is_nacked() {
        let mut sim = SimulatedGauge::new();
        let frame = [BLOCK_ACCESS, 2, 0x22, 0x00, 0x00];
        assert!(sim.write(DEVICE_ADDRESS, &frame).is_err());
        assert_eq!(sim.fet_toggles(), 0);
    }

    #[test]
    fn words_round_trip() {
        let mut bus = bus();
        bus.write_register(reg::CURRENT, 0x1234).unwrap();
        assert_eq!(bus.read_register(reg::CURRENT).unwrap().value, 0x1234);
        assert_eq!(bus.read_register(reg::RELATIVE_STATE_OF_CHARGE).unwrap().value, 80);
    }

    #[test]
    fn dataflash_round_trip() {
        let mut bus = bus();
        bus.write_dataflash(0x4481, &[0xc4, 0x09]).unwrap();
        let block = bus.read_dataflash(0x4481, 2, BlockKind::Number).unwrap();
        assert_eq!(block.data, vec![0xc4, 0x09]);
        assert_eq!(bus.i2c().dataflash_writes(), 1);
    }

    #[test]
    fn default_blocks_pass_validation() {
        let mut bus = bus();
        for block in [
            catalog::SAFETY_STATUS,
            catalog::MANUFACTURER_STATUS,
            catalog::DA_STATUS_1,
            catalog::DA_STATUS_2,
        ] {
            let data = bus.read_mac_block(block.command, block.len).unwrap();
            assert_eq!(data.len(), block.len, "{}", block.name);
        }
    }

    #[test]
    fn injected_faults() {
        let mut bus = bus();
        bus.i2c_mut().corrupt_pec(catalog::SAFETY_STATUS.command);
        assert!(matches!(
            bus.read_mac_block(catalog::SAFETY_STATUS.command, 4),
            Err(BusError::Integrity { .. })
        ));

        bus.i2c_mut().corrupt_echo(catalog::DA_STATUS_2.command);
        assert!(matches!(
            bus.read_mac_block(catalog::DA_STATUS_2.command, 14),
            Err(BusError::EchoMismatch { .. })
        ));
    }

    #[test]
    fn fet_control_flips_status_bit() {
        let mut bus = bus();
        bus.mac_command(mac::FET_CONTROL).unwrap();
        let data = bus
            .read_mac_block(catalog::MANUFACTURER_STATUS.command, 2)
            .unwrap();
        assert_eq!(u16::from_le_bytes([data[0], data[1]]) & catalog::FET_EN, 0);
        assert_eq!(bus.i2c().fet_toggles(), 1);
    }

    #[test]
    fn lost_ack_still_runs_the_command() {
        let mut bus = bus();
        bus.i2c_mut().lose_ack(mac::FET_CONTROL);
        assert!(bus.mac_command(mac::FET_CONTROL).is_err());
        assert_eq!(bus.i2c().fet_toggles(), 1);

        bus.mac_command(mac::FET_CONTROL).unwrap();
        assert_eq!(bus.i2c().fet_toggles(), 2);
    }

    #[test]
    fn stalled_word_read_recovers_on_retry() {
        let mut bus = bus();
        bus.i2c_mut().stall_word_reads(1);
        let reg = bus.read_register(reg::RELATIVE_STATE_OF_CHARGE).unwrap();
        assert_eq!(reg.value, 80);

        bus.i2c_mut().stall_word_reads(3);
        assert_eq!(
            bus.read_register(reg::CURRENT).unwrap_err(),
            BusError::Transport(I2cError::Timeout.into())
        );
    }
}
