//! SMBus transaction layer for the gauge.
//!
//! Three sub-protocols share the bus:
//!
//! - **Word register**: plain 16-bit little-endian reads and writes, no PEC.
//! - **Manufacturer access (MAC) block**: a PEC-protected block write of the
//!   16-bit command to the block-access register, then a block read whose
//!   first two data bytes echo the command back.
//! - **Dataflash block**: the same addressing, but writes carry the payload
//!   inline and are not PEC-protected.
//!
//! Every block read returns a freshly allocated buffer; nothing handed to a
//! caller aliases internal scratch space.

pub mod pec;
pub mod retry;

use std::time::Duration;

use thiserror::Error;

use crate::{
    config, error,
    hw_trait::{Delay, HwError, I2c, I2cError},
    tracing::prelude::*,
};

pub use retry::{Retry, RetryPolicy};

/// 7-bit SMBus address of the gauge.
pub const DEVICE_ADDRESS: u8 = 0x0B;

/// ManufacturerBlockAccess command.
pub const BLOCK_ACCESS: u8 = 0x44;

/// SMBus block payload limit.
pub const MAX_BLOCK_LEN: usize = 32;

/// Encoding of a block's payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    /// Little-endian fixed-width integer
    Number,
    /// Length-prefixed ASCII
    String,
}

/// A block read from, or destined for, the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceBlock {
    pub address: u16,
    pub kind: BlockKind,
    pub data: Vec<u8>,
}

impl DeviceBlock {
    /// Decode a STRING payload. The first byte is the embedded length.
    pub fn text(&self) -> String {
        let Some((&len, rest)) = self.data.split_first() else {
            return String::new();
        };
        let len = (len as usize).min(rest.len());
        String::from_utf8_lossy(&rest[..len]).into_owned()
    }
}

/// A word register and its value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceRegister {
    pub reg: u8,
    pub value: u16,
}

impl DeviceRegister {
    /// The value reinterpreted as two's complement.
    pub fn signed(&self) -> i16 {
        self.value as i16
    }
}

/// Failures of a single bus transaction.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BusError {
    /// NACK, timeout, short read or other adapter failure
    #[error("transport: {0}")]
    Transport(#[from] HwError),

    /// PEC did not match the received frame
    #[error("PEC mismatch for 0x{address:04x}: computed 0x{computed:02x}, received 0x{received:02x}")]
    Integrity {
        address: u16,
        computed: u8,
        received: u8,
    },

    /// The device answered for a different address than requested
    #[error("address echo mismatch: requested 0x{requested:04x}, device echoed 0x{echoed:04x}")]
    EchoMismatch { requested: u16, echoed: u16 },

    /// Block exceeds the SMBus limit
    #[error("block of {0} bytes exceeds the 32 byte SMBus limit")]
    BlockTooLong(usize),

    /// Response ended before its declared length
    #[error("truncated block response for 0x{address:04x}: {received} of {needed} bytes")]
    Truncated {
        address: u16,
        received: usize,
        needed: usize,
    },
}

impl BusError {
    /// Only transport failures are worth repeating; a corrupted or
    /// misaddressed answer is reported as-is.
    pub fn is_transport(&self) -> bool {
        matches!(self, BusError::Transport(_))
    }
}

/// Bus timing and addressing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BusConfig {
    /// 7-bit device address
    pub address: u8,
    /// Minimum spacing after a transaction that touches non-volatile memory
    pub settle: Duration,
    /// Retry policy for transport failures
    pub retry: RetryPolicy,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            address: DEVICE_ADDRESS,
            settle: Duration::from_millis(10),
            retry: RetryPolicy::default(),
        }
    }
}

impl BusConfig {
    /// Defaults overridden by `PACKCTL_SETTLE_MS`, `PACKCTL_RETRIES` and
    /// `PACKCTL_RETRY_DELAY_MS`.
    pub fn from_env() -> error::Result<Self> {
        let mut bus = Self::default();
        if let Some(ms) = config::env_parse::<u64>("PACKCTL_SETTLE_MS")? {
            bus.settle = Duration::from_millis(ms);
        }
        if let Some(attempts) = config::env_parse::<u32>("PACKCTL_RETRIES")? {
            bus.retry.max_attempts = attempts.max(1);
        }
        if let Some(ms) = config::env_parse::<u64>("PACKCTL_RETRY_DELAY_MS")? {
            bus.retry.delay = Duration::from_millis(ms);
        }
        Ok(bus)
    }
}

/// The gauge's SMBus interface.
pub struct Bus<I, D> {
    i2c: I,
    delay: D,
    config: BusConfig,
}

impl<I: I2c, D: Delay> Bus<I, D> {
    pub fn new(i2c: I, delay: D, config: BusConfig) -> Self {
        Self { i2c, delay, config }
    }

    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    /// Borrow the transport, e.g. to inspect a simulated device.
    pub fn i2c(&self) -> &I {
        &self.i2c
    }

    pub fn i2c_mut(&mut self) -> &mut I {
        &mut self.i2c
    }

    /// Wait out the configured settle time.
    pub fn settle(&mut self) {
        self.delay.delay(self.config.settle);
    }

    // Word register

    /// Read a 16-bit word register.
    pub fn read_register(&mut self, reg: u8) -> Result<DeviceRegister, BusError> {
        let addr = self.config.address;
        let i2c = &mut self.i2c;
        let outcome = self.config.retry.run(
            &mut self.delay,
            || -> Result<u16, BusError> {
                i2c.write(addr, &[reg])?;
                let mut buf = [0u8; 2];
                let received = i2c.read(addr, &mut buf)?;
                if received < buf.len() {
                    return Err(HwError::from(I2cError::ShortRead {
                        expected: buf.len(),
                        actual: received,
                    })
                    .into());
                }
                Ok(u16::from_le_bytes(buf))
            },
            BusError::is_transport,
        );
        let value = Self::finish(outcome, "read word", reg as u16)?;
        trace!("Read word 0x{:02x} = 0x{:04x}", reg, value);
        Ok(DeviceRegister { reg, value })
    }

    /// Write a 16-bit word register.
    pub fn write_register(&mut self, reg: u8, value: u16) -> Result<(), BusError> {
        let [lo, hi] = value.to_le_bytes();
        trace!("Write word 0x{:02x} = 0x{:04x}", reg, value);
        self.write_frame(&[reg, lo, hi], self.config.retry, "write word", reg as u16)
    }

    // Manufacturer access

    /// Send a MAC action command with no data phase.
    ///
    /// Single attempt. A lost acknowledge is reported, never resent.
    pub fn mac_command(&mut self, command: u16) -> Result<(), BusError> {
        trace!("MAC command 0x{:04x}", command);
        let frame = self.mac_frame(command);
        self.write_frame(&frame, RetryPolicy::once(), "MAC command", command)
    }

    /// Select the MAC block or dataflash address for the next block read.
    fn select(&mut self, address: u16) -> Result<(), BusError> {
        let frame = self.mac_frame(address);
        self.write_frame(&frame, self.config.retry, "select", address)
    }

    fn mac_frame(&self, command: u16) -> [u8; 5] {
        let [lo, hi] = command.to_le_bytes();
        let pec = pec::compute(&[self.config.address << 1, BLOCK_ACCESS, 2, lo, hi]);
        [BLOCK_ACCESS, 2, lo, hi, pec]
    }

    /// Read `len` bytes of a MAC block, validating the echo and PEC.
    pub fn read_mac_block(&mut self, command: u16, len: usize) -> Result<Vec<u8>, BusError> {
        if len > MAX_BLOCK_LEN {
            return Err(BusError::BlockTooLong(len));
        }
        self.select(command)?;
        let raw = self.block_read(command, len + 4)?;
        let data = parse_mac_response(self.config.address, command, &raw).inspect_err(|e| {
            warn!("MAC block 0x{:04x} rejected: {}", command, e);
        })?;
        trace!("MAC block 0x{:04x} = {:02x?}", command, data);
        Ok(data)
    }

    // Dataflash

    /// Write a dataflash block. The frame carries no PEC.
    pub fn write_dataflash(&mut self, address: u16, payload: &[u8]) -> Result<(), BusError> {
        if payload.is_empty() || payload.len() > MAX_BLOCK_LEN {
            return Err(BusError::BlockTooLong(payload.len()));
        }
        let [lo, hi] = address.to_le_bytes();
        let mut frame = Vec::with_capacity(payload.len() + 4);
        frame.extend_from_slice(&[BLOCK_ACCESS, (payload.len() + 2) as u8, lo, hi]);
        frame.extend_from_slice(payload);
        trace!("Write dataflash 0x{:04x} = {:02x?}", address, payload);
        // A NACKed attempt may already be programming flash.
        let retry = RetryPolicy {
            delay: self.config.retry.delay.max(self.config.settle),
            ..self.config.retry
        };
        let result = self.write_frame(&frame, retry, "write dataflash", address);
        // Spacing applies whether or not the device acknowledged.
        self.settle();
        result
    }

    /// Read `len` bytes of dataflash at `address`.
    pub fn read_dataflash(
        &mut self,
        address: u16,
        len: usize,
        kind: BlockKind,
    ) -> Result<DeviceBlock, BusError> {
        if len == 0 || len > MAX_BLOCK_LEN {
            return Err(BusError::BlockTooLong(len));
        }
        self.select(address)?;
        let read_len = match kind {
            BlockKind::Number => len + 3,
            BlockKind::String => len + 4,
        };
        let raw = self.block_read(address, read_len)?;
        let data = parse_dataflash_response(address, len, &raw).inspect_err(|e| {
            warn!("Dataflash 0x{:04x} rejected: {}", address, e);
        })?;
        trace!("Read dataflash 0x{:04x} = {:02x?}", address, data);
        Ok(DeviceBlock {
            address,
            kind,
            data,
        })
    }

    // Helpers

    fn block_read(&mut self, address: u16, read_len: usize) -> Result<Vec<u8>, BusError> {
        let addr = self.config.address;
        let i2c = &mut self.i2c;
        let outcome = self.config.retry.run(
            &mut self.delay,
            || -> Result<Vec<u8>, BusError> {
                let mut buf = vec![0u8; read_len];
                let received = i2c.write_read(addr, &[BLOCK_ACCESS], &mut buf)?;
                buf.truncate(received.min(read_len));
                Ok(buf)
            },
            BusError::is_transport,
        );
        Self::finish(outcome, "block read", address)
    }

    fn write_frame(
        &mut self,
        frame: &[u8],
        retry: RetryPolicy,
        what: &str,
        address: u16,
    ) -> Result<(), BusError> {
        let addr = self.config.address;
        let i2c = &mut self.i2c;
        let outcome = retry.run(
            &mut self.delay,
            || i2c.write(addr, frame).map_err(BusError::from),
            BusError::is_transport,
        );
        Self::finish(outcome, what, address)
    }

    fn finish<T>(outcome: Retry<T, BusError>, what: &str, address: u16) -> Result<T, BusError> {
        match outcome {
            Retry::Success { value, attempts } => {
                if attempts > 1 {
                    debug!("{} 0x{:04x} succeeded after {} attempts", what, address, attempts);
                }
                Ok(value)
            }
            Retry::Exhausted { error, attempts } => {
                warn!(
                    "{} 0x{:04x} failed after {} attempt(s): {}",
                    what, address, attempts, error
                );
                Err(error)
            }
        }
    }
}

/// Validate a MAC block response laid out as
/// `[N, echo_lo, echo_hi, data(N-2)..., PEC]` and return the data.
pub fn parse_mac_response(device: u8, requested: u16, raw: &[u8]) -> Result<Vec<u8>, BusError> {
    let truncated = |needed| BusError::Truncated {
        address: requested,
        received: raw.len(),
        needed,
    };
    let &count = raw.first().ok_or_else(|| truncated(1))?;
    let count = count as usize;
    if count < 2 {
        return Err(truncated(3));
    }
    if count - 2 > MAX_BLOCK_LEN {
        return Err(BusError::BlockTooLong(count - 2));
    }
    let needed = 1 + count + 1;
    if raw.len() < needed {
        return Err(truncated(needed));
    }

    let echoed = u16::from_le_bytes([raw[1], raw[2]]);
    if echoed != requested {
        return Err(BusError::EchoMismatch { requested, echoed });
    }

    let received = raw[1 + count];
    let computed = pec::compute_parts(&[
        &[device << 1, BLOCK_ACCESS, (device << 1) | 1],
        &raw[..1 + count],
    ]);
    if computed != received {
        return Err(BusError::Integrity {
            address: requested,
            computed,
            received,
        });
    }

    Ok(raw[3..1 + count].to_vec())
}

/// Validate a dataflash response laid out as `[N, echo_lo, echo_hi,
/// data...]` and return the first `len` data bytes.
pub fn parse_dataflash_response(
    requested: u16,
    len: usize,
    raw: &[u8],
) -> Result<Vec<u8>, BusError> {
    let needed = 3 + len;
    if raw.len() < needed {
        return Err(BusError::Truncated {
            address: requested,
            received: raw.len(),
            needed,
        });
    }
    let echoed = u16::from_le_bytes([raw[1], raw[2]]);
    if echoed != requested {
        return Err(BusError::EchoMismatch { requested, echoed });
    }
    Ok(raw[3..needed].to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hw_trait::NoDelay;
    use std::collections::VecDeque;

    /// Scripted transport: records writes and block read sizes, replays
    /// canned read responses.
    #[derive(Default)]
    struct Script {
        writes: Vec<Vec<u8>>,
        read_lens: Vec<usize>,
        responses: VecDeque<Result<Vec<u8>, HwError>>,
        write_failures: VecDeque<HwError>,
    }

    impl Script {
        fn respond(mut self, bytes: Vec<u8>) -> Self {
            self.responses.push_back(Ok(bytes));
            self
        }

        fn fill(&mut self, buffer: &mut [u8]) -> crate::hw_trait::Result<usize> {
            let bytes = self.responses.pop_front().unwrap_or(Ok(vec![]))?;
            let n = bytes.len().min(buffer.len());
            buffer[..n].copy_from_slice(&bytes[..n]);
            Ok(n)
        }
    }

    impl I2c for Script {
        fn write(&mut self, addr: u8, data: &[u8]) -> crate::hw_trait::Result<()> {
            assert_eq!(addr, DEVICE_ADDRESS);
            self.writes.push(data.to_vec());
            match self.write_failures.pop_front() {
                Some(e) => Err(e),
                None => Ok(()),
            }
        }

        fn read(&mut self, _addr: u8, buffer: &mut [u8]) -> crate::hw_trait::Result<usize> {
            self.fill(buffer)
        }

        fn write_read(
            &mut self,
            _addr: u8,
            write: &[u8],
            read: &mut [u8],
        ) -> crate::hw_trait::Result<usize> {
            self.writes.push(write.to_vec());
            self.read_lens.push(read.len());
            self.fill(read)
        }
    }

    /// Records every requested wait.
    #[derive(Default)]
    struct Waits(Vec<Duration>);

    impl Delay for Waits {
        fn delay(&mut self, duration: Duration) {
            self.0.push(duration);
        }
    }

    fn bus(script: Script) -> Bus<Script, NoDelay> {
        Bus::new(script, NoDelay, BusConfig::default())
    }

    fn nack() -> HwError {
        I2cError::Nack(DEVICE_ADDRESS).into()
    }

    fn mac_response(command: u16, data: &[u8]) -> Vec<u8> {
        let [lo, hi] = command.to_le_bytes();
        let mut raw = vec![(data.len() + 2) as u8, lo, hi];
        raw.extend_from_slice(data);
        let pec = pec::compute_parts(&[&[0x16, BLOCK_ACCESS, 0x17], &raw]);
        raw.push(pec);
        raw
    }

    #[test]
    fn word_read_is_little_endian() {
        let mut bus = bus(Script::default().respond(vec![0x0c, 0xfe]));
        let reg = bus.read_register(0x0a).unwrap();
        assert_eq!(reg.value, 0xfe0c);
        assert_eq!(reg.signed(), -500);
        assert_eq!(bus.i2c().writes, vec![vec![0x0a]]);
    }

    #[test]
    fn short_word_read_fails() {
        let script = Script::default()
            .respond(vec![0x01])
            .respond(vec![0x01])
            .respond(vec![0x01]);
        let mut bus = bus(script);
        let err = bus.read_register(0x0d).unwrap_err();
        assert!(matches!(
            err,
            BusError::Transport(HwError::I2c(I2cError::ShortRead { expected: 2, actual: 1 }))
        ));
        // Default policy retries transport failures
        assert_eq!(bus.i2c().writes.len(), 3);
    }

    #[test]
    fn word_write_frame() {
        let mut bus = bus(Script::default());
        bus.write_register(0x00, 0x0041).unwrap();
        assert_eq!(bus.i2c().writes, vec![vec![0x00, 0x41, 0x00]]);
    }

    #[test]
    fn word_write_reports_transport_status() {
        let mut script = Script::default();
        script.write_failures.push_back(I2cError::Status(4).into());
        let mut bus = Bus::new(
            script,
            NoDelay,
            BusConfig {
                retry: RetryPolicy::once(),
                ..BusConfig::default()
            },
        );
        let err = bus.write_register(0x00, 0x1234).unwrap_err();
        assert_eq!(err, BusError::Transport(I2cError::Status(4).into()));
    }

    #[test]
    fn mac_command_frame_carries_pec() {
        let mut bus = bus(Script::default());
        bus.mac_command(0x0071).unwrap();
        let frame = &bus.i2c().writes[0];
        assert_eq!(&frame[..4], &[0x44, 0x02, 0x71, 0x00]);
        assert_eq!(frame[4], pec::compute(&[0x16, 0x44, 0x02, 0x71, 0x00]));
    }

    #[test]
    fn mac_block_read_strips_echo() {
        let response = mac_response(0x0051, &[0x00, 0x10, 0x00, 0x02]);
        let mut bus = bus(Script::default().respond(response));
        let data = bus.read_mac_block(0x0051, 4).unwrap();
        assert_eq!(data, vec![0x00, 0x10, 0x00, 0x02]);
        // Address selection, then block-access read of count, echo, data, PEC
        assert_eq!(bus.i2c().writes[1], vec![BLOCK_ACCESS]);
        assert_eq!(bus.i2c().read_lens, vec![8]);
    }

    #[test]
    fn mac_command_is_sent_once() {
        let mut script = Script::default();
        script.write_failures.push_back(nack());
        let mut bus = bus(script);
        assert_eq!(
            bus.mac_command(0x0022).unwrap_err(),
            BusError::Transport(nack())
        );
        assert_eq!(bus.i2c().writes.len(), 1);
    }

    #[test]
    fn block_select_is_retried() {
        let mut script = Script::default().respond(mac_response(0x0051, &[0; 4]));
        script.write_failures.push_back(nack());
        let mut bus = bus(script);
        bus.read_mac_block(0x0051, 4).unwrap();
        let selects = bus.i2c().writes.iter().filter(|w| w.len() == 5).count();
        assert_eq!(selects, 2);
    }

    #[test]
    fn mac_block_echo_mismatch_is_protocol_failure() {
        let response = mac_response(0x0057, &[0x10, 0x00]);
        let mut bus = bus(Script::default().respond(response));
        let err = bus.read_mac_block(0x0051, 2).unwrap_err();
        assert_eq!(
            err,
            BusError::EchoMismatch {
                requested: 0x0051,
                echoed: 0x0057
            }
        );
    }

    #[test]
    fn mac_block_bad_pec_is_integrity_failure() {
        let mut response = mac_response(0x0051, &[0x01, 0x02, 0x03, 0x04]);
        let last = response.len() - 1;
        response[last] ^= 0x01;
        let mut bus = bus(Script::default().respond(response));
        let err = bus.read_mac_block(0x0051, 4).unwrap_err();
        assert!(matches!(err, BusError::Integrity { address: 0x0051, .. }));
        // Integrity failures are not retried
        assert_eq!(bus.i2c().writes.len(), 2);
    }

    #[test]
    fn mac_block_rejects_oversized_request() {
        let mut bus = bus(Script::default());
        assert_eq!(
            bus.read_mac_block(0x0071, 33).unwrap_err(),
            BusError::BlockTooLong(33)
        );
        assert!(bus.i2c().writes.is_empty());
    }

    #[test]
    fn mac_response_with_oversized_count_rejected() {
        let mut raw = vec![40u8, 0x71, 0x00];
        raw.extend(std::iter::repeat(0).take(40));
        assert_eq!(
            parse_mac_response(DEVICE_ADDRESS, 0x0071, &raw).unwrap_err(),
            BusError::BlockTooLong(38)
        );
    }

    #[test]
    fn dataflash_write_frame_has_no_pec() {
        let mut bus = bus(Script::default());
        bus.write_dataflash(0x4481, &[0xc4, 0x09]).unwrap();
        assert_eq!(
            bus.i2c().writes,
            vec![vec![0x44, 0x04, 0x81, 0x44, 0xc4, 0x09]]
        );
    }

    #[test]
    fn dataflash_retry_waits_out_settle_time() {
        let mut script = Script::default();
        script.write_failures.push_back(I2cError::Status(2).into());
        let config = BusConfig::default();
        assert!(config.retry.delay < config.settle);
        let mut bus = Bus::new(script, Waits::default(), config);

        bus.write_dataflash(0x4481, &[0xc4, 0x09]).unwrap();
        assert_eq!(bus.i2c().writes.len(), 2);
        assert_eq!(bus.delay.0, vec![config.settle, config.settle]);
    }

    #[test]
    fn word_retry_keeps_retry_delay() {
        let mut script = Script::default().respond(vec![0x50, 0x00]);
        script.write_failures.push_back(nack());
        let config = BusConfig::default();
        let mut bus = Bus::new(script, Waits::default(), config);

        assert_eq!(bus.read_register(0x0d).unwrap().value, 0x50);
        assert_eq!(bus.delay.0, vec![config.retry.delay]);
    }

    #[test]
    fn dataflash_number_read() {
        let raw = vec![0x22, 0x81, 0x44, 0xc4, 0x09];
        let mut bus = bus(Script::default().respond(raw));
        let block = bus.read_dataflash(0x4481, 2, BlockKind::Number).unwrap();
        assert_eq!(block.data, vec![0xc4, 0x09]);
        // Count, echo and the value itself
        assert_eq!(bus.i2c().read_lens, vec![5]);
    }

    #[test]
    fn dataflash_string_read() {
        let raw = vec![0x22, 0x80, 0x40, 0x04, b'L', b'F', b'E', b'4', 0x00];
        let mut bus = bus(Script::default().respond(raw));
        let block = bus.read_dataflash(0x4080, 5, BlockKind::String).unwrap();
        assert_eq!(block.text(), "LFE4");
        // One byte more than a number of the same width
        assert_eq!(bus.i2c().read_lens, vec![9]);
    }

    #[test]
    fn dataflash_echo_mismatch_aborts() {
        let raw = vec![0x22, 0x82, 0x44, 0xc4, 0x09];
        let mut bus = bus(Script::default().respond(raw));
        assert!(matches!(
            bus.read_dataflash(0x4481, 2, BlockKind::Number),
            Err(BusError::EchoMismatch { .. })
        ));
    }
}
