//! SMBus Packet Error Check.
//!
//! PEC is a CRC-8 with polynomial x^8 + x^2 + x + 1 (0x07), initial value 0,
//! no reflection and no output XOR. It covers every byte of a transaction as
//! seen on the wire, including the shifted address bytes.

/// CRC-8 polynomial used for PEC.
pub const POLYNOMIAL: u8 = 0x07;

/// Lookup table, generated at compile time and never modified.
static TABLE: [u8; 256] = build_table();

/// Build the 256-entry CRC-8 lookup table.
///
/// Each entry is the CRC of a single byte after eight rounds of
/// shift-left, XOR-ing the polynomial whenever the high bit falls out.
pub const fn build_table() -> [u8; 256] {
    let mut table = [0u8; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u8;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 0x80 != 0 {
                (crc << 1) ^ POLYNOMIAL
            } else {
                crc << 1
            };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

/// Compute the PEC over `data`.
pub fn compute(data: &[u8]) -> u8 {
    data.iter()
        .fold(0u8, |crc, &byte| TABLE[(byte ^ crc) as usize])
}

/// Compute the PEC over several slices as if they were one contiguous frame.
pub fn compute_parts(parts: &[&[u8]]) -> u8 {
    parts.iter().fold(0u8, |crc, part| {
        part.iter().fold(crc, |crc, &byte| TABLE[(byte ^ crc) as usize])
    })
}
