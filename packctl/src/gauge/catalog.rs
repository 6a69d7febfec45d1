//! Register, MAC command and dataflash map of the gauge.
//!
//! Only the subset the controller touches. Dataflash widths and signedness
//! follow the device's I1/U1/I2/U2/S5 type codes.

use crate::smbus::BlockKind;

/// SBS word registers.
pub mod reg {
    pub const CURRENT: u8 = 0x0A;
    pub const RELATIVE_STATE_OF_CHARGE: u8 = 0x0D;
    pub const FULL_CHARGE_CAPACITY: u8 = 0x10;
}

/// ManufacturerAccess commands without a data phase.
pub mod mac {
    pub const FET_CONTROL: u16 = 0x0022;
    pub const DEVICE_RESET: u16 = 0x0041;
}

/// A readable MAC block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MacBlock {
    pub name: &'static str,
    pub command: u16,
    pub len: usize,
}

/// Protection faults currently latched, 32-bit little-endian.
pub const SAFETY_STATUS: MacBlock = MacBlock {
    name: "SafetyStatus",
    command: 0x0051,
    len: 4,
};

/// Operational flags; bit 4 is FET_EN.
pub const MANUFACTURER_STATUS: MacBlock = MacBlock {
    name: "ManufacturerStatus",
    command: 0x0057,
    len: 2,
};

/// Cell 1-4 voltages, BAT and PACK voltages, then per-cell current and
/// power.
pub const DA_STATUS_1: MacBlock = MacBlock {
    name: "DAStatus1",
    command: 0x0071,
    len: 32,
};

/// Internal, TS1-TS4, cell and FET temperatures in 0.1 K.
pub const DA_STATUS_2: MacBlock = MacBlock {
    name: "DAStatus2",
    command: 0x0072,
    len: 14,
};

pub const FET_EN: u16 = 1 << 4;

/// A scalar or string dataflash location.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataflashField {
    pub name: &'static str,
    pub address: u16,
    /// Bytes on the device
    pub width: usize,
    pub kind: BlockKind,
    pub signed: bool,
}

impl DataflashField {
    const fn number(name: &'static str, address: u16, width: usize, signed: bool) -> Self {
        Self {
            name,
            address,
            width,
            kind: BlockKind::Number,
            signed,
        }
    }

    const fn i2(name: &'static str, address: u16) -> Self {
        Self::number(name, address, 2, true)
    }

    const fn u1(name: &'static str, address: u16) -> Self {
        Self::number(name, address, 1, false)
    }

    const fn string(name: &'static str, address: u16, width: usize) -> Self {
        Self {
            name,
            address,
            width,
            kind: BlockKind::String,
            signed: false,
        }
    }

    /// Encode `value` little-endian at this field's width, or `None` if it
    /// does not fit.
    pub fn encode(&self, value: i32) -> Option<Vec<u8>> {
        let (min, max) = match (self.width, self.signed) {
            (1, true) => (i8::MIN as i64, i8::MAX as i64),
            (1, false) => (0, u8::MAX as i64),
            (2, true) => (i16::MIN as i64, i16::MAX as i64),
            (2, false) => (0, u16::MAX as i64),
            (4, true) => (i32::MIN as i64, i32::MAX as i64),
            (4, false) => (0, u32::MAX as i64),
            _ => return None,
        };
        if !(min..=max).contains(&(value as i64)) {
            return None;
        }
        Some(value.to_le_bytes()[..self.width].to_vec())
    }

    /// Decode a payload read from this field.
    pub fn decode(&self, data: &[u8]) -> Option<i32> {
        if data.len() < self.width {
            return None;
        }
        let bytes = &data[..self.width];
        Some(match (self.width, self.signed) {
            (1, true) => bytes[0] as i8 as i32,
            (1, false) => bytes[0] as i32,
            (2, true) => i16::from_le_bytes([bytes[0], bytes[1]]) as i32,
            (2, false) => u16::from_le_bytes([bytes[0], bytes[1]]) as i32,
            (4, _) => i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            _ => return None,
        })
    }
}

/// Dataflash fields.
pub mod df {
    use super::DataflashField;

    // Protections: cell voltage
    pub const CUV_THRESHOLD: DataflashField = DataflashField::i2("CUV Threshold", 0x4481);
    pub const CUV_RECOVERY: DataflashField = DataflashField::i2("CUV Recovery", 0x4484);

    pub const COV_THRESHOLD_LOW_TEMP: DataflashField =
        DataflashField::i2("COV Threshold Low Temp", 0x4486);
    pub const COV_THRESHOLD_STD_TEMP: DataflashField =
        DataflashField::i2("COV Threshold Standard Temp", 0x4488);
    pub const COV_THRESHOLD_HIGH_TEMP: DataflashField =
        DataflashField::i2("COV Threshold High Temp", 0x448A);
    pub const COV_THRESHOLD_REC_TEMP: DataflashField =
        DataflashField::i2("COV Threshold Rec Temp", 0x448C);

    pub const COV_RECOVERY_LOW_TEMP: DataflashField =
        DataflashField::i2("COV Recovery Low Temp", 0x448F);
    pub const COV_RECOVERY_STD_TEMP: DataflashField =
        DataflashField::i2("COV Recovery Standard Temp", 0x4491);
    pub const COV_RECOVERY_HIGH_TEMP: DataflashField =
        DataflashField::i2("COV Recovery High Temp", 0x4493);
    pub const COV_RECOVERY_REC_TEMP: DataflashField =
        DataflashField::i2("COV Recovery Rec Temp", 0x4495);

    // Protections: temperature, 0.1 degC
    pub const OTC_THRESHOLD: DataflashField = DataflashField::i2("OTC Threshold", 0x44C0);
    pub const OTC_RECOVERY: DataflashField = DataflashField::i2("OTC Recovery", 0x44C3);
    pub const OTD_THRESHOLD: DataflashField = DataflashField::i2("OTD Threshold", 0x44C5);
    pub const OTD_RECOVERY: DataflashField = DataflashField::i2("OTD Recovery", 0x44C8);
    pub const UTC_THRESHOLD: DataflashField = DataflashField::i2("UTC Threshold", 0x44D0);
    pub const UTC_RECOVERY: DataflashField = DataflashField::i2("UTC Recovery", 0x44D3);
    pub const UTD_THRESHOLD: DataflashField = DataflashField::i2("UTD Threshold", 0x44D5);
    pub const UTD_RECOVERY: DataflashField = DataflashField::i2("UTD Recovery", 0x44D8);

    // Advanced charge algorithm: charging voltage per temperature range
    pub const CHARGE_VOLTAGE_LOW_TEMP: DataflashField =
        DataflashField::i2("Low Temp Charging Voltage", 0x4A0E);
    pub const CHARGE_VOLTAGE_STD_TEMP: DataflashField =
        DataflashField::i2("Standard Temp Charging Voltage", 0x4A14);
    pub const CHARGE_VOLTAGE_HIGH_TEMP: DataflashField =
        DataflashField::i2("High Temp Charging Voltage", 0x4A1A);
    pub const CHARGE_VOLTAGE_REC_TEMP: DataflashField =
        DataflashField::i2("Rec Temp Charging Voltage", 0x4A20);

    // Settings
    pub const DA_CONFIGURATION: DataflashField = DataflashField::u1("DA Configuration", 0x4B1D);
    pub const PROTECTION_ENABLE_B: DataflashField =
        DataflashField::u1("Enabled Protections B", 0x4B8A);
    pub const PROTECTION_ENABLE_D: DataflashField =
        DataflashField::u1("Enabled Protections D", 0x4B8C);

    // Gas gauging
    pub const DESIGN_CAPACITY_MAH: DataflashField =
        DataflashField::i2("Design Capacity mAh", 0x462D);
    pub const DESIGN_CAPACITY_CWH: DataflashField =
        DataflashField::i2("Design Capacity cWh", 0x462F);
    pub const DESIGN_VOLTAGE: DataflashField = DataflashField::i2("Design Voltage", 0x4631);
    pub const LEARNED_FULL_CHARGE_CAPACITY: DataflashField =
        DataflashField::i2("Learned Full Charge Capacity", 0x4100);

    pub const FD_SET_VOLTAGE: DataflashField =
        DataflashField::i2("FD Set Voltage Threshold", 0x4672);
    pub const FD_CLEAR_VOLTAGE: DataflashField =
        DataflashField::i2("FD Clear Voltage Threshold", 0x4675);
    pub const TD_SET_VOLTAGE: DataflashField =
        DataflashField::i2("TD Set Voltage Threshold", 0x467B);
    pub const TD_CLEAR_VOLTAGE: DataflashField =
        DataflashField::i2("TD Clear Voltage Threshold", 0x467E);

    // CEDV
    pub const EDV0: DataflashField = DataflashField::i2("Fixed EDV0", 0x4590);
    pub const EDV1: DataflashField = DataflashField::i2("Fixed EDV1", 0x4594);
    pub const EDV2: DataflashField = DataflashField::i2("Fixed EDV2", 0x4598);

    /// Voltage at 0%, 10%, ..., 100% depth of discharge.
    pub const CEDV_VOLTAGE_POINTS: [DataflashField; 11] = [
        DataflashField::i2("Voltage 0% DOD", 0x45A2),
        DataflashField::i2("Voltage 10% DOD", 0x45A4),
        DataflashField::i2("Voltage 20% DOD", 0x45A6),
        DataflashField::i2("Voltage 30% DOD", 0x45A8),
        DataflashField::i2("Voltage 40% DOD", 0x45AA),
        DataflashField::i2("Voltage 50% DOD", 0x45AC),
        DataflashField::i2("Voltage 60% DOD", 0x45AE),
        DataflashField::i2("Voltage 70% DOD", 0x45B0),
        DataflashField::i2("Voltage 80% DOD", 0x45B2),
        DataflashField::i2("Voltage 90% DOD", 0x45B4),
        DataflashField::i2("Voltage 100% DOD", 0x45B6),
    ];

    // Manufacturer info
    pub const DEVICE_CHEMISTRY: DataflashField =
        DataflashField::string("Device Chemistry", 0x4080, 5);

    /// Charging voltage, one slot per temperature range.
    pub const CHARGE_VOLTAGE_BINS: [DataflashField; 4] = [
        CHARGE_VOLTAGE_LOW_TEMP,
        CHARGE_VOLTAGE_STD_TEMP,
        CHARGE_VOLTAGE_HIGH_TEMP,
        CHARGE_VOLTAGE_REC_TEMP,
    ];

    pub const COV_THRESHOLD_BINS: [DataflashField; 4] = [
        COV_THRESHOLD_LOW_TEMP,
        COV_THRESHOLD_STD_TEMP,
        COV_THRESHOLD_HIGH_TEMP,
        COV_THRESHOLD_REC_TEMP,
    ];

    pub const COV_RECOVERY_BINS: [DataflashField; 4] = [
        COV_RECOVERY_LOW_TEMP,
        COV_RECOVERY_STD_TEMP,
        COV_RECOVERY_HIGH_TEMP,
        COV_RECOVERY_REC_TEMP,
    ];
}

/// DA Configuration bits 0-1: series cell count minus one.
pub const DA_CONFIG_CELL_MASK: u8 = 0x03;

/// Enabled Protections B: OTC (bit 4) and OTD (bit 5).
pub const PROTECTION_B_TEMP_MASK: u8 = 0x30;

/// Enabled Protections D: UTC (bit 2) and UTD (bit 3).
pub const PROTECTION_D_TEMP_MASK: u8 = 0x0C;
