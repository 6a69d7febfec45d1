//! Battery profiles and status snapshot.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Cell chemistry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Chemistry {
    LiFePO4,
    LiIon,
    LiPo,
}

/// Charge and cell over-voltage settings implied by a chemistry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChargeVoltages {
    pub charge_mv: u16,
    pub cov_threshold_mv: u16,
    pub cov_recovery_mv: u16,
}

impl Chemistry {
    pub const ALL: [Chemistry; 3] = [Chemistry::LiFePO4, Chemistry::LiIon, Chemistry::LiPo];

    /// Four-character code stored in the Device Chemistry string.
    pub const fn code(self) -> &'static str {
        match self {
            Chemistry::LiFePO4 => "LFE4",
            Chemistry::LiIon => "LION",
            Chemistry::LiPo => "LIPO",
        }
    }

    /// Look up a chemistry by its device code, ignoring case.
    pub fn from_code(code: &str) -> Option<Self> {
        let code = code.trim();
        Self::ALL
            .into_iter()
            .find(|c| c.code().eq_ignore_ascii_case(code))
    }

    /// Per-cell voltage used for design voltage and energy.
    pub const fn nominal_mv(self) -> u16 {
        match self {
            Chemistry::LiFePO4 => 3600,
            Chemistry::LiIon | Chemistry::LiPo => 4200,
        }
    }

    pub const fn voltages(self) -> ChargeVoltages {
        match self {
            Chemistry::LiFePO4 => ChargeVoltages {
                charge_mv: 3600,
                cov_threshold_mv: 3750,
                cov_recovery_mv: 3600,
            },
            Chemistry::LiIon | Chemistry::LiPo => ChargeVoltages {
                charge_mv: 4200,
                cov_threshold_mv: 4300,
                cov_recovery_mv: 4100,
            },
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            Chemistry::LiFePO4 => "lifepo4",
            Chemistry::LiIon => "liion",
            Chemistry::LiPo => "lipo",
        }
    }
}

impl fmt::Display for Chemistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Chemistry {
    type Err = Error;

    /// Accepts the request names (`lifepo4`, `liion`, `lipo`) and the device
    /// codes, case-insensitively.
    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        Self::ALL
            .into_iter()
            .find(|c| c.name().eq_ignore_ascii_case(s))
            .or_else(|| Self::from_code(s))
            .ok_or_else(|| Error::validation(format!("unknown chemistry {:?}", s)))
    }
}

/// Temperature protection window in whole degrees Celsius.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemperatureWindow {
    pub charge_high_c: i16,
    pub charge_low_c: i16,
    pub discharge_high_c: i16,
    pub discharge_low_c: i16,
    pub enabled: bool,
}

/// Protection thresholds in 0.1 degC, as stored on the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TemperatureThresholds {
    pub otc: i32,
    pub otc_recovery: i32,
    pub utc: i32,
    pub utc_recovery: i32,
    pub otd: i32,
    pub otd_recovery: i32,
    pub utd: i32,
    pub utd_recovery: i32,
}

/// Hysteresis between a temperature threshold and its recovery, in 0.1 degC.
const TEMPERATURE_HYSTERESIS: i32 = 50;

impl TemperatureWindow {
    pub fn validate(&self) -> Result<()> {
        if self.charge_low_c >= self.charge_high_c {
            return Err(Error::validation(format!(
                "charge window low {} degC must be below high {} degC",
                self.charge_low_c, self.charge_high_c
            )));
        }
        if self.discharge_low_c >= self.discharge_high_c {
            return Err(Error::validation(format!(
                "discharge window low {} degC must be below high {} degC",
                self.discharge_low_c, self.discharge_high_c
            )));
        }
        Ok(())
    }

    pub fn thresholds(&self) -> TemperatureThresholds {
        let raw = |c: i16| c as i32 * 10;
        TemperatureThresholds {
            otc: raw(self.charge_high_c),
            otc_recovery: raw(self.charge_high_c) - TEMPERATURE_HYSTERESIS,
            utc: raw(self.charge_low_c),
            utc_recovery: raw(self.charge_low_c) + TEMPERATURE_HYSTERESIS,
            otd: raw(self.discharge_high_c),
            otd_recovery: raw(self.discharge_high_c) - TEMPERATURE_HYSTERESIS,
            utd: raw(self.discharge_low_c),
            utd_recovery: raw(self.discharge_low_c) + TEMPERATURE_HYSTERESIS,
        }
    }
}

impl Default for TemperatureWindow {
    fn default() -> Self {
        Self {
            charge_high_c: 60,
            charge_low_c: -10,
            discharge_high_c: 60,
            discharge_low_c: -10,
            enabled: true,
        }
    }
}

/// Basic pack configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatteryProfile {
    pub chemistry: Chemistry,
    /// Series cells. Values above 4 are clamped when programmed.
    pub cell_number: u8,
    pub design_capacity_mah: u16,
    pub discharge_cutoff_mv: u16,
    pub temperature: TemperatureWindow,
}

impl BatteryProfile {
    pub fn validate(&self) -> Result<()> {
        self.temperature.validate()
    }

    /// Series cell count as the device can represent it.
    pub fn effective_cells(&self) -> u8 {
        self.cell_number.clamp(1, 4)
    }
}

impl Default for BatteryProfile {
    fn default() -> Self {
        Self {
            chemistry: Chemistry::LiFePO4,
            cell_number: 4,
            design_capacity_mah: 3200,
            discharge_cutoff_mv: 2800,
            temperature: TemperatureWindow::default(),
        }
    }
}

/// CEDV discharge curve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CedvCurve {
    pub edv0_mv: u16,
    pub edv1_mv: u16,
    pub edv2_mv: u16,
    /// Voltage at 0%, 10%, ..., 100% depth of discharge.
    pub voltage_points_mv: [u16; 11],
}

impl Default for CedvCurve {
    fn default() -> Self {
        Self {
            edv0_mv: 2800,
            edv1_mv: 2820,
            edv2_mv: 2830,
            voltage_points_mv: [
                3450, 3330, 3310, 3300, 3290, 3280, 3260, 3230, 3200, 3100, 2800,
            ],
        }
    }
}

/// Voltage protection and discharge-curve calibration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdvancedProfile {
    pub cuv_mv: u16,
    pub eoc_mv: u16,
    pub eoc_protect_mv: u16,
    pub cedv: CedvCurve,
}

impl Default for AdvancedProfile {
    fn default() -> Self {
        Self {
            cuv_mv: 2500,
            eoc_mv: 3600,
            eoc_protect_mv: 3750,
            cedv: CedvCurve::default(),
        }
    }
}

/// One cell's readings.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CellStatus {
    pub cell_num: u8,
    pub voltage_mv: u16,
    pub temperature_c: f32,
}

/// Telemetry snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct BatteryStatus {
    pub total_voltage_mv: u16,
    /// Positive while charging.
    pub charge_current_ma: i16,
    pub soc_percent: u16,
    pub learned_capacity_mah: u16,
    pub cells: [CellStatus; 4],
    pub cell_count: u8,
    pub pack_voltage_mv: u16,
    pub fet_enabled: bool,
    pub protection_status: u32,
    pub emergency_shutdown: bool,
}

impl BatteryStatus {
    /// SafetyStatus as eight uppercase hex digits, most significant first.
    pub fn protection_hex(&self) -> String {
        format!("{:08X}", self.protection_status)
    }
}

impl Default for BatteryStatus {
    fn default() -> Self {
        let cell = |n| CellStatus {
            cell_num: n,
            voltage_mv: 0,
            temperature_c: 0.0,
        };
        Self {
            total_voltage_mv: 0,
            charge_current_ma: 0,
            soc_percent: 0,
            learned_capacity_mah: 0,
            cells: [cell(1), cell(2), cell(3), cell(4)],
            cell_count: 0,
            pack_voltage_mv: 0,
            fet_enabled: false,
            protection_status: 0,
            emergency_shutdown: false,
        }
    }
}

/// Series-cell bits for DA Configuration.
pub fn cell_count_bits(cell_number: u8) -> u8 {
    cell_number.clamp(1, 4) - 1
}

/// Convert a 0.1 K reading to degrees Celsius.
pub fn deci_kelvin_to_celsius(raw: i16) -> f32 {
    raw as f32 / 10.0 - 273.15
}
