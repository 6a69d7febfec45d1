//! Command and response messages.
//!
//! These types define the JSON contract with whatever delivers commands
//! (serial console, stdin). Requests are tagged by `cmd`.

use serde::{Deserialize, Serialize};

use crate::{
    error::{Error, Result},
    gauge::{
        AdvancedProfile, BatteryProfile, BatteryStatus, CedvCurve, Chemistry, TemperatureWindow,
    },
};

/// Highest accepted `sync.times`.
pub const MAX_SYNC_TIMES: u32 = 10;

/// A request.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(tag = "cmd", rename_all = "lowercase")]
pub enum Command {
    /// Program the basic profile
    Config(ProfileMessage),
    /// Program the advanced profile
    Advance(AdvanceMessage),
    /// Switch the FETs on or off
    Switch { fet_enable: bool },
    /// Restart the gauge
    Reset,
    /// Read both profiles back from the device, `times` copies
    Sync { times: u32 },
    /// Report the cached status
    Status,
    /// Refresh, then report the status
    Renew,
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::Config(_) => "config",
            Command::Advance(_) => "advance",
            Command::Switch { .. } => "switch",
            Command::Reset => "reset",
            Command::Sync { .. } => "sync",
            Command::Status => "status",
            Command::Renew => "renew",
        }
    }
}

/// Basic profile as carried in `config` and `sync`.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct ProfileMessage {
    pub chemistry: String,
    pub cells: u8,
    /// mAh
    pub capacity: u16,
    /// mV
    pub cutoff: u16,
    #[serde(default)]
    pub temp: TempMessage,
}

/// Temperature window in degC.
///
/// `high` and `low` set charge and discharge together; the specific fields
/// override them.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct TempMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub high: Option<i16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub low: Option<i16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub charge_high: Option<i16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub charge_low: Option<i16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub discharge_high: Option<i16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub discharge_low: Option<i16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
}

impl TempMessage {
    pub fn to_window(&self) -> TemperatureWindow {
        let default = TemperatureWindow::default();
        TemperatureWindow {
            charge_high_c: self.charge_high.or(self.high).unwrap_or(default.charge_high_c),
            charge_low_c: self.charge_low.or(self.low).unwrap_or(default.charge_low_c),
            discharge_high_c: self
                .discharge_high
                .or(self.high)
                .unwrap_or(default.discharge_high_c),
            discharge_low_c: self
                .discharge_low
                .or(self.low)
                .unwrap_or(default.discharge_low_c),
            enabled: self.enabled.unwrap_or(default.enabled),
        }
    }
}

impl From<&TemperatureWindow> for TempMessage {
    fn from(w: &TemperatureWindow) -> Self {
        Self {
            high: None,
            low: None,
            charge_high: Some(w.charge_high_c),
            charge_low: Some(w.charge_low_c),
            discharge_high: Some(w.discharge_high_c),
            discharge_low: Some(w.discharge_low_c),
            enabled: Some(w.enabled),
        }
    }
}

impl ProfileMessage {
    /// Parse the chemistry and validate the window.
    pub fn to_profile(&self) -> Result<BatteryProfile> {
        let profile = BatteryProfile {
            chemistry: self.chemistry.parse::<Chemistry>()?,
            cell_number: self.cells,
            design_capacity_mah: self.capacity,
            discharge_cutoff_mv: self.cutoff,
            temperature: self.temp.to_window(),
        };
        if profile.cell_number == 0 {
            return Err(Error::validation("cell count must be at least 1"));
        }
        profile.validate()?;
        Ok(profile)
    }
}

impl From<&BatteryProfile> for ProfileMessage {
    fn from(p: &BatteryProfile) -> Self {
        Self {
            chemistry: p.chemistry.to_string(),
            cells: p.cell_number,
            capacity: p.design_capacity_mah,
            cutoff: p.discharge_cutoff_mv,
            temp: TempMessage::from(&p.temperature),
        }
    }
}

/// Advanced profile as carried in `advance` and `sync`. All voltages in mV.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct AdvanceMessage {
    pub cuv: u16,
    pub eoc: u16,
    pub eoc_protect: u16,
    pub edv0: u16,
    pub edv1: u16,
    pub edv2: u16,
    /// Voltage at 0%, 10%, ..., 100% depth of discharge
    pub points: [u16; 11],
}

impl From<&AdvanceMessage> for AdvancedProfile {
    fn from(m: &AdvanceMessage) -> Self {
        Self {
            cuv_mv: m.cuv,
            eoc_mv: m.eoc,
            eoc_protect_mv: m.eoc_protect,
            cedv: CedvCurve {
                edv0_mv: m.edv0,
                edv1_mv: m.edv1,
                edv2_mv: m.edv2,
                voltage_points_mv: m.points,
            },
        }
    }
}

impl From<&AdvancedProfile> for AdvanceMessage {
    fn from(p: &AdvancedProfile) -> Self {
        Self {
            cuv: p.cuv_mv,
            eoc: p.eoc_mv,
            eoc_protect: p.eoc_protect_mv,
            edv0: p.cedv.edv0_mv,
            edv1: p.cedv.edv1_mv,
            edv2: p.cedv.edv2_mv,
            points: p.cedv.voltage_points_mv,
        }
    }
}

/// A reply line.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Response {
    Status(StatusResponse),
    Sync(SyncResponse),
    Ack(Ack),
    Error(ErrorResponse),
}

/// Telemetry snapshot.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct StatusResponse {
    pub cmd: String,
    /// %
    pub soc_gauge: u16,
    /// mA, positive while charging
    pub charge_current: i16,
    /// V, three decimals
    pub total_voltage: String,
    /// Ah, three decimals
    pub learned_capacity: String,
    /// mV
    pub pack_voltage: u16,
    pub fet_enable: bool,
    /// SafetyStatus hex, `,EMSHUT` appended during emergency shutdown
    pub protection_sta: String,
    /// Always four entries
    pub cells: Vec<CellResponse>,
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct CellResponse {
    pub cell_num: u8,
    /// degC, three decimals
    pub temperature: String,
    /// V, three decimals
    pub voltage: String,
}

impl StatusResponse {
    pub fn new(cmd: &str, status: &BatteryStatus) -> Self {
        let mut protection_sta = status.protection_hex();
        if status.emergency_shutdown {
            protection_sta.push_str(",EMSHUT");
        }
        Self {
            cmd: cmd.to_string(),
            soc_gauge: status.soc_percent,
            charge_current: status.charge_current_ma,
            total_voltage: milli(status.total_voltage_mv),
            learned_capacity: milli(status.learned_capacity_mah),
            pack_voltage: status.pack_voltage_mv,
            fet_enable: status.fet_enabled,
            protection_sta,
            cells: status
                .cells
                .iter()
                .map(|c| CellResponse {
                    cell_num: c.cell_num,
                    temperature: format!("{:.3}", c.temperature_c),
                    voltage: milli(c.voltage_mv),
                })
                .collect(),
        }
    }
}

/// Both profiles as read from the device.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct SyncResponse {
    pub cmd: String,
    pub config: ProfileMessage,
    pub advance: AdvanceMessage,
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct Ack {
    pub cmd: String,
    pub ok: bool,
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct ErrorResponse {
    pub cmd: String,
    pub ok: bool,
    pub error: String,
}

impl ErrorResponse {
    pub fn new(cmd: &str, error: impl ToString) -> Self {
        Self {
            cmd: cmd.to_string(),
            ok: false,
            error: error.to_string(),
        }
    }
}

/// Thousandths to a three-decimal string: 13210 => "13.210".
fn milli(value: u16) -> String {
    format!("{}.{:03}", value / 1000, value % 1000)
}
