//! Profile programming and read-back.

use super::{
    catalog::{
        self, df, mac, DataflashField, DA_CONFIG_CELL_MASK, PROTECTION_B_TEMP_MASK,
        PROTECTION_D_TEMP_MASK,
    },
    types::{cell_count_bits, AdvancedProfile, BatteryProfile, CedvCurve, Chemistry},
    ApplyReport, Gauge, TemperatureWindow,
};
use crate::{
    error::{Error, Result},
    hw_trait::{Delay, I2c},
    tracing::prelude::*,
};

// Offsets from the discharge cutoff, mV.
const FD_CLEAR_OFFSET: i32 = 100;
const TD_CLEAR_OFFSET: i32 = 100;
const EDV1_OFFSET: i32 = 20;
const EDV2_OFFSET: i32 = 30;
const CUV_THRESHOLD_OFFSET: i32 = -50;
const CUV_RECOVERY_OFFSET: i32 = 100;

/// Gap between the COV threshold and its recovery in the advanced profile.
const COV_RECOVERY_GAP: i32 = 100;

fn same_in_bins(bins: [DataflashField; 4], value: u16) -> [(DataflashField, i32); 4] {
    bins.map(|field| (field, value as i32))
}

impl<I: I2c, D: Delay> Gauge<I, D> {
    /// Program a basic profile.
    ///
    /// The profile is validated before anything is written. Every step runs
    /// even if an earlier one failed; check [`ApplyReport::ok`].
    pub fn apply(&mut self, profile: &BatteryProfile) -> Result<ApplyReport> {
        profile.validate()?;
        info!(
            chemistry = %profile.chemistry,
            cells = profile.cell_number,
            capacity = profile.design_capacity_mah,
            cutoff = profile.discharge_cutoff_mv,
            "Applying battery profile"
        );

        let mut report = self.apply_chemistry(profile);
        report.extend(self.apply_cell_count(profile));
        report.extend(self.apply_design_capacity(profile));
        report.extend(self.apply_discharge_cutoff(profile));
        report.extend(self.apply_temperature_protection(&profile.temperature)?);

        self.profile = *profile;
        Self::log_summary("Battery profile", &report);
        Ok(report)
    }

    /// Charge voltage and cell over-voltage for the chemistry in all four
    /// temperature bins, then the chemistry code.
    pub fn apply_chemistry(&mut self, profile: &BatteryProfile) -> ApplyReport {
        let chemistry = profile.chemistry;
        let v = chemistry.voltages();
        debug!("Chemistry {} => {:?}", chemistry, v);

        let mut report =
            self.write_verified_batch(&same_in_bins(df::CHARGE_VOLTAGE_BINS, v.charge_mv));
        report.extend(self.write_verified_batch(&same_in_bins(
            df::COV_THRESHOLD_BINS,
            v.cov_threshold_mv,
        )));
        report.extend(self.write_verified_batch(&same_in_bins(
            df::COV_RECOVERY_BINS,
            v.cov_recovery_mv,
        )));
        report.push(self.write_verified_text(&df::DEVICE_CHEMISTRY, chemistry.code()));
        report
    }

    /// Series cell bits in DA Configuration and the design voltage.
    pub fn apply_cell_count(&mut self, profile: &BatteryProfile) -> ApplyReport {
        if profile.cell_number != profile.effective_cells() {
            warn!(
                "{} cells requested, programming {}",
                profile.cell_number,
                profile.effective_cells()
            );
        }
        let mut report = ApplyReport::default();
        report.push(self.update_bits(
            &df::DA_CONFIGURATION,
            DA_CONFIG_CELL_MASK,
            cell_count_bits(profile.cell_number),
        ));
        let design_voltage =
            profile.effective_cells() as i32 * profile.chemistry.nominal_mv() as i32;
        report.push(self.write_verified(&df::DESIGN_VOLTAGE, design_voltage));
        report
    }

    /// Design capacity in mAh and cWh; learned capacity starts at design.
    pub fn apply_design_capacity(&mut self, profile: &BatteryProfile) -> ApplyReport {
        let mah = profile.design_capacity_mah as i32;
        self.write_verified_batch(&[
            (df::DESIGN_CAPACITY_MAH, mah),
            (df::DESIGN_CAPACITY_CWH, design_energy_cwh(profile)),
            (df::LEARNED_FULL_CHARGE_CAPACITY, mah),
        ])
    }

    /// Gas gauge and under-voltage thresholds derived from the cutoff.
    pub fn apply_discharge_cutoff(&mut self, profile: &BatteryProfile) -> ApplyReport {
        let cutoff = profile.discharge_cutoff_mv as i32;
        self.write_verified_batch(&[
            (df::FD_SET_VOLTAGE, cutoff),
            (df::FD_CLEAR_VOLTAGE, cutoff + FD_CLEAR_OFFSET),
            (df::TD_SET_VOLTAGE, cutoff),
            (df::TD_CLEAR_VOLTAGE, cutoff + TD_CLEAR_OFFSET),
            (df::EDV0, cutoff),
            (df::EDV1, cutoff + EDV1_OFFSET),
            (df::EDV2, cutoff + EDV2_OFFSET),
            (df::CUV_THRESHOLD, cutoff + CUV_THRESHOLD_OFFSET),
            (df::CUV_RECOVERY, cutoff + CUV_RECOVERY_OFFSET),
        ])
    }

    /// Temperature thresholds and their enable bits.
    ///
    /// Rejects an inverted window before writing anything.
    pub fn apply_temperature_protection(
        &mut self,
        window: &TemperatureWindow,
    ) -> Result<ApplyReport> {
        window.validate()?;
        let t = window.thresholds();
        let mut report = self.write_verified_batch(&[
            (df::OTC_THRESHOLD, t.otc),
            (df::OTC_RECOVERY, t.otc_recovery),
            (df::UTC_THRESHOLD, t.utc),
            (df::UTC_RECOVERY, t.utc_recovery),
            (df::OTD_THRESHOLD, t.otd),
            (df::OTD_RECOVERY, t.otd_recovery),
            (df::UTD_THRESHOLD, t.utd),
            (df::UTD_RECOVERY, t.utd_recovery),
        ]);

        let bits = |mask: u8| if window.enabled { mask } else { 0 };
        report.push(self.update_bits(
            &df::PROTECTION_ENABLE_B,
            PROTECTION_B_TEMP_MASK,
            bits(PROTECTION_B_TEMP_MASK),
        ));
        report.push(self.update_bits(
            &df::PROTECTION_ENABLE_D,
            PROTECTION_D_TEMP_MASK,
            bits(PROTECTION_D_TEMP_MASK),
        ));
        Ok(report)
    }

    /// Program cell voltage limits and the CEDV curve.
    pub fn apply_advanced(&mut self, profile: &AdvancedProfile) -> ApplyReport {
        info!(
            cuv = profile.cuv_mv,
            eoc = profile.eoc_mv,
            eoc_protect = profile.eoc_protect_mv,
            "Applying advanced profile"
        );
        let cuv = profile.cuv_mv as i32;
        let mut report = self.write_verified_batch(&[
            (df::CUV_THRESHOLD, cuv),
            (df::CUV_RECOVERY, cuv + CUV_RECOVERY_OFFSET),
        ]);
        report.extend(self.write_verified_batch(&same_in_bins(
            df::CHARGE_VOLTAGE_BINS,
            profile.eoc_mv,
        )));
        report.extend(self.write_verified_batch(&same_in_bins(
            df::COV_THRESHOLD_BINS,
            profile.eoc_protect_mv,
        )));
        let recovery = profile.eoc_protect_mv as i32 - COV_RECOVERY_GAP;
        let recovery_writes = df::COV_RECOVERY_BINS.map(|field| (field, recovery));
        report.extend(self.write_verified_batch(&recovery_writes));
        report.extend(self.apply_cedv(&profile.cedv));

        self.advanced = *profile;
        Self::log_summary("Advanced profile", &report);
        report
    }

    /// EDV breakpoints and the voltage-vs-depth-of-discharge points, verbatim.
    pub fn apply_cedv(&mut self, curve: &CedvCurve) -> ApplyReport {
        let mut report = self.write_verified_batch(&[
            (df::EDV0, curve.edv0_mv as i32),
            (df::EDV1, curve.edv1_mv as i32),
            (df::EDV2, curve.edv2_mv as i32),
        ]);
        for (field, &mv) in df::CEDV_VOLTAGE_POINTS.iter().zip(&curve.voltage_points_mv) {
            report.push(self.write_verified(field, mv as i32));
        }
        report
    }

    /// Rebuild the basic profile from the device.
    ///
    /// Any failed read, or an unrecognized chemistry code, fails the whole
    /// call and leaves the cached profile as it was.
    pub fn read_basic_config(&mut self) -> Result<BatteryProfile> {
        let code = self
            .bus
            .read_dataflash(
                df::DEVICE_CHEMISTRY.address,
                df::DEVICE_CHEMISTRY.width,
                df::DEVICE_CHEMISTRY.kind,
            )?
            .text();
        let chemistry = Chemistry::from_code(&code)
            .ok_or_else(|| Error::validation(format!("unknown chemistry code {:?}", code)))?;

        let da_config = self.read_field(&df::DA_CONFIGURATION)? as u8;
        let deci_c = |raw: i32| (raw / 10) as i16;
        let temperature = TemperatureWindow {
            charge_high_c: deci_c(self.read_field(&df::OTC_THRESHOLD)?),
            charge_low_c: deci_c(self.read_field(&df::UTC_THRESHOLD)?),
            discharge_high_c: deci_c(self.read_field(&df::OTD_THRESHOLD)?),
            discharge_low_c: deci_c(self.read_field(&df::UTD_THRESHOLD)?),
            enabled: self.bits_set(&df::PROTECTION_ENABLE_B, PROTECTION_B_TEMP_MASK)?
                && self.bits_set(&df::PROTECTION_ENABLE_D, PROTECTION_D_TEMP_MASK)?,
        };

        let profile = BatteryProfile {
            chemistry,
            cell_number: (da_config & DA_CONFIG_CELL_MASK) + 1,
            design_capacity_mah: self.read_field(&df::DESIGN_CAPACITY_MAH)? as u16,
            discharge_cutoff_mv: self.read_field(&df::FD_SET_VOLTAGE)? as u16,
            temperature,
        };
        debug!("Read back {:?}", profile);
        self.profile = profile;
        Ok(profile)
    }

    /// Rebuild the advanced profile from the device.
    ///
    /// The standard-temperature bins stand in for all four.
    pub fn read_advanced_config(&mut self) -> Result<AdvancedProfile> {
        let mut mv = |field: &DataflashField| -> Result<u16> { Ok(self.read_field(field)? as u16) };

        let cuv_mv = mv(&df::CUV_THRESHOLD)?;
        let eoc_mv = mv(&df::CHARGE_VOLTAGE_STD_TEMP)?;
        let eoc_protect_mv = mv(&df::COV_THRESHOLD_STD_TEMP)?;
        let edv0_mv = mv(&df::EDV0)?;
        let edv1_mv = mv(&df::EDV1)?;
        let edv2_mv = mv(&df::EDV2)?;
        let mut voltage_points_mv = [0u16; 11];
        for (slot, field) in voltage_points_mv.iter_mut().zip(&df::CEDV_VOLTAGE_POINTS) {
            *slot = mv(field)?;
        }

        let profile = AdvancedProfile {
            cuv_mv,
            eoc_mv,
            eoc_protect_mv,
            cedv: CedvCurve {
                edv0_mv,
                edv1_mv,
                edv2_mv,
                voltage_points_mv,
            },
        };
        debug!("Read back {:?}", profile);
        self.advanced = profile;
        Ok(profile)
    }

    /// Toggle the charge and discharge FETs.
    pub fn toggle_fet(&mut self) -> Result<()> {
        info!("Toggling FETs");
        self.bus.mac_command(mac::FET_CONTROL)?;
        self.bus.settle();
        Ok(())
    }

    /// Toggle the FETs if they are not already in the requested state, then
    /// confirm through ManufacturerStatus.
    pub fn set_fet_enabled(&mut self, enable: bool) -> Result<()> {
        if self.read_fet_enabled()? != enable {
            self.toggle_fet()?;
        }
        let now = self.read_fet_enabled()?;
        self.status.fet_enabled = now;
        if now != enable {
            return Err(Error::Verification {
                field: catalog::MANUFACTURER_STATUS.name,
                written: format!("fet_enable={}", enable),
                read: format!("fet_enable={}", now),
            });
        }
        Ok(())
    }

    /// Restart the gauge firmware.
    pub fn reset_gauge(&mut self) -> Result<()> {
        info!("Resetting gauge");
        self.bus.mac_command(mac::DEVICE_RESET)?;
        self.bus.settle();
        Ok(())
    }

    pub(super) fn read_fet_enabled(&mut self) -> Result<bool> {
        let block = catalog::MANUFACTURER_STATUS;
        let data = self.bus.read_mac_block(block.command, block.len)?;
        Ok(super::telemetry::le_u16(&data, 0, block.command)? & catalog::FET_EN != 0)
    }

    fn bits_set(&mut self, field: &DataflashField, mask: u8) -> Result<bool> {
        Ok(self.read_field(field)? as u8 & mask == mask)
    }

    fn log_summary(what: &str, report: &ApplyReport) {
        if report.ok() {
            info!("{} applied, {} fields verified", what, report.verified());
        } else {
            let failed: Vec<_> = report.failures().map(|f| f.name).collect();
            warn!(
                "{} partially applied: {} of {} fields verified, failed {:?}",
                what,
                report.verified(),
                report.fields.len(),
                failed
            );
        }
    }
}

/// Design energy in cWh: cells x nominal V x mAh / 10.
fn design_energy_cwh(profile: &BatteryProfile) -> i32 {
    let cells = profile.effective_cells() as i64;
    let nominal_mv = profile.chemistry.nominal_mv() as i64;
    let cwh = cells * nominal_mv * profile.design_capacity_mah as i64 / 10_000;
    i32::try_from(cwh).unwrap_or(i32::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{gauge::tests::gauge, sim::SimulatedGauge};
    use test_case::test_case;

    fn read(gauge: &mut Gauge<SimulatedGauge, crate::hw_trait::NoDelay>, f: DataflashField) -> i32 {
        gauge.read_field(&f).unwrap()
    }

    #[test_case(Chemistry::LiFePO4, 3600, 3750, 3600, "LFE4")]
    #[test_case(Chemistry::LiIon, 4200, 4300, 4100, "LION")]
    #[test_case(Chemistry::LiPo, 4200, 4300, 4100, "LIPO")]
    fn chemistry_in_all_bins(chem: Chemistry, charge: i32, threshold: i32, recovery: i32, code: &str) {
        let mut gauge = gauge(SimulatedGauge::new());
        let profile = BatteryProfile {
            chemistry: chem,
            ..Default::default()
        };
        let report = gauge.apply_chemistry(&profile);
        assert!(report.ok());
        assert_eq!(report.fields.len(), 13);

        for i in 0..4 {
            assert_eq!(read(&mut gauge, df::CHARGE_VOLTAGE_BINS[i]), charge);
            assert_eq!(read(&mut gauge, df::COV_THRESHOLD_BINS[i]), threshold);
            assert_eq!(read(&mut gauge, df::COV_RECOVERY_BINS[i]), recovery);
        }
        let stored = gauge.bus().i2c().dataflash(df::DEVICE_CHEMISTRY.address, 5);
        assert_eq!(stored[0], 4);
        assert_eq!(&stored[1..], code.as_bytes());
    }

    #[test_case(2, 0b01, 7200)]
    #[test_case(4, 0b11, 14400)]
    #[test_case(7, 0b11, 14400)]
    fn cell_count_packs_bits(cells: u8, bits: i32, design_mv: i32) {
        let mut sim = SimulatedGauge::new();
        sim.set_dataflash(df::DA_CONFIGURATION.address, &[0xfc]);
        let mut gauge = gauge(sim);
        let profile = BatteryProfile {
            cell_number: cells,
            ..Default::default()
        };
        assert!(gauge.apply_cell_count(&profile).ok());
        assert_eq!(read(&mut gauge, df::DA_CONFIGURATION), 0xfc | bits);
        assert_eq!(read(&mut gauge, df::DESIGN_VOLTAGE), design_mv);
    }

    #[test]
    fn capacity_and_energy() {
        let mut gauge = gauge(SimulatedGauge::new());
        let report = gauge.apply_design_capacity(&BatteryProfile::default());
        assert!(report.ok());
        assert_eq!(read(&mut gauge, df::DESIGN_CAPACITY_MAH), 3200);
        // 4 x 3.6 V x 3200 mAh
        assert_eq!(read(&mut gauge, df::DESIGN_CAPACITY_CWH), 4608);
        assert_eq!(read(&mut gauge, df::LEARNED_FULL_CHARGE_CAPACITY), 3200);
    }

    #[test]
    fn cutoff_offsets() {
        let mut gauge = gauge(SimulatedGauge::new());
        let report = gauge.apply_discharge_cutoff(&BatteryProfile::default());
        assert!(report.ok());
        assert_eq!(report.fields.len(), 9);
        let expect = [
            (df::FD_SET_VOLTAGE, 2800),
            (df::FD_CLEAR_VOLTAGE, 2900),
            (df::TD_SET_VOLTAGE, 2800),
            (df::TD_CLEAR_VOLTAGE, 2900),
            (df::EDV0, 2800),
            (df::EDV1, 2820),
            (df::EDV2, 2830),
            (df::CUV_THRESHOLD, 2750),
            (df::CUV_RECOVERY, 2900),
        ];
        for (field, value) in expect {
            assert_eq!(read(&mut gauge, field), value, "{}", field.name);
        }
    }

    #[test]
    fn temperature_thresholds_and_enable_bits() {
        let mut gauge = gauge(SimulatedGauge::new());
        let report = gauge
            .apply_temperature_protection(&TemperatureWindow::default())
            .unwrap();
        assert!(report.ok());
        assert_eq!(read(&mut gauge, df::OTC_THRESHOLD), 600);
        assert_eq!(read(&mut gauge, df::OTC_RECOVERY), 550);
        assert_eq!(read(&mut gauge, df::UTC_THRESHOLD), -100);
        assert_eq!(read(&mut gauge, df::UTC_RECOVERY), -50);
        assert_eq!(read(&mut gauge, df::PROTECTION_ENABLE_B) & 0x30, 0x30);
        assert_eq!(read(&mut gauge, df::PROTECTION_ENABLE_D) & 0x0c, 0x0c);

        let disabled = TemperatureWindow {
            enabled: false,
            ..Default::default()
        };
        assert!(gauge.apply_temperature_protection(&disabled).unwrap().ok());
        assert_eq!(read(&mut gauge, df::PROTECTION_ENABLE_B) & 0x30, 0);
        assert_eq!(read(&mut gauge, df::PROTECTION_ENABLE_D) & 0x0c, 0);
    }

    #[test]
    fn invalid_window_writes_nothing() {
        let mut gauge = gauge(SimulatedGauge::new());
        let profile = BatteryProfile {
            temperature: TemperatureWindow {
                charge_high_c: -10,
                charge_low_c: 60,
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(matches!(gauge.apply(&profile), Err(Error::Validation(_))));
        assert_eq!(gauge.bus().i2c().dataflash_writes(), 0);
        assert_eq!(*gauge.profile(), BatteryProfile::default());
    }

    #[test]
    fn apply_then_read_back() {
        let mut gauge = gauge(SimulatedGauge::new());
        let profile = BatteryProfile::default();

        let report = gauge.apply(&profile).unwrap();
        assert!(report.ok(), "{:?}", report.failures().collect::<Vec<_>>());
        assert_eq!(report.verified(), report.fields.len());

        assert_eq!(gauge.read_basic_config().unwrap(), profile);
    }

    #[test]
    fn apply_reports_failure_but_finishes() {
        let mut sim = SimulatedGauge::new();
        sim.fail_dataflash_write(3);
        let mut gauge = gauge(sim);

        let report = gauge.apply(&BatteryProfile::default()).unwrap();
        assert!(!report.ok());
        assert_eq!(report.verified(), report.fields.len() - 1);
        // The last step still ran
        assert_eq!(read(&mut gauge, df::UTD_RECOVERY), -50);
    }

    #[test]
    fn unknown_chemistry_code_yields_no_profile() {
        let mut sim = SimulatedGauge::new();
        sim.set_dataflash(df::DEVICE_CHEMISTRY.address, &[4, b'N', b'I', b'M', b'H']);
        let mut gauge = gauge(sim);
        assert!(matches!(gauge.read_basic_config(), Err(Error::Validation(_))));
        assert_eq!(*gauge.profile(), BatteryProfile::default());
    }

    #[test]
    fn lowercase_chemistry_code_accepted() {
        let mut gauge = gauge(SimulatedGauge::new());
        assert!(gauge.apply(&BatteryProfile::default()).unwrap().ok());
        gauge
            .bus_mut()
            .i2c_mut()
            .set_dataflash(df::DEVICE_CHEMISTRY.address, &[4, b'l', b'i', b'p', b'o']);
        assert_eq!(gauge.read_basic_config().unwrap().chemistry, Chemistry::LiPo);
    }

    #[test]
    fn one_disabled_group_reads_as_disabled() {
        let mut gauge = gauge(SimulatedGauge::new());
        assert!(gauge.apply(&BatteryProfile::default()).unwrap().ok());
        gauge
            .bus_mut()
            .i2c_mut()
            .set_dataflash(df::PROTECTION_ENABLE_D.address, &[0x00]);
        assert!(!gauge.read_basic_config().unwrap().temperature.enabled);
    }

    #[test]
    fn advanced_round_trip() {
        let mut gauge = gauge(SimulatedGauge::new());
        let profile = AdvancedProfile {
            cuv_mv: 2600,
            eoc_mv: 3550,
            eoc_protect_mv: 3700,
            ..Default::default()
        };
        let report = gauge.apply_advanced(&profile);
        assert!(report.ok());
        // 2 CUV, 12 binned voltages, 3 EDV, 11 curve points
        assert_eq!(report.fields.len(), 28);
        for field in df::COV_RECOVERY_BINS {
            assert_eq!(read(&mut gauge, field), 3600);
        }
        assert_eq!(read(&mut gauge, df::CUV_RECOVERY), 2700);
        assert_eq!(gauge.read_advanced_config().unwrap(), profile);
    }

    #[test]
    fn fet_toggled_only_when_needed() {
        let mut gauge = gauge(SimulatedGauge::new());
        assert!(gauge.read_fet_enabled().unwrap());

        gauge.set_fet_enabled(true).unwrap();
        assert_eq!(gauge.bus().i2c().fet_toggles(), 0);

        gauge.set_fet_enabled(false).unwrap();
        assert_eq!(gauge.bus().i2c().fet_toggles(), 1);
        assert!(!gauge.status().fet_enabled);
    }

    #[test_case(mac::FET_CONTROL; "fet control")]
    #[test_case(mac::DEVICE_RESET; "device reset")]
    fn lost_action_ack_is_not_resent(command: u16) {
        use crate::{
            hw_trait::NoDelay,
            smbus::{Bus, BusConfig},
        };

        let mut sim = SimulatedGauge::new();
        sim.lose_ack(command);
        // Retries enabled for everything else on the bus
        let mut gauge = Gauge::new(Bus::new(sim, NoDelay, BusConfig::default()));

        let result = match command {
            mac::FET_CONTROL => gauge.toggle_fet(),
            _ => gauge.reset_gauge(),
        };
        assert!(matches!(result, Err(Error::Bus(_))));
        let sim = gauge.bus().i2c();
        assert_eq!(sim.fet_toggles() + sim.resets(), 1);
    }

    #[test]
    fn reset_sends_device_reset() {
        let mut gauge = gauge(SimulatedGauge::new());
        gauge.reset_gauge().unwrap();
        assert_eq!(gauge.bus().i2c().resets(), 1);
    }
}
