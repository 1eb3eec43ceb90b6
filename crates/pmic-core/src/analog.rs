//! Analog acquisition: averaged multi-channel sampling and calibration.

use core::cell::Cell;

use critical_section::Mutex;

use crate::config::{Config, DCIN_IGNORE_GUARD, TempCalibration};

/// ADC full-scale code (12 bit).
pub const ADC_FULL_SCALE: i32 = 4095;

/// Reference voltage at which factory calibration values were taken.
pub const VREF_CAL_MV: i32 = 3300;

/// Position of each channel inside one conversion frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Channel {
    Dcin = 0,
    Vbat,
    BatTemp,
    CpuTemp,
    Vref,
}

pub const CHANNELS: usize = 5;

/// Raw codes of one conversion sequence, indexed by [`Channel`].
pub type Frame = [u16; CHANNELS];

/// Per-chip values programmed at the factory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FactoryCalibration {
    /// VREFINT code measured at [`VREF_CAL_MV`].
    pub vrefint_cal: u16,
    /// Temperature sensor code at 30 °C.
    pub ts_cal1: u16,
    /// Temperature sensor code at 110 °C.
    pub ts_cal2: u16,
}

impl FactoryCalibration {
    pub fn cpu_temp(&self) -> TempCalibration {
        TempCalibration {
            t: [30_000, 110_000],
            value: [self.ts_cal1 as i32, self.ts_cal2 as i32],
        }
    }
}

/// The sampling hardware and the pins it shares with edge detection.
pub trait AdcFrontend {
    /// Switches DCIN/VBAT sense pins to analog mode (disabling their edge
    /// interrupts) and powers the temperature divider, or back.
    fn route_to_adc(&mut self, adc: bool);

    fn set_powered(&mut self, on: bool);

    /// Runs one conversion sequence over all [`CHANNELS`] and blocks until
    /// the completion interrupt reports it done.
    fn convert(&mut self) -> Frame;

    /// Power key level, sampled between conversions.
    fn pwr_key_level(&self) -> bool;

    /// Digital level of the DCIN sense pin.
    fn dcin_sense_level(&self) -> bool;
}

/// Completion flag set from the conversion interrupt and polled by the
/// foreground with a low-power wait in between.
pub struct CompletionFlag(Mutex<Cell<bool>>);

impl CompletionFlag {
    pub const fn new() -> Self {
        Self(Mutex::new(Cell::new(false)))
    }

    pub fn clear(&self) {
        critical_section::with(|cs| self.0.borrow(cs).set(false));
    }

    /// Called from interrupt context.
    pub fn signal(&self) {
        critical_section::with(|cs| self.0.borrow(cs).set(true));
    }

    pub fn is_set(&self) -> bool {
        critical_section::with(|cs| self.0.borrow(cs).get())
    }

    /// Spins on `wait` (typically `wfi`) until the flag is set, then clears it.
    pub fn wait(&self, mut wait: impl FnMut()) {
        while !self.is_set() {
            wait();
        }
        self.clear();
    }
}

impl Default for CompletionFlag {
    fn default() -> Self {
        Self::new()
    }
}

/// Scales a raw code to millivolts against a live reference and a divider
/// ratio in thousandths. The operation order is part of the calibration.
pub fn to_voltage(raw: i32, vref: i32, ratio: i32) -> i32 {
    let mv = raw as i64 * vref as i64 / ADC_FULL_SCALE as i64 * ratio as i64 / 1000;
    saturate(mv)
}

fn saturate(value: i64) -> i32 {
    value.clamp(i32::MIN as i64, i32::MAX as i64) as i32
}

/// Two-point linear interpolation into millidegrees.
pub fn to_temperature(raw: i32, calibration: &TempCalibration) -> i32 {
    let [t0, t1] = calibration.t.map(i64::from);
    let [v0, v1] = calibration.value.map(i64::from);
    saturate(t0 - (v0 - raw as i64) * (t1 - t0) / (v1 - v0))
}

/// Battery charge in thousandths of a percent, clamped to 0..=100_000.
pub fn battery_percent(vbat: i32, v_min: i32, v_max: i32) -> i32 {
    let pct = (vbat as i64 - v_min as i64) * 100 * 1000 / (v_max as i64 - v_min as i64);
    pct.clamp(0, 100 * 1000) as i32
}

/// Calibrated values of the last completed acquisition.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Measurement {
    pub vbat: i32,
    pub dcin: i32,
    pub bat_temp: i32,
    /// Battery temperature sensor voltage, mV.
    pub bat_temp_raw: i32,
    pub cpu_temp: i32,
    pub dcin_present: bool,
    /// Clock time the acquisition finished at.
    pub taken_at: i64,
}

pub struct AnalogMon {
    config: Config,
    factory: FactoryCalibration,
    measurement: Measurement,
    ignore_dcin: bool,
    ignore_dcin_until: i64,
}

impl AnalogMon {
    pub fn new(config: Config, factory: FactoryCalibration) -> Self {
        Self {
            config,
            factory,
            measurement: Measurement::default(),
            ignore_dcin: false,
            ignore_dcin_until: 0,
        }
    }

    /// Performs one blocking acquisition cycle and publishes the results.
    pub fn read<A: AdcFrontend + ?Sized>(&mut self, adc: &mut A, now: i64) {
        adc.route_to_adc(true);
        adc.set_powered(true);

        let rounds = self.config.adc_avg_count.max(1);
        let mut sum = [0u32; CHANNELS];
        let mut pwr_key_pressed = false;
        for _ in 0..rounds {
            let frame = adc.convert();
            for (acc, code) in sum.iter_mut().zip(frame) {
                *acc += code as u32;
            }
            if adc.pwr_key_level() {
                pwr_key_pressed = true;
            }
        }

        adc.set_powered(false);
        adc.route_to_adc(false);

        let avg = sum.map(|acc| (acc / rounds) as i32);
        if avg[Channel::Vref as usize] == 0 {
            log::warn!("ADC reference reads zero, keeping previous measurement");
            return;
        }

        let vref_code = avg[Channel::Vref as usize] as i64;
        let vrefint = saturate(VREF_CAL_MV as i64 * self.factory.vrefint_cal as i64 / vref_code);
        let m = &mut self.measurement;
        m.vbat = to_voltage(avg[Channel::Vbat as usize], vrefint, self.config.vbat_rdiv);
        m.cpu_temp = to_temperature(avg[Channel::CpuTemp as usize], &self.factory.cpu_temp());
        m.bat_temp_raw = to_voltage(avg[Channel::BatTemp as usize], vrefint, 1000);
        m.bat_temp = to_temperature(m.bat_temp_raw, &self.config.bat_temp);
        m.taken_at = now;

        // Pressing the key disturbs the DCIN sense line.
        if !pwr_key_pressed && !self.ignore_dcin && now >= self.ignore_dcin_until {
            m.dcin = to_voltage(avg[Channel::Dcin as usize], vrefint, self.config.dcin_rdiv);
            m.dcin_present = adc.dcin_sense_level();
        }
    }

    /// Freezes (or unfreezes) the DCIN reading; it stays frozen for a guard
    /// time after the call either way.
    pub fn ignore_dcin_voltage(&mut self, ignore: bool, now: i64) {
        self.ignore_dcin = ignore;
        self.ignore_dcin_until = now + DCIN_IGNORE_GUARD;
    }

    pub fn measurement(&self) -> &Measurement {
        &self.measurement
    }

    pub fn vbat(&self) -> i32 {
        self.measurement.vbat
    }

    /// DCIN voltage, 0 while no input is present.
    pub fn dcin(&self) -> i32 {
        if self.measurement.dcin_present { self.measurement.dcin } else { 0 }
    }

    pub fn bat_temp(&self) -> i32 {
        self.measurement.bat_temp
    }

    pub fn bat_temp_raw(&self) -> i32 {
        self.measurement.bat_temp_raw
    }

    pub fn cpu_temp(&self) -> i32 {
        self.measurement.cpu_temp
    }

    pub fn bat_pct(&self) -> i32 {
        let bat = &self.config.battery;
        battery_percent(self.measurement.vbat, bat.v_min, bat.v_max)
    }

    pub fn is_dcin_present(&self) -> bool {
        self.measurement.dcin_present
    }

    pub fn is_dcin_good(&self) -> bool {
        self.is_dcin_present() && self.measurement.dcin >= self.config.dcin_min_voltage
    }

    pub fn is_bat_present(&self) -> bool {
        self.measurement.vbat >= self.config.battery.v_presence
    }

    pub fn is_bat_discharged(&self) -> bool {
        self.measurement.vbat <= self.config.battery.v_shutdown
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FACTORY: FactoryCalibration = FactoryCalibration {
        vrefint_cal: 1500,
        ts_cal1: 1750,
        ts_cal2: 1330,
    };

    /// Returns the same frame every round and records pin handling.
    struct FakeAdc {
        frame: Frame,
        key: bool,
        dcin_level: bool,
        routed_to_adc: bool,
        powered: bool,
        conversions: u32,
        conversions_while_unrouted: u32,
    }

    impl FakeAdc {
        fn new(frame: Frame) -> Self {
            Self {
                frame,
                key: false,
                dcin_level: true,
                routed_to_adc: false,
                powered: false,
                conversions: 0,
                conversions_while_unrouted: 0,
            }
        }
    }

    impl AdcFrontend for FakeAdc {
        fn route_to_adc(&mut self, adc: bool) {
            self.routed_to_adc = adc;
        }

        fn set_powered(&mut self, on: bool) {
            self.powered = on;
        }

        fn convert(&mut self) -> Frame {
            self.conversions += 1;
            if !(self.routed_to_adc && self.powered) {
                self.conversions_while_unrouted += 1;
            }
            self.frame
        }

        fn pwr_key_level(&self) -> bool {
            self.key
        }

        fn dcin_sense_level(&self) -> bool {
            self.dcin_level
        }
    }

    #[test]
    fn to_voltage_keeps_truncation_order() {
        assert_eq!(to_voltage(2048, 3300, 2000), 2048 * 3300 / 4095 * 2000 / 1000);
        assert_eq!(to_voltage(2048, 3300, 2000), 3300);
        assert_eq!(to_voltage(0, 3300, 2000), 0);
        assert_eq!(to_voltage(4095, 3300, 1000), 3300);
    }

    #[test]
    fn to_temperature_hits_calibration_points() {
        let cal = Config::DEFAULT.bat_temp;
        assert_eq!(to_temperature(592, &cal), 19_000);
        assert_eq!(to_temperature(536, &cal), 45_000);
        // 564 mV sits halfway
        assert_eq!(to_temperature(564, &cal), 32_000);
        // Outside the points it extrapolates, truncating toward zero
        assert_eq!(to_temperature(600, &cal), 19_000 - (-8 * 26_000 / -56));
        assert_eq!(to_temperature(600, &cal), 15_286);
    }

    #[test]
    fn battery_percent_is_clamped() {
        assert_eq!(battery_percent(3_400, 3_400, 4_150), 0);
        assert_eq!(battery_percent(3_000, 3_400, 4_150), 0);
        assert_eq!(battery_percent(4_150, 3_400, 4_150), 100_000);
        assert_eq!(battery_percent(4_400, 3_400, 4_150), 100_000);
        assert_eq!(battery_percent(3_775, 3_400, 4_150), 50_000);
    }

    #[test]
    fn read_averages_and_restores_pins() {
        let mut mon = AnalogMon::new(Config::DEFAULT, FACTORY);
        // VREF code equal to the factory value means vrefint = 3300 mV.
        let mut adc = FakeAdc::new([2900, 2300, 700, 1750, 1500]);
        mon.read(&mut adc, 10);

        assert_eq!(adc.conversions, Config::DEFAULT.adc_avg_count);
        assert_eq!(adc.conversions_while_unrouted, 0);
        assert!(!adc.routed_to_adc);
        assert!(!adc.powered);

        let m = mon.measurement();
        assert_eq!(m.vbat, to_voltage(2300, 3300, 2000));
        assert_eq!(m.dcin, to_voltage(2900, 3300, 2000));
        assert_eq!(m.cpu_temp, 30_000);
        assert_eq!(m.bat_temp_raw, to_voltage(700, 3300, 1000));
        assert_eq!(m.taken_at, 10);
        assert!(mon.is_dcin_present());
        assert!(mon.is_dcin_good());
        assert!(mon.is_bat_present());
    }

    #[test]
    fn key_press_during_sampling_freezes_dcin_only() {
        let mut mon = AnalogMon::new(Config::DEFAULT, FACTORY);
        let mut adc = FakeAdc::new([2900, 2300, 700, 1750, 1500]);
        mon.read(&mut adc, 0);
        let dcin_before = mon.dcin();

        adc.frame = [1000, 2000, 700, 1750, 1500];
        adc.key = true;
        mon.read(&mut adc, 100);
        assert_eq!(mon.dcin(), dcin_before);
        assert_eq!(mon.vbat(), to_voltage(2000, 3300, 2000));
    }

    #[test]
    fn ignore_window_outlives_the_release() {
        let mut mon = AnalogMon::new(Config::DEFAULT, FACTORY);
        let mut adc = FakeAdc::new([2900, 2300, 700, 1750, 1500]);
        mon.read(&mut adc, 0);

        mon.ignore_dcin_voltage(true, 100);
        adc.frame[Channel::Dcin as usize] = 100;
        mon.read(&mut adc, 200);
        assert_eq!(mon.dcin(), to_voltage(2900, 3300, 2000));

        mon.ignore_dcin_voltage(false, 300);
        mon.read(&mut adc, 1_299);
        assert_eq!(mon.dcin(), to_voltage(2900, 3300, 2000));
        mon.read(&mut adc, 1_300);
        assert_eq!(mon.dcin(), to_voltage(100, 3300, 2000));
    }

    #[test]
    fn zero_reference_keeps_stale_values() {
        let mut mon = AnalogMon::new(Config::DEFAULT, FACTORY);
        let mut adc = FakeAdc::new([2900, 2300, 700, 1750, 1500]);
        mon.read(&mut adc, 0);
        let before = *mon.measurement();

        adc.frame = [0; CHANNELS];
        mon.read(&mut adc, 50);
        assert_eq!(*mon.measurement(), before);
    }

    #[test]
    fn tiny_reference_saturates_instead_of_wrapping() {
        let mut mon = AnalogMon::new(Config::DEFAULT, FACTORY);
        let mut adc = FakeAdc::new([2900, 2300, 700, 1750, 1]);
        mon.read(&mut adc, 0);

        // vrefint = 3300 * 1500 / 1 = 4_950_000 mV, far out of range but finite
        assert_eq!(mon.vbat(), (2300i64 * 4_950_000 / 4095 * 2000 / 1000) as i32);
        assert_eq!(mon.dcin(), (2900i64 * 4_950_000 / 4095 * 2000 / 1000) as i32);
        assert!(mon.is_bat_present());
        assert_eq!(mon.bat_pct(), 100_000);
    }

    #[test]
    fn completion_flag_waits_for_signal() {
        let flag = CompletionFlag::new();
        let mut waits = 0;
        flag.wait(|| {
            waits += 1;
            if waits == 3 {
                flag.signal();
            }
        });
        assert_eq!(waits, 3);
        assert!(!flag.is_set());
    }
}
