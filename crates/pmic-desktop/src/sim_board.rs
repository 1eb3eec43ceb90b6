//! Simulated board: analog front-end, outputs, backup domain and RTC.
//!
//! Physical inputs live in [`SimInputs`], shared with the control panel.
//! Outputs driven by the firmware land in [`SimOutputs`].

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use pmic_core::analog::{
    ADC_FULL_SCALE, AdcFrontend, Channel, CompletionFlag, FactoryCalibration, Frame, VREF_CAL_MV,
};
use pmic_core::board::Board;
use pmic_core::config::Config;
use pmic_core::rtc::{DateTime, TimeService};
use pmic_core::scheduler::{IdleTimer, Timebase};

use crate::buzzer::DesktopBuzzer;

/// Typical values of a real part.
pub const FACTORY: FactoryCalibration = FactoryCalibration {
    vrefint_cal: 1_500,
    ts_cal1: 1_050,
    ts_cal2: 1_380,
};

const CPU_TEMP: i32 = 35_000;
/// How often blocking waits look for wake requests.
const WAKE_POLL: Duration = Duration::from_millis(5);

pub fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Clone, Debug)]
pub struct SimInputs {
    pub vbat_mv: i32,
    pub dcin_mv: i32,
    pub bat_temp: i32,
    pub dcin_plugged: bool,
    pub pwr_key: bool,
    pub charger_active: bool,
}

impl Default for SimInputs {
    fn default() -> Self {
        Self {
            vbat_mv: 3_800,
            dcin_mv: 5_000,
            bat_temp: 25_000,
            dcin_plugged: false,
            pwr_key: false,
            charger_active: false,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct SimOutputs {
    pub system_power: bool,
    pub charger_enabled: bool,
    pub host_irq: bool,
    pub watchdog_feeds: u32,
    pub backup: u32,
    pub asleep: bool,
}

/// Converts a voltage behind a divider (ratio in thousandths) to the code a
/// 12-bit ADC at 3.3 V would read.
fn code_for(mv: i32, ratio: i32) -> u16 {
    (mv * 1000 / ratio * ADC_FULL_SCALE / VREF_CAL_MV).clamp(0, ADC_FULL_SCALE) as u16
}

pub struct SimAdc {
    inputs: Arc<Mutex<SimInputs>>,
    config: Config,
    done: CompletionFlag,
    powered: bool,
}

impl SimAdc {
    fn frame(&self) -> Frame {
        let inputs = lock(&self.inputs);
        let dcin = if inputs.dcin_plugged { inputs.dcin_mv } else { 0 };

        // inverse of the two-point sensor calibration
        let cal = self.config.bat_temp;
        let sensor_mv = cal.value[0] + (inputs.bat_temp - cal.t[0]) * (cal.value[1] - cal.value[0]) / (cal.t[1] - cal.t[0]);
        let cpu = FACTORY.cpu_temp();
        let cpu_code = cpu.value[0] + (CPU_TEMP - cpu.t[0]) * (cpu.value[1] - cpu.value[0]) / (cpu.t[1] - cpu.t[0]);

        let mut frame = [0; 5];
        frame[Channel::Dcin as usize] = code_for(dcin, self.config.dcin_rdiv);
        frame[Channel::Vbat as usize] = code_for(inputs.vbat_mv, self.config.vbat_rdiv);
        frame[Channel::BatTemp as usize] = if self.powered { code_for(sensor_mv, 1000) } else { 0 };
        frame[Channel::CpuTemp as usize] = cpu_code as u16;
        frame[Channel::Vref as usize] = FACTORY.vrefint_cal;
        frame
    }
}

impl AdcFrontend for SimAdc {
    fn route_to_adc(&mut self, _adc: bool) {}

    fn set_powered(&mut self, on: bool) {
        self.powered = on;
    }

    fn convert(&mut self) -> Frame {
        self.done.clear();
        let mut frame = [0; 5];
        // the conversion completes on another thread, like a DMA interrupt
        thread::scope(|s| {
            s.spawn(|| {
                frame = self.frame();
                self.done.signal();
            });
            self.done.wait(thread::yield_now);
        });
        frame
    }

    fn pwr_key_level(&self) -> bool {
        lock(&self.inputs).pwr_key
    }

    fn dcin_sense_level(&self) -> bool {
        lock(&self.inputs).dcin_plugged
    }
}

/// Wall clock with a settable offset.
pub struct SimRtc {
    offset: AtomicI64,
}

impl SimRtc {
    pub const fn new() -> Self {
        Self { offset: AtomicI64::new(0) }
    }

    fn host_seconds() -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0)
    }
}

impl TimeService for SimRtc {
    fn now(&self) -> u32 {
        (Self::host_seconds() + self.offset.load(Ordering::Relaxed)).clamp(0, u32::MAX as i64) as u32
    }

    fn set_date_time(&self, dt: &DateTime) {
        self.offset.store(dt.to_unix() as i64 - Self::host_seconds(), Ordering::Relaxed);
    }
}

pub struct SimBoard {
    adc: SimAdc,
    buzzer: DesktopBuzzer,
    inputs: Arc<Mutex<SimInputs>>,
    outputs: Arc<Mutex<SimOutputs>>,
    timebase: &'static Timebase,
}

impl SimBoard {
    pub fn new(
        config: Config,
        inputs: Arc<Mutex<SimInputs>>,
        outputs: Arc<Mutex<SimOutputs>>,
        timebase: &'static Timebase,
    ) -> Self {
        Self {
            adc: SimAdc {
                inputs: Arc::clone(&inputs),
                config,
                done: CompletionFlag::new(),
                powered: false,
            },
            buzzer: DesktopBuzzer::new(),
            inputs,
            outputs,
            timebase,
        }
    }
}

impl Board for SimBoard {
    type Adc = SimAdc;
    type Rtc = SimRtc;
    type Buzzer = DesktopBuzzer;

    fn adc(&mut self) -> &mut SimAdc {
        &mut self.adc
    }

    fn buzzer(&self) -> &DesktopBuzzer {
        &self.buzzer
    }

    fn factory_calibration(&self) -> FactoryCalibration {
        FACTORY
    }

    fn set_charger_enabled(&mut self, enabled: bool) {
        lock(&self.outputs).charger_enabled = enabled;
    }

    fn set_system_power(&mut self, on: bool) {
        lock(&self.outputs).system_power = on;
    }

    fn set_host_irq(&mut self, asserted: bool) {
        lock(&self.outputs).host_irq = asserted;
    }

    fn charger_active(&self) -> bool {
        lock(&self.inputs).charger_active
    }

    fn feed_watchdog(&mut self) {
        lock(&self.outputs).watchdog_feeds += 1;
    }

    fn save_backup(&mut self, value: u32) {
        lock(&self.outputs).backup = value;
    }

    fn load_backup(&self) -> u32 {
        lock(&self.outputs).backup
    }

    fn suspend(&mut self) -> u32 {
        lock(&self.outputs).asleep = true;
        let start = Instant::now();
        while !self.timebase.has_pending() && !crate::quit_requested() {
            thread::sleep(WAKE_POLL);
        }
        lock(&self.outputs).asleep = false;
        start.elapsed().as_millis() as u32
    }
}

/// Idle waits in real time. A wake request cuts a sleep short.
pub struct RealTimeTimer {
    timebase: &'static Timebase,
}

impl RealTimeTimer {
    pub fn new(timebase: &'static Timebase) -> Self {
        Self { timebase }
    }
}

impl IdleTimer for RealTimeTimer {
    fn max_idle_ms(&self) -> u32 {
        0xFF_FFFF / 1000
    }

    fn wait_for_interrupt(&mut self) {
        thread::sleep(Duration::from_millis(1));
        self.timebase.tick();
    }

    fn sleep_for(&mut self, ms: u32) -> u32 {
        let start = Instant::now();
        let budget = Duration::from_millis(ms as u64);
        while start.elapsed() < budget && !self.timebase.has_pending() && !crate::quit_requested() {
            thread::sleep(WAKE_POLL.min(budget - start.elapsed().min(budget)));
        }
        (start.elapsed().as_millis() as u32).min(ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pmic_core::analog::AnalogMon;

    fn sampled(inputs: SimInputs) -> AnalogMon {
        let config = Config::DEFAULT;
        let mut adc = SimAdc {
            inputs: Arc::new(Mutex::new(inputs)),
            config,
            done: CompletionFlag::new(),
            powered: false,
        };
        let mut mon = AnalogMon::new(config, FACTORY);
        mon.read(&mut adc, 10_000);
        mon
    }

    #[test]
    fn monitor_reads_back_the_panel_values() {
        let mon = sampled(SimInputs {
            dcin_plugged: true,
            ..SimInputs::default()
        });
        assert!((mon.vbat() - 3_800).abs() <= 5);
        assert!((mon.dcin() - 5_000).abs() <= 5);
        assert!((mon.bat_temp() - 25_000).abs() <= 1_000);
        assert!((mon.cpu_temp() - CPU_TEMP).abs() <= 1_000);
        assert!(mon.is_dcin_present());
    }

    #[test]
    fn unplugged_input_reads_zero() {
        let mon = sampled(SimInputs::default());
        assert!(!mon.is_dcin_present());
        assert_eq!(mon.dcin(), 0);
    }

    #[test]
    fn rtc_keeps_the_time_it_was_set_to() {
        let rtc = SimRtc::new();
        rtc.set_date_time(&DateTime::from_unix(1_700_000_000));
        assert!(rtc.now().abs_diff(1_700_000_000) <= 1);
    }
}
