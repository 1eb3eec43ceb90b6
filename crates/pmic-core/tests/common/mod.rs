#![allow(dead_code)]

use std::cell::{Cell, RefCell};

use pmic_core::analog::{AdcFrontend, FactoryCalibration, Frame};
use pmic_core::board::Board;
use pmic_core::buzzer::BuzzerTrait;
use pmic_core::config::{Config, TempCalibration};
use pmic_core::i2c_slave::{BusEvent, I2cSlave, RegisterAccess};
use pmic_core::registers::SharedRegisters;
use pmic_core::rtc::{DateTime, TimeService};
use pmic_core::scheduler::{IdleTimer, Pass, Scheduler, TaskHandler, Timebase};

/// With these values the reference reads exactly 4095 mV, so with a 1.000
/// divider the battery code equals its millivolts.
pub const FACTORY: FactoryCalibration = FactoryCalibration {
    vrefint_cal: 4095,
    ts_cal1: 1750,
    ts_cal2: 1330,
};
const VREF_CODE: u16 = 3300;

/// Production defaults with exact test calibration: battery code = mV,
/// DCIN code = mV / 2, temperature code = °C + 50.
pub fn config() -> Config {
    let mut config = Config::DEFAULT;
    config.vbat_rdiv = 1000;
    config.bat_temp = TempCalibration {
        t: [-50_000, 50_000],
        value: [0, 100],
    };
    config
}

pub struct FakeAdc {
    pub vbat_mv: u16,
    pub dcin_mv: u16,
    pub bat_temp_c: i32,
    pub dcin_sense: bool,
    pub key: bool,
}

impl FakeAdc {
    pub fn plug(&mut self, mv: u16) {
        self.dcin_mv = mv;
        self.dcin_sense = true;
    }

    pub fn unplug(&mut self) {
        self.dcin_mv = 0;
        self.dcin_sense = false;
    }
}

impl AdcFrontend for FakeAdc {
    fn route_to_adc(&mut self, _adc: bool) {}

    fn set_powered(&mut self, _on: bool) {}

    fn convert(&mut self) -> Frame {
        [
            self.dcin_mv / 2,
            self.vbat_mv,
            (self.bat_temp_c + 50) as u16,
            FACTORY.ts_cal1,
            VREF_CODE,
        ]
    }

    fn pwr_key_level(&self) -> bool {
        self.key
    }

    fn dcin_sense_level(&self) -> bool {
        self.dcin_sense
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tone {
    Play(u32, u32),
    Stop,
}

#[derive(Default)]
pub struct FakeBuzzer {
    pub tones: RefCell<Vec<Tone>>,
}

impl BuzzerTrait for FakeBuzzer {
    fn play(&self, frequency_hz: u32, volume: u32) {
        self.tones.borrow_mut().push(Tone::Play(frequency_hz, volume));
    }

    fn stop(&self) {
        self.tones.borrow_mut().push(Tone::Stop);
    }
}

#[derive(Default)]
pub struct FakeRtc(pub Cell<u32>);

impl TimeService for FakeRtc {
    fn now(&self) -> u32 {
        self.0.get()
    }

    fn set_date_time(&self, dt: &DateTime) {
        self.0.set(dt.to_unix());
    }
}

pub struct FakeBoard {
    pub adc: FakeAdc,
    pub buzzer: FakeBuzzer,
    pub charger_active: bool,
    pub charger_enabled: bool,
    pub system_power: bool,
    pub host_irq: bool,
    pub watchdog_feeds: u32,
    pub backup: u32,
    pub suspends: u32,
    pub suspend_ms: u32,
}

impl FakeBoard {
    /// 3.8 V battery at 25 °C, nothing plugged in.
    pub fn on_battery() -> Self {
        Self {
            adc: FakeAdc {
                vbat_mv: 3_800,
                dcin_mv: 0,
                bat_temp_c: 25,
                dcin_sense: false,
                key: false,
            },
            buzzer: FakeBuzzer::default(),
            charger_active: false,
            charger_enabled: false,
            system_power: false,
            host_irq: false,
            watchdog_feeds: 0,
            backup: 0,
            suspends: 0,
            suspend_ms: 60_000,
        }
    }

    pub fn on_charger() -> Self {
        let mut board = Self::on_battery();
        board.adc.plug(5_000);
        board
    }
}

impl Board for FakeBoard {
    type Adc = FakeAdc;
    type Rtc = FakeRtc;
    type Buzzer = FakeBuzzer;

    fn adc(&mut self) -> &mut FakeAdc {
        &mut self.adc
    }

    fn buzzer(&self) -> &FakeBuzzer {
        &self.buzzer
    }

    fn factory_calibration(&self) -> FactoryCalibration {
        FACTORY
    }

    fn set_charger_enabled(&mut self, enabled: bool) {
        self.charger_enabled = enabled;
    }

    fn set_system_power(&mut self, on: bool) {
        self.system_power = on;
    }

    fn set_host_irq(&mut self, asserted: bool) {
        self.host_irq = asserted;
    }

    fn charger_active(&self) -> bool {
        self.charger_active
    }

    fn feed_watchdog(&mut self) {
        self.watchdog_feeds += 1;
    }

    fn save_backup(&mut self, value: u32) {
        self.backup = value;
    }

    fn load_backup(&self) -> u32 {
        self.backup
    }

    fn suspend(&mut self) -> u32 {
        self.suspends += 1;
        self.suspend_ms
    }
}

/// Sleeps are instant. A sleep past `stop_at` is cut short there, like an
/// early wake-up.
pub struct FakeTimer<'t> {
    timebase: &'t Timebase,
    pub stop_at: Option<i64>,
}

impl<'t> FakeTimer<'t> {
    pub fn new(timebase: &'t Timebase) -> Self {
        Self { timebase, stop_at: None }
    }
}

impl IdleTimer for FakeTimer<'_> {
    fn max_idle_ms(&self) -> u32 {
        0xFF_FFFF / 1000
    }

    fn wait_for_interrupt(&mut self) {
        self.timebase.tick();
    }

    fn sleep_for(&mut self, ms: u32) -> u32 {
        match self.stop_at {
            Some(at) => (at - self.timebase.now_ms()).max(1).min(ms as i64) as u32,
            None => ms,
        }
    }
}

/// Borrowed by the app for its whole life.
#[derive(Default)]
pub struct Rig {
    pub timebase: Timebase,
    pub shared: SharedRegisters,
    pub rtc: FakeRtc,
}

pub fn run_until<H: TaskHandler>(sched: &mut Scheduler<'_>, handler: &mut H, timer: &mut FakeTimer<'_>, until: i64) {
    timer.stop_at = Some(until);
    while sched.now_ms() < until {
        sched.run_pass(handler, timer);
    }
    timer.stop_at = None;
}

/// Runs until `cond` holds; false if `limit` passed first.
pub fn run_until_cond<H: TaskHandler>(
    sched: &mut Scheduler<'_>,
    handler: &mut H,
    timer: &mut FakeTimer<'_>,
    limit: i64,
    cond: impl Fn(&H) -> bool,
) -> bool {
    timer.stop_at = Some(limit);
    let mut met = cond(handler);
    while !met && sched.now_ms() < limit {
        sched.run_pass(handler, timer);
        met = cond(handler);
    }
    timer.stop_at = None;
    met
}

/// Executes whatever is due, stopping at the first idle wait.
pub fn settle<H: TaskHandler>(sched: &mut Scheduler<'_>, handler: &mut H, timer: &mut FakeTimer<'_>) {
    for _ in 0..1_000 {
        if sched.run_pass(handler, timer) != Pass::Busy {
            return;
        }
    }
    panic!("scheduler never went idle");
}

pub fn bus_write<R: RegisterAccess>(slave: &mut I2cSlave, regs: &R, bytes: &[u8]) {
    slave.handle_event(BusEvent::StartWrite, regs);
    for &byte in bytes {
        slave.handle_event(BusEvent::Rx(byte), regs);
    }
    slave.handle_event(BusEvent::Stop, regs);
}

pub fn write_reg<R: RegisterAccess>(slave: &mut I2cSlave, regs: &R, addr: u8, value: u32) {
    let [d0, d1, d2, d3] = value.to_le_bytes();
    bus_write(slave, regs, &[addr, d0, d1, d2, d3]);
}

pub fn read_reg<R: RegisterAccess>(slave: &mut I2cSlave, regs: &R, addr: u8) -> u32 {
    slave.handle_event(BusEvent::StartWrite, regs);
    slave.handle_event(BusEvent::Rx(addr), regs);
    slave.handle_event(BusEvent::StartRead, regs);
    let mut bytes = [0u8; 4];
    for byte in &mut bytes {
        *byte = slave.handle_event(BusEvent::Tx, regs).unwrap();
    }
    slave.handle_event(BusEvent::Stop, regs);
    u32::from_le_bytes(bytes)
}
