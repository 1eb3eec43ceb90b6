//! Decision engine.
//!
//! Owns the [`SystemState`] and every policy on top of it: charger enable,
//! system power sequencing, temperature gating with hysteresis, failure
//! cooldowns and the polling cadence of the analog monitor. All work runs
//! as scheduler tasks; interrupts only wake those tasks.

use core::fmt;

use crate::analog::{AdcFrontend, AnalogMon};
use crate::board::{Board, Line};
use crate::button::{Button, ButtonEvent};
use crate::buzzer::BuzzerTrait;
use crate::config::{Config, ConfigError, REBOOT_DELAY, WATCHDOG_MARGIN};
use crate::fmt::Milli;
use crate::registers::{HostCommand, SharedRegisters, Snapshot};
use crate::rtc::{DateTime, TimeService};
use crate::scheduler::{Scheduler, SchedulerError, TaskHandler, TaskId};
use crate::state::{ChargeFailure, Change, Flag, PowerOnFailure, SystemState};

/// Short charge attempts lost to a sagging input before it counts as bad.
pub const BAD_DCIN_ATTEMPTS: u32 = 5;

/// BAT_PCT never reads full while the charger is still working.
const CHARGING_PCT_CAP: i32 = 99 * 1000;

const POLL_CHARGING: u32 = 200;
const POLL_CHARGE_EN: u32 = 500;
const POLL_DCIN: u32 = 1_000;
const POLL_IDLE: u32 = 30_000;
/// Fast polling continues this long after DCIN appeared.
const DCIN_SETTLE: i64 = 5_000;

const INFO_PERIOD_CHARGING: i64 = 5_000;
const INFO_PERIOD: i64 = 30_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum AppError {
    Config(ConfigError),
    Scheduler(SchedulerError),
}

impl From<ConfigError> for AppError {
    fn from(e: ConfigError) -> Self {
        AppError::Config(e)
    }
}

impl From<SchedulerError> for AppError {
    fn from(e: SchedulerError) -> Self {
        AppError::Scheduler(e)
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Config(e) => write!(f, "invalid configuration: {e}"),
            AppError::Scheduler(e) => write!(f, "scheduler setup failed: {e}"),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Tasks {
    monitor: TaskId,
    irq: TaskId,
    buzzer: TaskId,
    watchdog: TaskId,
    host: TaskId,
    pwr_key_edge: TaskId,
    charger_edge: TaskId,
}

pub struct App<'a, B: Board> {
    config: Config,
    board: B,
    rtc: &'a B::Rtc,
    shared: &'a SharedRegisters,
    mon: AnalogMon,
    state: SystemState,
    tasks: Tasks,
    pwr_key: Button,
    charger_status: Button,

    last_chrg_failure: ChargeFailure,
    last_chrg_failure_time: Option<i64>,
    chrg_failure_cnt: u32,
    dcin_bad_cnt: u32,
    last_charging: i64,
    dcin_connected: i64,
    last_pwron_fail: PowerOnFailure,
    last_info_print: Option<i64>,

    buzzer_freq: u32,
    buzzer_vol: u32,
}

impl<'a, B: Board> App<'a, B> {
    /// Registers all tasks, restores the persisted state and arms the
    /// monitor and watchdog.
    pub fn new(
        config: Config,
        mut board: B,
        rtc: &'a B::Rtc,
        shared: &'a SharedRegisters,
        sched: &mut Scheduler<'_>,
    ) -> Result<Self, AppError> {
        config.validate()?;

        let tasks = Tasks {
            monitor: sched.register()?,
            irq: sched.register()?,
            buzzer: sched.register()?,
            watchdog: sched.register()?,
            host: sched.register()?,
            pwr_key_edge: sched.register()?,
            charger_edge: sched.register()?,
        };
        let mut pwr_key = Button::new(sched, config.pwr_key)?;
        let mut charger_status = Button::new(sched, config.charger_status)?;

        board.set_system_power(false);
        board.set_charger_enabled(false);
        board.set_host_irq(false);

        let key_pressed = board.adc().pwr_key_level();
        pwr_key.init_level(key_pressed);
        charger_status.init_level(board.charger_active());

        // Only the user's power-off choice survives a reset.
        let saved = SystemState::from_bits(board.load_backup());
        let mut state = SystemState::new();
        let _ = state.apply(Flag::UserPowerOff, saved.is(Flag::UserPowerOff));
        let _ = state.apply(Flag::PwrKeyPressed, key_pressed);

        let mon = AnalogMon::new(config, board.factory_calibration());

        let app = Self {
            config,
            board,
            rtc,
            shared,
            mon,
            state,
            tasks,
            pwr_key,
            charger_status,
            last_chrg_failure: ChargeFailure::None,
            last_chrg_failure_time: None,
            chrg_failure_cnt: 0,
            dcin_bad_cnt: 0,
            last_charging: 0,
            dcin_connected: 0,
            last_pwron_fail: PowerOnFailure::None,
            last_info_print: None,
            buzzer_freq: 0,
            buzzer_vol: 0,
        };

        sched.set_timeout(app.tasks.monitor, 0);
        sched.set_timeout(app.tasks.watchdog, 0);
        app.publish();

        log::info!("----------------------------------------------------------------");
        log::info!("PMIC started!");
        Ok(app)
    }

    /// Task an interrupt on `line` should wake.
    pub fn line_task(&self, line: Line) -> TaskId {
        match line {
            Line::PwrKey => self.tasks.pwr_key_edge,
            Line::ChargerStatus => self.tasks.charger_edge,
            Line::Dcin | Line::Bat => self.tasks.monitor,
        }
    }

    /// Task that drains host commands and acknowledgements.
    pub fn host_task(&self) -> TaskId {
        self.tasks.host
    }

    pub fn state(&self) -> SystemState {
        self.state
    }

    pub fn monitor(&self) -> &AnalogMon {
        &self.mon
    }

    pub fn board(&self) -> &B {
        &self.board
    }

    pub fn board_mut(&mut self) -> &mut B {
        &mut self.board
    }

    pub fn last_charge_failure(&self) -> ChargeFailure {
        self.last_chrg_failure
    }

    pub fn last_power_on_failure(&self) -> PowerOnFailure {
        self.last_pwron_fail
    }

    /// Consecutive short charge attempts, and those among them lost to DCIN.
    pub fn failure_counters(&self) -> (u32, u32) {
        (self.chrg_failure_cnt, self.dcin_bad_cnt)
    }

    fn is(&self, flag: Flag) -> bool {
        self.state.is(flag)
    }

    /// Updates a flag; a change re-arms the host interrupt.
    fn set(&mut self, flag: Flag, value: bool, sched: &mut Scheduler<'_>) -> Change {
        let change = self.state.apply(flag, value);
        if change.is_changed() {
            // Release first so the host sees a fresh edge.
            self.board.set_host_irq(false);
            sched.set_timeout(self.tasks.irq, self.config.irq_delay);
        }
        change
    }

    /// Why charging may not run right now, in priority order.
    pub fn charge_failure(&self) -> ChargeFailure {
        if !self.is(Flag::BatPresent) {
            ChargeFailure::NoBat
        } else if !self.is(Flag::DcinPresent) {
            ChargeFailure::NoDcin
        } else if !self.is(Flag::DcinGood) {
            if self.dcin_bad_cnt >= BAD_DCIN_ATTEMPTS {
                ChargeFailure::BadDcin
            } else {
                ChargeFailure::NoDcin
            }
        } else if self.is(Flag::BatChargeLowTemp) {
            ChargeFailure::LowTemp
        } else if self.is(Flag::BatChargeHighTemp) {
            ChargeFailure::HighTemp
        } else {
            ChargeFailure::None
        }
    }

    /// Why the system may not run from the battery. Good input power
    /// overrides every battery condition.
    pub fn power_on_failure(&self) -> PowerOnFailure {
        if self.is(Flag::DcinGood) {
            PowerOnFailure::None
        } else if self.mon.is_bat_discharged() {
            PowerOnFailure::BatIsLow
        } else if self.is(Flag::BatLowTemp) {
            PowerOnFailure::BatTempIsLow
        } else if self.is(Flag::BatHighTemp) {
            PowerOnFailure::BatTempIsHigh
        } else {
            PowerOnFailure::None
        }
    }

    fn cooldown(&self) -> u32 {
        let timeouts = &self.config.charge;
        match self.last_chrg_failure {
            ChargeFailure::LowTemp | ChargeFailure::HighTemp => timeouts.bad_temp,
            ChargeFailure::NoDcin => timeouts.lost_dcin,
            ChargeFailure::BadDcin => timeouts.bad_dcin,
            ChargeFailure::NoBat | ChargeFailure::None => 0,
        }
    }

    fn is_charging_disabled(&self, now: i64) -> bool {
        if !self.is(Flag::DcinGood) {
            return true;
        }
        self.last_chrg_failure_time
            .is_some_and(|t| now - t < self.cooldown() as i64)
    }

    fn is_auto_power_on_disabled(&self) -> bool {
        match self.last_pwron_fail {
            PowerOnFailure::BatIsLow => !self.is(Flag::BatChargeEn),
            PowerOnFailure::BatTempIsHigh => true,
            _ => false,
        }
    }

    fn check_battery_temp(
        &mut self,
        name: &str,
        min: i32,
        max: i32,
        flag_lo: Flag,
        flag_hi: Flag,
        sched: &mut Scheduler<'_>,
    ) {
        let temp = self.mon.bat_temp();
        let hysteresis = self.config.battery.t_hysteresis;

        if self.is(flag_lo) && temp > min + hysteresis {
            log::info!("Battery {} now is OK ({} °C)", name, Milli(temp));
            let _ = self.set(flag_lo, false, sched);
        }
        if self.is(flag_hi) && temp < max - hysteresis {
            log::info!("Battery {} now is OK ({} °C)", name, Milli(temp));
            let _ = self.set(flag_hi, false, sched);
        }
        if !self.is(flag_lo) && temp <= min {
            log::warn!("Battery {} is too LOW! ({} °C)", name, Milli(temp));
            let _ = self.set(flag_lo, true, sched);
        }
        if !self.is(flag_hi) && temp >= max {
            log::warn!("Battery {} is too HIGH! ({} °C)", name, Milli(temp));
            let _ = self.set(flag_hi, true, sched);
        }
    }

    /// Switches system power on unless the battery forbids it.
    pub fn power_on(&mut self, sched: &mut Scheduler<'_>) {
        let fail = self.power_on_failure();
        if fail == PowerOnFailure::None {
            log::info!("System power is ON");
            let _ = self.set(Flag::PowerOn, true, sched);
            let _ = self.set(Flag::UserPowerOff, false, sched);
            self.board.set_system_power(true);
        } else {
            log::warn!("Power-on not allowed, reason={}", fail.name());
            self.last_pwron_fail = fail;
        }
        sched.set_timeout(self.tasks.monitor, 0);
    }

    /// Switches system power off. A user power-off blocks automatic power-on
    /// until the key is released.
    pub fn power_off(&mut self, user: bool, sched: &mut Scheduler<'_>) {
        log::info!("System power is OFF");
        let _ = self.set(Flag::PowerOn, false, sched);
        let _ = self.set(Flag::UserPowerOff, user, sched);
        self.board.set_system_power(false);
        self.buzzer_freq = 0;
        sched.set_timeout(self.tasks.monitor, 0);
        sched.set_timeout(self.tasks.buzzer, 0);
    }

    fn allow_deep_sleep(&mut self, allow: bool, sched: &mut Scheduler<'_>) {
        if allow {
            sched.cancel(self.tasks.monitor);
            sched.cancel(self.tasks.watchdog);
        } else {
            sched.set_timeout(self.tasks.monitor, 0);
            sched.set_timeout(self.tasks.watchdog, 0);
        }
    }

    fn monitor_task(&mut self, sched: &mut Scheduler<'_>) {
        let now = sched.now_ms();
        self.mon.read(self.board.adc(), now);

        let dcin_present = self.mon.is_dcin_present();
        if self.set(Flag::DcinPresent, dcin_present, sched).is_changed() {
            log::info!("DCIN {}!", if dcin_present { "connected" } else { "disconnected" });
            if dcin_present {
                self.dcin_connected = now;
                // A new power source gets the short cooldown again.
                if self.last_chrg_failure == ChargeFailure::BadDcin {
                    self.last_chrg_failure = ChargeFailure::NoDcin;
                    self.last_chrg_failure_time = Some(now);
                    self.chrg_failure_cnt = 0;
                    self.dcin_bad_cnt = 0;
                }
            }
        }

        let dcin_good = dcin_present && self.mon.is_dcin_good();
        if self.set(Flag::DcinGood, dcin_good, sched).is_changed() && dcin_present {
            log::info!(
                "DCIN voltage is {} [{} mV]",
                if dcin_good { "OK" } else { "BAD" },
                self.mon.dcin()
            );
        }

        let bat_present = self.mon.is_bat_present();
        if self.set(Flag::BatPresent, bat_present, sched).is_changed() {
            log::info!("Battery {}!", if bat_present { "connected" } else { "disconnected" });
        }

        let bat = self.config.battery;
        self.check_battery_temp(
            "temperature for discharging",
            bat.t_min,
            bat.t_max,
            Flag::BatLowTemp,
            Flag::BatHighTemp,
            sched,
        );
        self.check_battery_temp(
            "temperature for charging",
            bat.t_chrg_min,
            bat.t_chrg_max,
            Flag::BatChargeLowTemp,
            Flag::BatChargeHighTemp,
            sched,
        );

        let chrg_fail = self.charge_failure();
        if !self.is(Flag::BatChargeEn) && chrg_fail == ChargeFailure::None && !self.is_charging_disabled(now) {
            log::info!("Charging allowed");
            self.last_charging = now;
            let _ = self.set(Flag::BatChargeEn, true, sched);
        }

        if self.is(Flag::BatChargeEn) && chrg_fail != ChargeFailure::None {
            log::warn!("Charging is NOT allowed, reason={}", chrg_fail.name());
            self.last_chrg_failure = chrg_fail;
            self.last_chrg_failure_time = Some(now);
            if now - self.last_charging < self.config.charge.min_charge_time as i64 {
                self.chrg_failure_cnt += 1;
                if chrg_fail == ChargeFailure::NoDcin {
                    self.dcin_bad_cnt += 1;
                }
            } else {
                self.chrg_failure_cnt = 0;
                self.dcin_bad_cnt = 0;
            }
            let _ = self.set(Flag::BatChargeEn, false, sched);
        }

        self.board.set_charger_enabled(self.is(Flag::BatChargeEn));

        let charging = self.charger_status.is_pressed() && self.is(Flag::BatChargeEn);
        if self.set(Flag::BatCharging, charging, sched).is_changed() {
            log::info!("Battery {}", if charging { "is charging..." } else { "stopped charging" });
        }

        if !self.is(Flag::PowerOn) && !self.is(Flag::UserPowerOff) && !self.is_auto_power_on_disabled() {
            self.power_on(sched);
        }

        if self.is(Flag::PowerOn) {
            let fail = self.power_on_failure();
            if fail != PowerOnFailure::None {
                log::warn!("Power-on not allowed, reason={}", fail.name());
                log::warn!("Force power-off system power!!!");
                self.last_pwron_fail = fail;
                self.power_off(false, sched);
            }
        }

        self.log_summary(now);

        let next_timeout = if self.is(Flag::BatCharging) {
            POLL_CHARGING
        } else if self.is(Flag::BatChargeEn) {
            POLL_CHARGE_EN
        } else if self.is(Flag::DcinGood) {
            POLL_DCIN
        } else if self.is(Flag::DcinPresent) && now - self.dcin_connected <= DCIN_SETTLE {
            POLL_DCIN
        } else if !self.is(Flag::PowerOn) && !self.is(Flag::DcinPresent) {
            let adc = self.board.adc();
            if !adc.dcin_sense_level() && !adc.pwr_key_level() {
                self.allow_deep_sleep(true, sched);
                return;
            }
            POLL_IDLE
        } else {
            POLL_IDLE
        };

        sched.set_timeout(self.tasks.monitor, next_timeout);
        // a wake that skipped on_idle left the watchdog task cancelled
        if !sched.is_armed(self.tasks.watchdog) {
            sched.set_timeout(self.tasks.watchdog, 0);
        }
        self.board.feed_watchdog();
    }

    fn log_summary(&mut self, now: i64) {
        let period = if self.is(Flag::BatCharging) { INFO_PERIOD_CHARGING } else { INFO_PERIOD };
        if self.last_info_print.is_some_and(|t| now - t < period) {
            return;
        }
        log::info!(
            "BAT: {} mV / {}% / {} °C | DCIN: {} mV | CPU: {} °C",
            self.mon.vbat(),
            Milli(self.mon.bat_pct()),
            Milli(self.mon.bat_temp()),
            self.mon.dcin(),
            Milli(self.mon.cpu_temp()),
        );
        self.last_info_print = Some(now);
    }

    fn on_pwr_key(&mut self, event: ButtonEvent, sched: &mut Scheduler<'_>) {
        let now = sched.now_ms();
        log::debug!("Power key: {:?}", event);
        match event {
            ButtonEvent::Press => self.mon.ignore_dcin_voltage(true, now),
            ButtonEvent::Release => {
                self.mon.ignore_dcin_voltage(false, now);
                self.last_pwron_fail = PowerOnFailure::None;
                let _ = self.set(Flag::UserPowerOff, false, sched);
            }
            ButtonEvent::LongPress => self.power_off(true, sched),
            ButtonEvent::LongRelease => self.mon.ignore_dcin_voltage(false, now),
        }

        let pressed = matches!(event, ButtonEvent::Press | ButtonEvent::LongPress);
        let _ = self.set(Flag::PwrKeyPressed, pressed, sched);
        sched.set_timeout(self.tasks.monitor, 0);
    }

    fn host_command(&mut self, command: HostCommand, sched: &mut Scheduler<'_>) {
        log::debug!("Host command: {:?}", command);
        match command {
            HostCommand::PowerOn => self.power_on(sched),
            HostCommand::Shutdown => self.power_off(true, sched),
            HostCommand::Reboot => {
                self.power_off(false, sched);
                sched.set_timeout(self.tasks.monitor, REBOOT_DELAY);
            }
            HostCommand::SetTime(unix) => {
                let dt = DateTime::from_unix(unix);
                log::info!(
                    "RTC set to {:04}-{:02}-{:02} {:02}:{:02}:{:02}",
                    dt.year,
                    dt.month,
                    dt.day,
                    dt.hours,
                    dt.minutes,
                    dt.seconds
                );
                self.rtc.set_date_time(&dt);
            }
            HostCommand::PlayBuzzer { frequency, volume } => {
                self.buzzer_freq = frequency;
                self.buzzer_vol = volume;
                sched.set_timeout(self.tasks.buzzer, 0);
            }
        }
    }

    fn drain_host(&mut self, sched: &mut Scheduler<'_>) {
        // An acknowledgement only covers the status the host actually read.
        if let Some(seen) = self.shared.take_irq_ack() {
            if seen == self.state.bits() {
                self.board.set_host_irq(false);
                sched.cancel(self.tasks.irq);
            } else {
                log::debug!("Stale IRQ ack {:#06x}, status is {:#06x}", seen, self.state.bits());
            }
        }
        while let Some(command) = self.shared.pop_command() {
            self.host_command(command, sched);
        }
    }

    fn buzzer_task(&mut self) {
        if self.buzzer_freq != 0 {
            self.board.buzzer().play(self.buzzer_freq, self.buzzer_vol);
        } else {
            self.board.buzzer().stop();
        }
    }

    /// Makes the current values visible to the bus interrupt.
    fn publish(&self) {
        let bat = &self.config.battery;
        let bat_pct = if self.is(Flag::BatCharging) {
            self.mon.bat_pct().min(CHARGING_PCT_CAP)
        } else {
            self.mon.bat_pct()
        };
        self.shared.publish(Snapshot {
            status: self.state.bits(),
            bat_voltage: self.mon.vbat(),
            bat_temp: self.mon.bat_temp(),
            bat_min_temp: bat.t_min,
            bat_max_temp: bat.t_max,
            bat_pct,
            dcin_voltage: self.mon.dcin(),
            cpu_temp: self.mon.cpu_temp(),
            max_bat_voltage: bat.v_max,
            min_bat_voltage: bat.v_min,
        });
    }
}

impl<B: Board> TaskHandler for App<'_, B> {
    fn run_task(&mut self, id: TaskId, sched: &mut Scheduler<'_>) {
        let tasks = self.tasks;
        if id == tasks.monitor {
            self.monitor_task(sched);
        } else if id == tasks.irq {
            self.board.set_host_irq(true);
        } else if id == tasks.buzzer {
            self.buzzer_task();
        } else if id == tasks.watchdog {
            self.board.feed_watchdog();
            sched.set_timeout(tasks.watchdog, self.config.watchdog_timeout - WATCHDOG_MARGIN);
        } else if id == tasks.host {
            self.drain_host(sched);
        } else if id == tasks.pwr_key_edge {
            let pressed = self.board.adc().pwr_key_level();
            self.pwr_key.update(pressed, sched);
        } else if id == tasks.charger_edge {
            let active = self.board.charger_active();
            self.charger_status.update(active, sched);
        } else if self.pwr_key.owns(id) {
            if let Some(event) = self.pwr_key.handle_task(id, sched) {
                self.on_pwr_key(event, sched);
            }
        } else if self.charger_status.owns(id) {
            if let Some(event) = self.charger_status.handle_task(id, sched) {
                log::debug!("Charger status: {:?}", event);
                sched.set_timeout(tasks.monitor, 0);
            }
        }
        self.publish();
    }

    fn on_idle(&mut self, sched: &mut Scheduler<'_>) -> bool {
        log::info!("No tasks, going to deep sleep...");
        self.board.save_backup(self.state.bits() & Flag::UserPowerOff.bit());
        let slept = self.board.suspend();
        sched.timebase().advance(slept);
        self.allow_deep_sleep(false, sched);
        true
    }
}
