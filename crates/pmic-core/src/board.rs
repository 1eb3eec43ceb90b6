use crate::analog::{AdcFrontend, FactoryCalibration};
use crate::buzzer::BuzzerTrait;
use crate::rtc::TimeService;

/// Digital inputs whose edges wake the firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Line {
    PwrKey,
    ChargerStatus,
    Dcin,
    Bat,
}

/// Everything the decision engine drives or senses on the board.
///
/// Line levels are logical: `true` means pressed / charging, whatever the
/// electrical polarity is.
pub trait Board {
    type Adc: AdcFrontend;
    type Rtc: TimeService;
    type Buzzer: BuzzerTrait;

    fn adc(&mut self) -> &mut Self::Adc;
    fn buzzer(&self) -> &Self::Buzzer;
    fn factory_calibration(&self) -> FactoryCalibration;

    fn set_charger_enabled(&mut self, enabled: bool);
    /// System power switch. Every board has one.
    fn set_system_power(&mut self, on: bool);
    fn set_host_irq(&mut self, asserted: bool);

    /// Charger status output, active while the charger is charging.
    fn charger_active(&self) -> bool;

    fn feed_watchdog(&mut self);

    /// Backup-domain register that survives deep sleep and watchdog resets.
    fn save_backup(&mut self, value: u32);
    fn load_backup(&self) -> u32;

    /// Enters deep sleep until any wake-up interrupt and returns the
    /// milliseconds spent asleep.
    fn suspend(&mut self) -> u32;
}
