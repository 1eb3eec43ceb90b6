//! Firmware configuration.
//!
//! All voltages are in millivolts, temperatures in millidegrees Celsius,
//! durations in milliseconds and divider ratios in thousandths.

use core::fmt;

/// Battery thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatteryConfig {
    /// Voltage reported as 0 %.
    pub v_min: i32,
    /// Voltage reported as 100 %.
    pub v_max: i32,
    /// At or below this voltage the system may not run without input power.
    pub v_shutdown: i32,
    /// Minimum voltage that counts as "battery connected".
    pub v_presence: i32,
    /// Discharge temperature range.
    pub t_min: i32,
    pub t_max: i32,
    /// Charge temperature range.
    pub t_chrg_min: i32,
    pub t_chrg_max: i32,
    /// Margin a temperature must move back inside a range before its flag clears.
    pub t_hysteresis: i32,
}

/// Two-point linear calibration: `value[i]` is measured at temperature `t[i]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TempCalibration {
    pub t: [i32; 2],
    pub value: [i32; 2],
}

/// Cooldowns applied after a charging failure, keyed by reason.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChargeTimeouts {
    pub bad_temp: u32,
    pub lost_dcin: u32,
    pub bad_dcin: u32,
    /// A failure within this time after charging started counts as a short attempt.
    pub min_charge_time: u32,
}

/// Debounce and long-press timings for a digital line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ButtonTimings {
    pub debounce: u32,
    pub long_press: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    pub battery: BatteryConfig,
    pub dcin_min_voltage: i32,
    pub dcin_rdiv: i32,
    pub vbat_rdiv: i32,
    pub bat_temp: TempCalibration,
    pub charge: ChargeTimeouts,
    pub watchdog_timeout: u32,
    pub adc_avg_count: u32,
    pub pwr_key: ButtonTimings,
    pub charger_status: ButtonTimings,
    /// Delay between a state change and asserting the host interrupt line.
    pub irq_delay: u32,
    /// 7-bit slave address on the host bus.
    pub i2c_address: u8,
}

impl Config {
    pub const DEFAULT: Config = Config {
        battery: BatteryConfig {
            v_min: 3_400,
            v_max: 4_150,
            v_shutdown: 3_300,
            v_presence: 2_500,
            t_max: 45_000,
            t_min: -20_000,
            t_chrg_max: 40_000,
            t_chrg_min: 5_000,
            t_hysteresis: 4_000,
        },
        dcin_min_voltage: 4_500,
        dcin_rdiv: 2_000,
        vbat_rdiv: 2_000,
        // Diode sensor on the battery pack
        bat_temp: TempCalibration {
            t: [19_000, 45_000],
            value: [592, 536],
        },
        charge: ChargeTimeouts {
            bad_temp: 30 * 60 * 1000,
            lost_dcin: 5 * 1000,
            bad_dcin: 30 * 60 * 1000,
            min_charge_time: 60 * 1000,
        },
        watchdog_timeout: 60_000,
        adc_avg_count: 10,
        pwr_key: ButtonTimings {
            debounce: 100,
            long_press: 5_000,
        },
        charger_status: ButtonTimings {
            debounce: 1_000,
            long_press: 5_000,
        },
        irq_delay: 10,
        i2c_address: 0x34,
    };

    /// Checks that the thresholds are usable by the integer math downstream.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let bat = &self.battery;
        if bat.v_max <= bat.v_min {
            return Err(ConfigError::EmptyVoltageRange);
        }
        if bat.t_max <= bat.t_min || bat.t_chrg_max <= bat.t_chrg_min {
            return Err(ConfigError::EmptyTemperatureRange);
        }
        if bat.t_hysteresis < 0
            || 2 * bat.t_hysteresis >= bat.t_max - bat.t_min
            || 2 * bat.t_hysteresis >= bat.t_chrg_max - bat.t_chrg_min
        {
            return Err(ConfigError::HysteresisTooWide);
        }
        if self.bat_temp.value[0] == self.bat_temp.value[1] {
            return Err(ConfigError::DegenerateCalibration);
        }
        if self.dcin_rdiv <= 0 || self.vbat_rdiv <= 0 {
            return Err(ConfigError::InvalidDivider);
        }
        if self.adc_avg_count == 0 {
            return Err(ConfigError::NoSamples);
        }
        if self.watchdog_timeout <= WATCHDOG_MARGIN {
            return Err(ConfigError::WatchdogTooShort);
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// The watchdog is fed this long before it would expire.
pub const WATCHDOG_MARGIN: u32 = 5_000;

/// Monitor re-run delay after a host-requested reboot.
pub const REBOOT_DELAY: u32 = 2_000;

/// How long after a key press/release the DCIN reading stays frozen.
pub const DCIN_IGNORE_GUARD: i64 = 1_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ConfigError {
    EmptyVoltageRange,
    EmptyTemperatureRange,
    HysteresisTooWide,
    DegenerateCalibration,
    InvalidDivider,
    NoSamples,
    WatchdogTooShort,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            ConfigError::EmptyVoltageRange => "battery v_max must be above v_min",
            ConfigError::EmptyTemperatureRange => "temperature range max must be above min",
            ConfigError::HysteresisTooWide => "temperature hysteresis does not fit inside its range",
            ConfigError::DegenerateCalibration => "calibration points must differ",
            ConfigError::InvalidDivider => "divider ratio must be positive",
            ConfigError::NoSamples => "ADC averaging count must be non-zero",
            ConfigError::WatchdogTooShort => "watchdog timeout is shorter than the feed margin",
        };
        f.write_str(msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert_eq!(Config::DEFAULT.validate(), Ok(()));
    }

    #[test]
    fn rejects_inverted_voltage_range() {
        let mut config = Config::DEFAULT;
        config.battery.v_max = config.battery.v_min;
        assert_eq!(config.validate(), Err(ConfigError::EmptyVoltageRange));
    }

    #[test]
    fn rejects_flat_calibration() {
        let mut config = Config::DEFAULT;
        config.bat_temp.value = [550, 550];
        assert_eq!(config.validate(), Err(ConfigError::DegenerateCalibration));
    }

    #[test]
    fn rejects_hysteresis_wider_than_charge_range() {
        let mut config = Config::DEFAULT;
        config.battery.t_hysteresis = 20_000;
        assert_eq!(config.validate(), Err(ConfigError::HysteresisTooWide));
    }
}
