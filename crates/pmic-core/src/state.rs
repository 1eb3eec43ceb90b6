//! System state bitfield and the failure reasons derived from it.
//!
//! Bit positions are part of the host register contract (STATUS/IRQ_STATUS).

/// One named condition in [`SystemState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u32)]
pub enum Flag {
    DcinGood = 1 << 0,
    DcinPresent = 1 << 1,
    BatPresent = 1 << 2,
    PowerOn = 1 << 3,
    UserPowerOff = 1 << 4,

    BatCharging = 1 << 5,
    BatChargeEn = 1 << 6,

    BatLowTemp = 1 << 7,
    BatHighTemp = 1 << 8,
    BatChargeLowTemp = 1 << 9,
    BatChargeHighTemp = 1 << 10,

    PwrKeyPressed = 1 << 11,
}

impl Flag {
    /// Every flag, in bit order.
    pub const ALL: [Flag; 12] = [
        Flag::DcinGood,
        Flag::DcinPresent,
        Flag::BatPresent,
        Flag::PowerOn,
        Flag::UserPowerOff,
        Flag::BatCharging,
        Flag::BatChargeEn,
        Flag::BatLowTemp,
        Flag::BatHighTemp,
        Flag::BatChargeLowTemp,
        Flag::BatChargeHighTemp,
        Flag::PwrKeyPressed,
    ];

    pub const fn bit(self) -> u32 {
        self as u32
    }

    pub fn name(self) -> &'static str {
        match self {
            Flag::DcinGood => "DCIN_GOOD",
            Flag::DcinPresent => "DCIN_PRESENT",
            Flag::BatPresent => "BAT_PRESENT",
            Flag::PowerOn => "POWER_ON",
            Flag::UserPowerOff => "USER_POWER_OFF",
            Flag::BatCharging => "BAT_CHARGING",
            Flag::BatChargeEn => "BAT_CHARGE_EN",
            Flag::BatLowTemp => "BAT_LOW_TEMP",
            Flag::BatHighTemp => "BAT_HIGH_TEMP",
            Flag::BatChargeLowTemp => "BAT_CHARGE_LOW_TEMP",
            Flag::BatChargeHighTemp => "BAT_CHARGE_HIGH_TEMP",
            Flag::PwrKeyPressed => "PWR_KEY_PRESSED",
        }
    }
}

/// Result of [`SystemState::apply`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub enum Change {
    Changed,
    Unchanged,
}

impl Change {
    pub fn is_changed(self) -> bool {
        self == Change::Changed
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SystemState(u32);

impl SystemState {
    pub const fn new() -> Self {
        Self(0)
    }

    /// Rebuilds a state from raw bits, dropping unknown positions.
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits & ALL_FLAGS)
    }

    pub const fn bits(&self) -> u32 {
        self.0
    }

    pub const fn is(&self, flag: Flag) -> bool {
        self.0 & flag.bit() != 0
    }

    /// Set flags in bit order.
    pub fn iter(&self) -> impl Iterator<Item = Flag> {
        let state = *self;
        Flag::ALL.into_iter().filter(move |&flag| state.is(flag))
    }

    /// The only mutator; reports whether the host has to be notified.
    pub fn apply(&mut self, flag: Flag, value: bool) -> Change {
        let changed = value != self.is(flag);
        if value {
            self.0 |= flag.bit();
        } else {
            self.0 &= !flag.bit();
        }
        if changed { Change::Changed } else { Change::Unchanged }
    }
}

const ALL_FLAGS: u32 = (1 << 12) - 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ChargeFailure {
    None,
    LowTemp,
    HighTemp,
    NoDcin,
    BadDcin,
    NoBat,
}

impl ChargeFailure {
    pub fn name(self) -> &'static str {
        match self {
            ChargeFailure::None => "NONE",
            ChargeFailure::LowTemp => "LOW_TEMP",
            ChargeFailure::HighTemp => "HIGH_TEMP",
            ChargeFailure::NoDcin => "NO_DCIN",
            ChargeFailure::BadDcin => "BAD_DCIN",
            ChargeFailure::NoBat => "NO_BAT",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PowerOnFailure {
    None,
    BatIsLow,
    BatTempIsLow,
    BatTempIsHigh,
}

impl PowerOnFailure {
    pub fn name(self) -> &'static str {
        match self {
            PowerOnFailure::None => "NONE",
            PowerOnFailure::BatIsLow => "BAT_IS_LOW",
            PowerOnFailure::BatTempIsLow => "BAT_TEMP_IS_LOW",
            PowerOnFailure::BatTempIsHigh => "BAT_TEMP_IS_HIGH",
        }
    }
}
