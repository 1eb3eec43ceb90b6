//! Calendar time service and Unix time conversion.

/// Civil date and time, UTC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct DateTime {
    pub year: u16,
    /// 1..=12
    pub month: u8,
    /// 1..=31
    pub day: u8,
    pub hours: u8,
    pub minutes: u8,
    pub seconds: u8,
}

/// Battery-backed real-time clock.
///
/// Both methods take `&self` since the time is read from the bus interrupt.
pub trait TimeService {
    /// Current time in Unix seconds.
    fn now(&self) -> u32;

    fn set_date_time(&self, dt: &DateTime);
}

/// 2000-03-01, right after a 400-year cycle's leap day.
const LEAPOCH: i64 = 946_684_800 + 86_400 * (31 + 29);

const DAYS_PER_400Y: i64 = 365 * 400 + 97;
const DAYS_PER_100Y: i64 = 365 * 100 + 24;
const DAYS_PER_4Y: i64 = 365 * 4 + 1;

impl DateTime {
    pub fn from_unix(t: u32) -> Self {
        // Months counted from March, so the leap day lands at the end.
        const DAYS_IN_MONTH: [i64; 12] = [31, 30, 31, 30, 31, 31, 30, 31, 30, 31, 31, 29];

        let secs = t as i64 - LEAPOCH;
        let days = secs.div_euclid(86_400);
        let rem_secs = secs.rem_euclid(86_400);

        let qc_cycles = days.div_euclid(DAYS_PER_400Y);
        let mut rem_days = days.rem_euclid(DAYS_PER_400Y);

        let c_cycles = (rem_days / DAYS_PER_100Y).min(3);
        rem_days -= c_cycles * DAYS_PER_100Y;

        let q_cycles = (rem_days / DAYS_PER_4Y).min(24);
        rem_days -= q_cycles * DAYS_PER_4Y;

        let rem_years = (rem_days / 365).min(3);
        rem_days -= rem_years * 365;

        let mut years = rem_years + 4 * q_cycles + 100 * c_cycles + 400 * qc_cycles;

        let mut months = 0;
        while DAYS_IN_MONTH[months] <= rem_days {
            rem_days -= DAYS_IN_MONTH[months];
            months += 1;
        }

        let mut month = months as i64 + 3;
        if month > 12 {
            month -= 12;
            years += 1;
        }

        Self {
            year: (years + 2000) as u16,
            month: month as u8,
            day: (rem_days + 1) as u8,
            hours: (rem_secs / 3600) as u8,
            minutes: (rem_secs / 60 % 60) as u8,
            seconds: (rem_secs % 60) as u8,
        }
    }

    /// Seconds since the Unix epoch, saturating outside 1970..2106.
    pub fn to_unix(&self) -> u32 {
        const MONTH_YDAY: [i64; 12] = [0, 31, 59, 90, 120, 151, 181, 212, 243, 273, 304, 334];

        // Shift to a positive year that is a multiple of 400.
        let year_adj = self.year as i64 + 4800;
        let febs = year_adj - i64::from(self.month <= 2);
        let leap_days = 1 + febs / 4 - febs / 100 + febs / 400;
        let month_index = (self.month.clamp(1, 12) - 1) as usize;
        let days = 365 * year_adj + leap_days + MONTH_YDAY[month_index] + self.day as i64 - 1 - 2_472_692;

        let secs = days * 86_400 + self.hours as i64 * 3600 + self.minutes as i64 * 60 + self.seconds as i64;
        secs.clamp(0, u32::MAX as i64) as u32
    }
}
