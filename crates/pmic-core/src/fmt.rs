//! Presentation helpers for fixed-point values in log lines.

use core::fmt;

/// Splits a milli-unit value into its integer part and the tenths digit.
/// The integer part carries the sign; the tenths digit is always positive.
pub fn split_milli(v: i32) -> (i32, i32) {
    (v / 1000, (v % 1000).abs() / 100)
}

/// Displays a milli-unit value as `int.tenths`, e.g. `-5300` as `-5.3`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Milli(pub i32);

impl fmt::Display for Milli {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (int, tenths) = split_milli(self.0);
        // -0.x has no sign left in the integer part
        if self.0 < 0 && int == 0 {
            f.write_str("-")?;
        }
        write!(f, "{int}.{tenths}")
    }
}
