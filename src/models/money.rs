use serde::{Deserialize, Serialize};
use std::fmt;

/// Amount in minor currency units (cents).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Money(i64);

impl Money {
    pub const ZERO: Money = Money(0);

    pub fn from_minor(value: i64) -> Self {
        Money(value)
    }

    pub fn minor_units(self) -> i64 {
        self.0
    }

    pub fn is_positive(self) -> bool {
        self.0 > 0
    }

    /// Share of this amount in whole percent, rounded down to the cent.
    pub fn percent(self, percent: u8) -> Money {
        Money(self.0 * i64::from(percent) / 100)
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.abs();
        write!(f, "{sign}{}.{:02}", abs / 100, abs % 100)
    }
}

impl std::ops::Add for Money {
    type Output = Self;

    fn add(self, rhs: Self) -> Self::Output {
        Money(self.0 + rhs.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_formats_cents() {
        assert_eq!(Money::from_minor(2550).to_string(), "25.50");
        assert_eq!(Money::from_minor(5).to_string(), "0.05");
        assert_eq!(Money::from_minor(-120).to_string(), "-1.20");
    }

    #[test]
    fn percent_rounds_down() {
        assert_eq!(Money::from_minor(2525).percent(50), Money::from_minor(1262));
        assert_eq!(Money::from_minor(2525).percent(100), Money::from_minor(2525));
        assert_eq!(Money::from_minor(2525).percent(0), Money::ZERO);
    }

    #[test]
    fn add() {
        assert_eq!(Money::from_minor(2000) + Money::from_minor(250), Money::from_minor(2250));
    }
}
