use std::sync::LazyLock;

use chrono::{Datelike, Duration, NaiveDate};
use regex::Regex;
use serde::Serialize;

use crate::error::{Error, Result};

static RE_MONTH: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^(\d{4})-(\d{1,2})$").unwrap());

/// Get the last day of a given month.
pub fn last_day_of_month(year: i32, month: u32) -> NaiveDate {
    if month == 12 {
        NaiveDate::from_ymd_opt(year + 1, 1, 1).unwrap() - Duration::days(1)
    } else {
        NaiveDate::from_ymd_opt(year, month + 1, 1).unwrap() - Duration::days(1)
    }
}

/// Format a date the way every table stores it.
pub fn date_key(d: NaiveDate) -> String {
    d.format("%Y-%m-%d").to_string()
}

pub fn parse_date_key(s: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .map_err(|e| Error::Input(format!("bad date '{s}': {e}")))
}

/// Round a display percentage to one decimal place.
pub fn round1(v: f64) -> f64 {
    (v * 10.0).round() / 10.0
}

/// A calendar month, ordered chronologically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct Month {
    pub year: i32,
    pub month: u32,
}

impl Month {
    pub fn new(year: i32, month: u32) -> Result<Self> {
        if !(1..=12).contains(&month) {
            return Err(Error::Input(format!("month out of range: {month}")));
        }
        Ok(Self { year, month })
    }

    pub fn of(d: NaiveDate) -> Self {
        Self {
            year: d.year(),
            month: d.month(),
        }
    }

    /// Parse `2025-03` (or `2025-3`).
    pub fn parse(s: &str) -> Result<Self> {
        let caps = RE_MONTH
            .captures(s.trim())
            .ok_or_else(|| Error::Input(format!("expected YYYY-MM, got '{s}'")))?;
        let year: i32 = caps[1].parse().map_err(|_| Error::Input(s.to_string()))?;
        let month: u32 = caps[2].parse().map_err(|_| Error::Input(s.to_string()))?;
        Self::new(year, month)
    }

    pub fn first_day(self) -> NaiveDate {
        NaiveDate::from_ymd_opt(self.year, self.month, 1).unwrap()
    }

    pub fn last_day(self) -> NaiveDate {
        last_day_of_month(self.year, self.month)
    }

    pub fn succ(self) -> Self {
        if self.month == 12 {
            Self {
                year: self.year + 1,
                month: 1,
            }
        } else {
            Self {
                year: self.year,
                month: self.month + 1,
            }
        }
    }

    pub fn pred(self) -> Self {
        if self.month == 1 {
            Self {
                year: self.year - 1,
                month: 12,
            }
        } else {
            Self {
                year: self.year,
                month: self.month - 1,
            }
        }
    }

    pub fn key(self) -> String {
        format!("{}-{:02}", self.year, self.month)
    }
}

impl std::fmt::Display for Month {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{:02}", self.year, self.month)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[test]
    fn test_last_day_of_month() {
        assert_eq!(last_day_of_month(2025, 1), d(2025, 1, 31));
        assert_eq!(last_day_of_month(2025, 2), d(2025, 2, 28));
        assert_eq!(last_day_of_month(2024, 2), d(2024, 2, 29)); // Leap year
        assert_eq!(last_day_of_month(2025, 12), d(2025, 12, 31));
    }

    #[test]
    fn test_month_parse() {
        assert_eq!(Month::parse("2025-03").unwrap(), Month { year: 2025, month: 3 });
        assert_eq!(Month::parse(" 2025-3 ").unwrap(), Month { year: 2025, month: 3 });
        assert!(Month::parse("2025-13").is_err());
        assert!(Month::parse("March 2025").is_err());
    }

    #[test]
    fn test_month_succ_pred_wrap_year() {
        let dec = Month { year: 2024, month: 12 };
        assert_eq!(dec.succ(), Month { year: 2025, month: 1 });
        assert_eq!(dec.succ().pred(), dec);
        assert_eq!(dec.last_day(), d(2024, 12, 31));
    }

    #[test]
    fn test_round1() {
        assert_eq!(round1(8.3333), 8.3);
        assert_eq!(round1(2.25), 2.3);
        assert_eq!(round1(0.0), 0.0);
    }
}
