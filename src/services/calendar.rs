//! Business-day arithmetic for fund release dates.
//!
//! All arithmetic is done on UTC instants; the weekday of a timestamp is its
//! UTC weekday. Public holidays are not considered.

use chrono::{DateTime, Datelike, Duration, Utc, Weekday};

pub fn is_weekend(instant: DateTime<Utc>) -> bool {
    matches!(instant.weekday(), Weekday::Sat | Weekday::Sun)
}

/// Advance `start` one calendar day at a time, counting only the days that
/// land on Monday..Friday, until `working_days` have been counted. The time
/// of day is preserved.
pub fn add_working_days(start: DateTime<Utc>, working_days: u32) -> DateTime<Utc> {
    let mut current = start;
    let mut counted = 0;
    while counted < working_days {
        current += Duration::days(1);
        if !is_weekend(current) {
            counted += 1;
        }
    }
    current
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use proptest::prelude::*;

    fn at(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 15, 30, 0).unwrap()
    }

    #[test]
    fn friday_plus_three_is_wednesday() {
        // 2026-10-16 is a Friday
        let release = add_working_days(at(2026, 10, 16), 3);
        assert_eq!(release, at(2026, 10, 21));
        assert_eq!(release.weekday(), Weekday::Wed);
    }

    #[test]
    fn monday_plus_three_is_thursday() {
        let release = add_working_days(at(2026, 10, 19), 3);
        assert_eq!(release, at(2026, 10, 22));
        assert_eq!(release.weekday(), Weekday::Thu);
    }

    #[test]
    fn weekend_start_counts_from_monday() {
        assert_eq!(add_working_days(at(2026, 10, 17), 1), at(2026, 10, 19));
        assert_eq!(add_working_days(at(2026, 10, 18), 3), at(2026, 10, 21));
    }

    #[test]
    fn zero_days_is_identity() {
        assert_eq!(add_working_days(at(2026, 10, 17), 0), at(2026, 10, 17));
    }

    #[test]
    fn crosses_month_and_year_boundaries() {
        // Wednesday 2025-12-31 -> Thu, Fri, Mon
        assert_eq!(add_working_days(at(2025, 12, 31), 3), at(2026, 1, 5));
    }

    proptest! {
        #[test]
        fn result_is_a_weekday_with_exact_count(offset in 0i64..3650, n in 1u32..30) {
            let start = at(2020, 1, 1) + Duration::days(offset);
            let end = add_working_days(start, n);

            prop_assert!(!is_weekend(end));
            let weekdays = (1..=(end - start).num_days())
                .filter(|d| !is_weekend(start + Duration::days(*d)))
                .count() as u32;
            prop_assert_eq!(weekdays, n);
        }
    }
}
