//! Calendar helpers shared by the scraper and the loader.
//!
//! Both jobs walk calendar ranges bounded by a watermark: the bond scraper
//! pages backward one day at a time inside year windows, the price-catcher
//! loader walks forward one month at a time.

use chrono::{Datelike, Duration, NaiveDate, Utc};
use chrono_tz::Tz;

/// First and last day of `year`, clamped to `[watermark, today]`.
///
/// Returns `None` when the clamped window is empty (the year lies entirely
/// before the watermark or after today).
pub fn year_window(year: i32, watermark: NaiveDate, today: NaiveDate) -> Option<(NaiveDate, NaiveDate)> {
    let jan1 = NaiveDate::from_ymd_opt(year, 1, 1)?;
    let dec31 = NaiveDate::from_ymd_opt(year, 12, 31)?;
    let start = jan1.max(watermark);
    let end = dec31.min(today);
    (start <= end).then_some((start, end))
}

/// Every calendar day in `[start, end]`, newest first.
pub fn days_descending(start: NaiveDate, end: NaiveDate) -> Vec<NaiveDate> {
    if start > end {
        return Vec::new();
    }
    let n = (end - start).num_days();
    (0..=n).map(|i| end - Duration::days(i)).collect()
}

/// Inclusive `YYYY-MM` labels from the month of `start` to the month of `end`.
pub fn months_between(start: NaiveDate, end: NaiveDate) -> Vec<String> {
    let mut months = Vec::new();
    let (mut year, mut month) = (start.year(), start.month());
    let (end_year, end_month) = (end.year(), end.month());

    while (year, month) <= (end_year, end_month) {
        months.push(format!("{year:04}-{month:02}"));
        if month == 12 {
            year += 1;
            month = 1;
        } else {
            month += 1;
        }
    }
    months
}

/// Today's date in the given IANA timezone.
pub fn today_in(tz: Tz) -> NaiveDate {
    Utc::now().with_timezone(&tz).date_naive()
}

/// Date from days since 1970-01-01 (the physical value of a polars Date).
///
/// `None` when the result falls outside chrono's supported range.
pub fn from_epoch_days(days: i32) -> Option<NaiveDate> {
    NaiveDate::default().checked_add_signed(Duration::days(days as i64))
}

/// Days since 1970-01-01.
pub fn to_epoch_days(date: NaiveDate) -> i32 {
    (date - NaiveDate::default()).num_days() as i32
}

/// Parse a `YYYY-MM-DD` string.
pub fn parse_date(s: &str) -> Result<NaiveDate, chrono::ParseError> {
    NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[test]
    fn year_window_clamps_both_ends() {
        let watermark = d(2023, 6, 15);
        let today = d(2024, 3, 1);

        assert_eq!(year_window(2023, watermark, today), Some((d(2023, 6, 15), d(2023, 12, 31))));
        assert_eq!(year_window(2024, watermark, today), Some((d(2024, 1, 1), d(2024, 3, 1))));
        assert_eq!(year_window(2022, watermark, today), None);
        assert_eq!(year_window(2025, watermark, today), None);
    }

    #[test]
    fn days_descending_is_newest_first_and_inclusive() {
        let days = days_descending(d(2024, 2, 27), d(2024, 3, 1));
        assert_eq!(days, vec![d(2024, 3, 1), d(2024, 2, 29), d(2024, 2, 28), d(2024, 2, 27)]);
        assert!(days_descending(d(2024, 3, 2), d(2024, 3, 1)).is_empty());
    }

    #[test]
    fn months_between_crosses_year_boundary() {
        let months = months_between(d(2023, 11, 30), d(2024, 2, 1));
        assert_eq!(months, vec!["2023-11", "2023-12", "2024-01", "2024-02"]);
    }

    #[test]
    fn months_between_same_month_yields_one_label() {
        assert_eq!(months_between(d(2024, 5, 1), d(2024, 5, 31)), vec!["2024-05"]);
        assert!(months_between(d(2024, 6, 1), d(2024, 5, 31)).is_empty());
    }

    #[test]
    fn parse_date_trims_whitespace() {
        assert_eq!(parse_date(" 2024-01-02 ").unwrap(), d(2024, 1, 2));
        assert!(parse_date("02/01/2024").is_err());
    }

    #[test]
    fn epoch_days_conversion() {
        assert_eq!(from_epoch_days(0), Some(d(1970, 1, 1)));
        assert_eq!(to_epoch_days(d(2024, 1, 2)), 19724);
        assert_eq!(from_epoch_days(19724), Some(d(2024, 1, 2)));
    }

    #[test]
    fn out_of_range_epoch_days_are_none() {
        assert_eq!(from_epoch_days(i32::MAX), None);
        assert_eq!(from_epoch_days(i32::MIN), None);
    }

    proptest! {
        #[test]
        fn days_descending_covers_range(offset in 0i64..5000, len in 0i64..400) {
            let start = d(2006, 9, 28) + Duration::days(offset);
            let end = start + Duration::days(len);
            let days = days_descending(start, end);
            prop_assert_eq!(days.len() as i64, len + 1);
            prop_assert_eq!(days[0], end);
            prop_assert_eq!(*days.last().unwrap(), start);
            prop_assert!(days.windows(2).all(|w| w[0] - w[1] == Duration::days(1)));
        }

        #[test]
        fn months_between_count_matches_month_span(offset in 0i64..5000, len in 0i64..2000) {
            let start = d(2006, 1, 1) + Duration::days(offset);
            let end = start + Duration::days(len);
            let months = months_between(start, end);
            let expected = (end.year() - start.year()) * 12 + end.month() as i32 - start.month() as i32 + 1;
            prop_assert_eq!(months.len() as i32, expected);
            prop_assert_eq!(months.first().unwrap(), &format!("{:04}-{:02}", start.year(), start.month()));
            prop_assert_eq!(months.last().unwrap(), &format!("{:04}-{:02}", end.year(), end.month()));
        }
    }
}
