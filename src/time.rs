//! Calendar and frequency utilities.
//!
//! All dates are `YYYY-MM-DD` strings interpreted in UTC; all timestamps are
//! milliseconds since the Unix epoch. Bar timestamps denote the bar *open*.

use anyhow::{bail, Context, Result};
use chrono::{Datelike, Duration, NaiveDate, NaiveDateTime, TimeZone, Utc};

use crate::models::Freq;

const MS_PER_DAY: i64 = 86_400_000;

/// Accepts `YYYY-MM-DD` or `YYYYMMDD` and returns the canonical dashed form.
pub fn standardize_date(date: &str) -> Result<String> {
    let parsed = parse_date(date)?;
    Ok(parsed.format("%Y-%m-%d").to_string())
}

/// Parse a date string (`YYYY-MM-DD` or `YYYYMMDD`).
pub fn parse_date(date: &str) -> Result<NaiveDate> {
    let trimmed = date.trim();
    let parsed = if trimmed.len() == 8 && !trimmed.contains('-') {
        NaiveDate::parse_from_str(trimmed, "%Y%m%d")
    } else {
        NaiveDate::parse_from_str(trimmed, "%Y-%m-%d")
    };
    parsed.with_context(|| format!("invalid date: {trimmed}"))
}

/// Millisecond timestamp of `date` at 00:00:00 UTC.
pub fn date_to_ts_start(date: &str) -> Result<i64> {
    let d = parse_date(date)?;
    Ok(day_start_ms(d))
}

/// Inclusive last-millisecond boundary of `date` for bars of `freq`.
///
/// For every supported frequency the last bar of a day closes at or before
/// the next-day boundary, so the inclusive end is next-day 00:00:00 UTC
/// minus one millisecond (23:59:59.999).
pub fn date_to_ts_end(date: &str, _freq: Freq) -> Result<i64> {
    let d = parse_date(date)?;
    Ok(day_start_ms(d) + MS_PER_DAY - 1)
}

/// `[start_of(start_date), end_of(end_date)]` as a ms range.
pub fn date_range_ms(start_date: &str, end_date: &str, freq: Freq) -> Result<(i64, i64)> {
    let start = date_to_ts_start(start_date)?;
    let end = date_to_ts_end(end_date, freq)?;
    if end < start {
        bail!("end date {end_date} precedes start date {start_date}");
    }
    Ok((start, end))
}

fn day_start_ms(d: NaiveDate) -> i64 {
    Utc.from_utc_datetime(&d.and_hms_opt(0, 0, 0).expect("midnight is valid"))
        .timestamp_millis()
}

/// Expected bar count for a ms duration at `freq`: ceil(duration / stride),
/// never less than one.
pub fn expected_points(duration_ms: i64, freq: Freq) -> Result<i64> {
    let stride = freq
        .stride_ms()
        .with_context(|| format!("frequency {freq} has no fixed stride"))?;
    let duration = duration_ms.max(0);
    Ok(((duration + stride - 1) / stride).max(1))
}

/// Calendar-month subtraction, month-end aware: the day of month is clamped
/// to the target month's length (2024-03-31 minus one month is 2024-02-29).
pub fn subtract_months(date: &str, months: u32) -> Result<String> {
    let d = parse_date(date)?;
    Ok(shift_months(d, -(months as i32)).format("%Y-%m-%d").to_string())
}

/// Calendar-month addition, month-end aware.
pub fn add_months(date: &str, months: u32) -> Result<String> {
    let d = parse_date(date)?;
    Ok(shift_months(d, months as i32).format("%Y-%m-%d").to_string())
}

/// Day offset (negative values step backwards).
pub fn add_days(date: &str, days: i64) -> Result<String> {
    let d = parse_date(date)?;
    Ok((d + Duration::days(days)).format("%Y-%m-%d").to_string())
}

fn shift_months(d: NaiveDate, months: i32) -> NaiveDate {
    let zero_based = d.year() * 12 + d.month0() as i32 + months;
    let year = zero_based.div_euclid(12);
    let month0 = zero_based.rem_euclid(12) as u32;
    let day = d.day().min(days_in_month(year, month0 + 1));
    NaiveDate::from_ymd_opt(year, month0 + 1, day).expect("clamped day is valid")
}

fn days_in_month(year: i32, month: u32) -> u32 {
    let (ny, nm) = if month == 12 { (year + 1, 1) } else { (year, month + 1) };
    NaiveDate::from_ymd_opt(ny, nm, 1)
        .expect("first of month is valid")
        .pred_opt()
        .expect("month has a last day")
        .day()
}

/// Ordered rebalance dates: `start`, then every `every_months` calendar
/// months, keeping dates that do not exceed `end`.
///
/// Each date is offset from `start` (not from the previous date), so a
/// month-end clamp does not drift the rest of the sequence: monthly from
/// Jan 31 gives Feb 29, Mar 31, Apr 30.
pub fn generate_rebalance_dates(start: &str, end: &str, every_months: u32) -> Result<Vec<String>> {
    if every_months == 0 {
        bail!("rebalance interval must be at least one month");
    }
    let start_d = parse_date(start)?;
    let end_d = parse_date(end)?;
    let mut dates = Vec::new();
    for step in 0u32.. {
        let current = shift_months(start_d, (step * every_months) as i32);
        if current > end_d {
            break;
        }
        dates.push(current.format("%Y-%m-%d").to_string());
    }
    Ok(dates)
}

/// UTC calendar-date bucket (`YYYYMMDD`) of a ms timestamp.
pub fn day_key(ts_ms: i64) -> String {
    let dt: NaiveDateTime = Utc
        .timestamp_millis_opt(ts_ms)
        .single()
        .map(|t| t.naive_utc())
        .unwrap_or_default();
    dt.format("%Y%m%d").to_string()
}

/// Start-of-day ms timestamp for the UTC day containing `ts_ms`.
pub fn day_floor_ms(ts_ms: i64) -> i64 {
    ts_ms.div_euclid(MS_PER_DAY) * MS_PER_DAY
}

/// Today's UTC date as `YYYY-MM-DD`.
pub fn today_utc() -> String {
    Utc::now().date_naive().format("%Y-%m-%d").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn day_start_is_midnight_utc() {
        assert_eq!(date_to_ts_start("2024-01-01").unwrap(), 1_704_067_200_000);
        assert_eq!(date_to_ts_start("20240101").unwrap(), 1_704_067_200_000);
    }

    #[test]
    fn day_end_is_last_millisecond() {
        let end = date_to_ts_end("2024-01-01", Freq::H1).unwrap();
        assert_eq!(end, 1_704_067_200_000 + 86_400_000 - 1);
        // Daily bars share the same inclusive boundary.
        assert_eq!(date_to_ts_end("2024-01-01", Freq::D1).unwrap(), end);
    }

    #[test]
    fn range_rejects_inverted_dates() {
        assert!(date_range_ms("2024-02-01", "2024-01-01", Freq::H1).is_err());
    }

    #[test]
    fn expected_points_rounds_up_and_floors_at_one() {
        assert_eq!(expected_points(86_400_000, Freq::H1).unwrap(), 24);
        assert_eq!(expected_points(90_000_000, Freq::H1).unwrap(), 25);
        assert_eq!(expected_points(1, Freq::D1).unwrap(), 1);
        assert_eq!(expected_points(0, Freq::M1).unwrap(), 1);
    }

    #[test]
    fn expected_points_rejects_monthly() {
        assert!(expected_points(86_400_000, Freq::Mo1).is_err());
    }

    #[test]
    fn month_subtraction_clamps_to_month_end() {
        assert_eq!(subtract_months("2024-03-31", 1).unwrap(), "2024-02-29");
        assert_eq!(subtract_months("2023-03-31", 1).unwrap(), "2023-02-28");
        assert_eq!(subtract_months("2024-01-15", 2).unwrap(), "2023-11-15");
        assert_eq!(add_months("2024-01-31", 1).unwrap(), "2024-02-29");
    }

    #[test]
    fn rebalance_dates_step_by_months() {
        let dates = generate_rebalance_dates("2024-01-01", "2024-07-01", 3).unwrap();
        assert_eq!(dates, vec!["2024-01-01", "2024-04-01", "2024-07-01"]);

        let dates = generate_rebalance_dates("2024-01-31", "2024-04-30", 1).unwrap();
        assert_eq!(dates, vec!["2024-01-31", "2024-02-29", "2024-03-31", "2024-04-30"]);
    }

    #[test]
    fn rebalance_dates_keep_only_in_range() {
        let dates = generate_rebalance_dates("2024-01-01", "2024-02-15", 2).unwrap();
        assert_eq!(dates, vec!["2024-01-01"]);
        assert!(generate_rebalance_dates("2024-01-01", "2024-06-01", 0).is_err());
    }

    #[test]
    fn day_key_uses_utc_calendar_date() {
        assert_eq!(day_key(1_704_067_200_000), "20240101");
        assert_eq!(day_key(1_704_067_200_000 + 86_399_999), "20240101");
        assert_eq!(day_key(1_704_067_200_000 + 86_400_000), "20240102");
    }
}
