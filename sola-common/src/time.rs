//! Timestamp utilities
//!
//! Log rows store their time as RFC 3339 text with millisecond precision in UTC,
//! so lexicographic comparison in SQL matches chronological order.

use chrono::{DateTime, Datelike, Months, NaiveDate, SecondsFormat, Utc};

/// Get current UTC timestamp
pub fn now() -> DateTime<Utc> {
    Utc::now()
}

/// Format a timestamp the way log rows store it
pub fn to_log_time(time: DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// First instant of the calendar month containing `time`
pub fn month_start(time: DateTime<Utc>) -> DateTime<Utc> {
    NaiveDate::from_ymd_opt(time.year(), time.month(), 1)
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|d| d.and_utc())
        .unwrap_or(time)
}

/// First instant of the calendar month following `time`
pub fn next_month_start(time: DateTime<Utc>) -> DateTime<Utc> {
    let start = month_start(time);
    start.checked_add_months(Months::new(1)).unwrap_or(start)
}

/// Whole seconds left until the current month rolls over (at least 1)
pub fn seconds_until_month_end(time: DateTime<Utc>) -> u64 {
    (next_month_start(time) - time).num_seconds().max(1) as u64
}
