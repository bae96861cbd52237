//! UTC window arithmetic shared by the limiter and the store adapter.
//!
//! All window boundaries are epoch seconds: hour and day starts are exact
//! multiples of 3600 and 86400, month starts are the first instant of a UTC
//! calendar month.

use chrono::{Datelike, TimeZone, Utc};

pub const HOUR_SECS: i64 = 3600;
pub const DAY_SECS: i64 = 86_400;

/// Start of the clock hour containing `ts`.
#[must_use]
pub fn hour_start(ts: i64) -> i64 {
    ts - ts.rem_euclid(HOUR_SECS)
}

/// Start of the UTC day containing `ts`.
#[must_use]
pub fn day_start(ts: i64) -> i64 {
    ts - ts.rem_euclid(DAY_SECS)
}

/// First instant of the UTC calendar month containing `ts`.
#[must_use]
pub fn month_start(ts: i64) -> i64 {
    let dt = Utc.timestamp_opt(ts, 0).single().unwrap_or_default();
    Utc.with_ymd_and_hms(dt.year(), dt.month(), 1, 0, 0, 0)
        .single()
        .map_or(0, |start| start.timestamp())
}

/// Sliding-window weight of the previous hour: `1 - minutes_into_hour / 60`.
///
/// Always in `[0, 1]`; 1.0 at the top of the hour, approaching 0 at the end.
#[must_use]
pub fn previous_hour_weight(ts: i64) -> f64 {
    let minutes_into_hour = ts.rem_euclid(HOUR_SECS) / 60;
    1.0 - (minutes_into_hour as f64) / 60.0
}

/// Seconds until the next clock hour begins.
#[must_use]
pub fn seconds_to_next_hour(ts: i64) -> i64 {
    HOUR_SECS - ts.rem_euclid(HOUR_SECS)
}

/// Seconds until the next UTC midnight.
#[must_use]
pub fn seconds_to_next_midnight(ts: i64) -> i64 {
    DAY_SECS - ts.rem_euclid(DAY_SECS)
}

/// Current epoch seconds.
#[must_use]
pub fn now() -> i64 {
    Utc::now().timestamp()
}
