//! Date helpers: user-facing bounds to unix seconds and back. All dates are UTC.

use crate::error::ConfigError;
use time::format_description::well_known::Rfc3339;
use time::macros::format_description;
use time::{Date, Month, OffsetDateTime};

/// Parse a bound given as `YYYY-MM-DD` (midnight UTC), RFC3339, or plain unix seconds.
pub fn parse_timestamp(s: &str) -> Result<i64, ConfigError> {
    let s = s.trim();
    let invalid = || ConfigError::InvalidDate { input: s.to_string() };

    if !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit()) {
        return s.parse::<i64>().map_err(|_| invalid());
    }
    if let Ok(dt) = OffsetDateTime::parse(s, &Rfc3339) {
        return Ok(dt.unix_timestamp());
    }
    let fmt = format_description!("[year]-[month]-[day]");
    let date = Date::parse(s, &fmt).map_err(|_| invalid())?;
    Ok(date.midnight().assume_utc().unix_timestamp())
}

/// `[Jan 1 of year, Jan 1 of year + 1)` as unix seconds.
pub fn year_bounds(year: i32) -> Result<(i64, i64), ConfigError> {
    let start = Date::from_calendar_date(year, Month::January, 1)
        .map_err(|_| ConfigError::InvalidDate { input: year.to_string() })?;
    let end = Date::from_calendar_date(year + 1, Month::January, 1)
        .map_err(|_| ConfigError::InvalidDate { input: (year + 1).to_string() })?;
    Ok((
        start.midnight().assume_utc().unix_timestamp(),
        end.midnight().assume_utc().unix_timestamp(),
    ))
}

pub fn now_unix() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp()
}

/// `YY-MM-DD`, for operator log lines. Falls back to the raw number when out of range.
pub fn format_day(ts: i64) -> String {
    let fmt = format_description!("[year repr:last_two]-[month]-[day]");
    OffsetDateTime::from_unix_timestamp(ts)
        .ok()
        .and_then(|dt| dt.format(&fmt).ok())
        .unwrap_or_else(|| ts.to_string())
}
