//! Time literal parsing and timezone-aware formatting.

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, TimeZone, Timelike, Utc};
use chrono_tz::Tz;
use thiserror::Error;

use super::types::TimeUnit;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum TimeError {
    #[error("invalid timezone '{0}'")]
    InvalidTimezone(String),

    #[error("invalid date literal '{0}'")]
    InvalidDate(String),

    #[error("invalid timestamp literal '{0}'")]
    InvalidTimestamp(String),

    #[error("'{0}' is not a valid local time in {1}")]
    NonexistentLocalTime(String, String),
}

const TIMESTAMP_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%dT%H:%M",
];

/// Canonical SQL timestamp text.
pub const TIMESTAMP_SQL_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

pub fn parse_timezone(name: &str) -> Result<Tz, TimeError> {
    name.parse::<Tz>()
        .map_err(|_| TimeError::InvalidTimezone(name.to_string()))
}

pub fn parse_date(text: &str) -> Result<NaiveDate, TimeError> {
    NaiveDate::parse_from_str(text, "%Y-%m-%d").map_err(|_| TimeError::InvalidDate(text.to_string()))
}

pub fn parse_timestamp(text: &str) -> Result<NaiveDateTime, TimeError> {
    TIMESTAMP_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(text, fmt).ok())
        .ok_or_else(|| TimeError::InvalidTimestamp(text.to_string()))
}

/// Convert a civil timestamp in `timezone` to UTC text.
///
/// Ambiguous local times (DST fall-back) resolve to the earlier instant.
pub fn timestamp_to_utc(text: &str, timezone: &str) -> Result<String, TimeError> {
    let civil = parse_timestamp(text)?;
    let tz = parse_timezone(timezone)?;
    let local = tz
        .from_local_datetime(&civil)
        .earliest()
        .ok_or_else(|| TimeError::NonexistentLocalTime(text.to_string(), timezone.to_string()))?;
    Ok(local
        .with_timezone(&Utc)
        .format(TIMESTAMP_SQL_FORMAT)
        .to_string())
}

/// Parse a value read back from a result row into a UTC instant.
///
/// Accepts RFC 3339, naive timestamps (taken as UTC) and plain dates.
pub fn parse_instant(text: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(naive) = parse_timestamp(text) {
        return Some(Utc.from_utc_datetime(&naive));
    }
    parse_date(text)
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| Utc.from_utc_datetime(&naive))
}

/// Monday on or before `date`.
pub fn week_start(date: NaiveDate) -> NaiveDate {
    date - Duration::days(i64::from(date.weekday().num_days_from_monday()))
}

/// Format a date truncated to `unit` as a time literal.
pub fn format_date(date: NaiveDate, unit: TimeUnit) -> String {
    match unit {
        TimeUnit::Year => format!("@{:04}", date.year()),
        TimeUnit::Quarter => format!("@{:04}-Q{}", date.year(), (date.month0() / 3) + 1),
        TimeUnit::Month => format!("@{:04}-{:02}", date.year(), date.month()),
        TimeUnit::Week => format!("@{}-WK", week_start(date).format("%Y-%m-%d")),
        _ => format!("@{}", date.format("%Y-%m-%d")),
    }
}

/// Format an instant as a time literal in `tz`, truncated to `unit`.
pub fn format_timestamp<T: TimeZone>(instant: &DateTime<Utc>, unit: TimeUnit, tz: &T) -> String
where
    T::Offset: std::fmt::Display,
{
    let local = instant.with_timezone(tz);
    let date = local.date_naive();
    match unit {
        TimeUnit::Second => format!(
            "@{} {:02}:{:02}:{:02}",
            date.format("%Y-%m-%d"),
            local.hour(),
            local.minute(),
            local.second()
        ),
        TimeUnit::Minute => format!(
            "@{} {:02}:{:02}",
            date.format("%Y-%m-%d"),
            local.hour(),
            local.minute()
        ),
        TimeUnit::Hour => format!("@{} {:02}", date.format("%Y-%m-%d"), local.hour()),
        date_unit => format_date(date, date_unit),
    }
}
