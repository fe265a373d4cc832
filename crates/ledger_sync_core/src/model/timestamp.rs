//! Modification timestamp type and tolerant parsing.
//!
//! # Responsibility
//! - Own the single parsing entry point for every timestamp read from either store.
//! - Provide second-granularity comparison as an explicit operation.
//!
//! # Invariants
//! - Parsing never fails loudly: unknown formats yield `None`.
//! - `cmp_seconds` ignores sub-second components on both sides.
//! - Timestamps are timezone-less wall-clock values; offset-bearing inputs are
//!   converted to UTC wall clock.

use chrono::{DateTime, Local, NaiveDate, NaiveDateTime, NaiveTime, Timelike};
use std::cmp::Ordering;
use std::fmt::{Display, Formatter};

const STORAGE_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

const DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%dT%H:%M",
    "%d/%m/%Y %H:%M:%S",
    "%d/%m/%Y %H:%M",
    "%Y/%m/%d %H:%M:%S",
    "%Y/%m/%d %H:%M",
];

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%d/%m/%Y", "%d.%m.%Y", "%Y/%m/%d"];

/// Spreadsheet serial numbers below this are treated as plain numbers (1927-05-18).
const MIN_SERIAL_DAY: f64 = 10_000.0;
/// Last representable spreadsheet day (9999-12-31).
const MAX_SERIAL_DAY: f64 = 2_958_465.0;
const SECONDS_PER_DAY: f64 = 86_400.0;

/// Wall-clock modification time of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(NaiveDateTime);

impl Timestamp {
    pub fn from_naive(value: NaiveDateTime) -> Self {
        Self(value)
    }

    /// Current local wall-clock time, floored to whole seconds.
    pub fn now() -> Self {
        Self(Local::now().naive_local()).floor_seconds()
    }

    /// Builds a timestamp from unix epoch seconds (UTC wall clock).
    pub fn from_epoch_seconds(seconds: i64) -> Option<Self> {
        DateTime::from_timestamp(seconds, 0).map(|value| Self(value.naive_utc()))
    }

    /// Drops the sub-second component.
    pub fn floor_seconds(self) -> Self {
        Self(self.0.with_nanosecond(0).unwrap_or(self.0))
    }

    /// Compares two timestamps at whole-second granularity.
    pub fn cmp_seconds(&self, other: &Self) -> Ordering {
        self.floor_seconds().0.cmp(&other.floor_seconds().0)
    }

    pub fn as_naive(&self) -> NaiveDateTime {
        self.0
    }

    /// Canonical text form written to both stores.
    pub fn to_storage_string(&self) -> String {
        self.0.format(STORAGE_FORMAT).to_string()
    }
}

impl Display for Timestamp {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.format(STORAGE_FORMAT))
    }
}

/// Parses a raw cell or column value into a timestamp.
///
/// Returns `None` for blank input and for anything that matches no known
/// format. Callers decide whether `None` from non-blank input is worth a
/// diagnostic.
pub fn parse_timestamp(raw: &str) -> Option<Timestamp> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }

    if let Ok(value) = DateTime::parse_from_rfc3339(trimmed) {
        return Some(Timestamp(value.naive_utc()));
    }

    for format in DATETIME_FORMATS {
        if let Ok(value) = NaiveDateTime::parse_from_str(trimmed, format) {
            return Some(Timestamp(value));
        }
    }

    for format in DATE_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(trimmed, format) {
            return Some(Timestamp(date.and_time(NaiveTime::MIN)));
        }
    }

    parse_serial_datetime(trimmed).map(Timestamp)
}

/// Parses a spreadsheet day serial (days since 1899-12-30, fraction = time of day).
pub(crate) fn parse_serial_datetime(raw: &str) -> Option<NaiveDateTime> {
    if !raw.chars().all(|c| c.is_ascii_digit() || c == '.') {
        return None;
    }
    let serial: f64 = raw.parse().ok()?;
    if !(MIN_SERIAL_DAY..=MAX_SERIAL_DAY).contains(&serial) {
        return None;
    }

    let epoch = NaiveDate::from_ymd_opt(1899, 12, 30)?.and_time(NaiveTime::MIN);
    let whole_days = serial.trunc() as i64;
    let seconds = (serial.fract() * SECONDS_PER_DAY).round() as i64;
    epoch
        .checked_add_signed(chrono::Duration::days(whole_days))?
        .checked_add_signed(chrono::Duration::seconds(seconds))
}
