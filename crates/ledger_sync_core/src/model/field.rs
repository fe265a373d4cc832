//! Canonical activity fields and their typed values.
//!
//! # Responsibility
//! - Define the closed set of fields carried by a ledger record.
//! - Parse raw cell/column text into typed values with one set of rules
//!   shared by both stores.
//!
//! # Invariants
//! - `FieldId::as_str` is the canonical name and the destination column name.
//! - Blank input is always "absent", never a malformed value.
//! - `Hours` are stored exactly in hundredths of an hour.

use super::timestamp::parse_serial_datetime;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt::{Display, Formatter};

const DATE_RENDER_FORMAT: &str = "%Y-%m-%d";
const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%d/%m/%Y", "%d.%m.%Y", "%Y/%m/%d"];

/// Canonical ledger field identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldId {
    Employee,
    ActivityDate,
    Activity,
    Client,
    Hours,
    Status,
    Notes,
}

impl FieldId {
    /// Every field, in canonical column order.
    pub const ALL: [FieldId; 7] = [
        FieldId::Employee,
        FieldId::ActivityDate,
        FieldId::Activity,
        FieldId::Client,
        FieldId::Hours,
        FieldId::Status,
        FieldId::Notes,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Employee => "employee",
            Self::ActivityDate => "activity_date",
            Self::Activity => "activity",
            Self::Client => "client",
            Self::Hours => "hours",
            Self::Status => "status",
            Self::Notes => "notes",
        }
    }

    /// Resolves a canonical field name (as returned by `as_str`).
    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|field| field.as_str() == name.trim())
    }

    /// Parses raw text for this field.
    ///
    /// Returns `Ok(None)` for blank input.
    ///
    /// # Errors
    /// - Returns `MalformedValue` when non-blank text does not fit the field type.
    pub fn parse_value(self, raw: &str) -> Result<Option<Value>, MalformedValue> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Ok(None);
        }

        let parsed = match self {
            Self::ActivityDate => parse_date(trimmed).map(Value::Date),
            Self::Hours => parse_hours(trimmed).map(Value::Hours),
            Self::Employee | Self::Activity | Self::Client | Self::Status | Self::Notes => {
                Some(Value::Text(trimmed.to_string()))
            }
        };

        parsed.map(Some).ok_or_else(|| MalformedValue {
            field: self,
            raw: trimmed.to_string(),
        })
    }
}

impl Display for FieldId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Typed field value.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Value {
    Text(String),
    Date(NaiveDate),
    /// Hundredths of an hour (`750` = 7.5h).
    Hours(i64),
}

impl Value {
    /// Canonical text written back to either store.
    pub fn render(&self) -> String {
        match self {
            Self::Text(text) => text.clone(),
            Self::Date(date) => date.format(DATE_RENDER_FORMAT).to_string(),
            Self::Hours(hundredths) => render_hours(*hundredths),
        }
    }

    /// Numeric form used for the destination `hours REAL` column.
    pub fn as_hours_f64(&self) -> Option<f64> {
        match self {
            Self::Hours(hundredths) => Some(*hundredths as f64 / 100.0),
            Self::Text(_) | Self::Date(_) => None,
        }
    }
}

impl Display for Value {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.render())
    }
}

/// Non-blank input that does not fit the target field type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MalformedValue {
    pub field: FieldId,
    pub raw: String,
}

impl Display for MalformedValue {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "malformed {} value `{}`", self.field, self.raw)
    }
}

impl Error for MalformedValue {}

fn parse_date(raw: &str) -> Option<NaiveDate> {
    for format in DATE_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(raw, format) {
            return Some(date);
        }
    }
    parse_serial_datetime(raw).map(|value| value.date())
}

fn parse_hours(raw: &str) -> Option<i64> {
    if let Some((hours, minutes)) = raw.split_once(':') {
        let hours: i64 = hours.trim().parse().ok()?;
        let minutes: i64 = minutes.trim().parse().ok()?;
        if hours < 0 || !(0..60).contains(&minutes) {
            return None;
        }
        return hours.checked_mul(100)?.checked_add((minutes * 100 + 30) / 60);
    }

    let value: f64 = raw.replace(',', ".").parse().ok()?;
    let hundredths = (value * 100.0).round();
    if !hundredths.is_finite() || hundredths < 0.0 || hundredths >= i64::MAX as f64 {
        return None;
    }
    Some(hundredths as i64)
}

fn render_hours(hundredths: i64) -> String {
    let whole = hundredths / 100;
    let fraction = hundredths % 100;
    if fraction == 0 {
        whole.to_string()
    } else if fraction % 10 == 0 {
        format!("{whole}.{}", fraction / 10)
    } else {
        format!("{whole}.{fraction:02}")
    }
}
