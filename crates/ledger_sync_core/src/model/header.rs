//! Header text → canonical column mapping.
//!
//! # Responsibility
//! - Normalize heterogeneous spreadsheet header text.
//! - Map normalized headers to structural columns or canonical fields.
//!
//! # Invariants
//! - Unknown headers resolve to `None`; they are never an error.
//! - Extra aliases are validated `Column`s, never raw strings.

use super::field::FieldId;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

static NON_ALNUM_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[^a-z0-9]+").expect("valid header separator regex"));

/// Column role after header normalization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Column {
    /// Primary key column.
    Key,
    /// Row modification timestamp column.
    ModifiedAt,
    Field(FieldId),
}

impl Column {
    /// Canonical name: `key`, `modified_at`, or a field name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Key => "key",
            Self::ModifiedAt => "modified_at",
            Self::Field(field) => field.as_str(),
        }
    }

    /// Resolves a canonical column name.
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim() {
            "key" => Some(Self::Key),
            "modified_at" => Some(Self::ModifiedAt),
            other => FieldId::parse(other).map(Self::Field),
        }
    }
}

impl Display for Column {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

const DEFAULT_ALIASES: &[(&str, Column)] = &[
    ("id", Column::Key),
    ("activity id", Column::Key),
    ("ref", Column::Key),
    ("reference", Column::Key),
    ("entry id", Column::Key),
    ("key", Column::Key),
    ("last modified", Column::ModifiedAt),
    ("modified", Column::ModifiedAt),
    ("modified at", Column::ModifiedAt),
    ("updated", Column::ModifiedAt),
    ("updated at", Column::ModifiedAt),
    ("last updated", Column::ModifiedAt),
    ("timestamp", Column::ModifiedAt),
    ("employee", Column::Field(FieldId::Employee)),
    ("staff", Column::Field(FieldId::Employee)),
    ("staff member", Column::Field(FieldId::Employee)),
    ("name", Column::Field(FieldId::Employee)),
    ("worker", Column::Field(FieldId::Employee)),
    ("date", Column::Field(FieldId::ActivityDate)),
    ("activity date", Column::Field(FieldId::ActivityDate)),
    ("day", Column::Field(FieldId::ActivityDate)),
    ("shift date", Column::Field(FieldId::ActivityDate)),
    ("activity", Column::Field(FieldId::Activity)),
    ("task", Column::Field(FieldId::Activity)),
    ("type", Column::Field(FieldId::Activity)),
    ("activity type", Column::Field(FieldId::Activity)),
    ("client", Column::Field(FieldId::Client)),
    ("customer", Column::Field(FieldId::Client)),
    ("site", Column::Field(FieldId::Client)),
    ("location", Column::Field(FieldId::Client)),
    ("hours", Column::Field(FieldId::Hours)),
    ("duration", Column::Field(FieldId::Hours)),
    ("time spent", Column::Field(FieldId::Hours)),
    ("hrs", Column::Field(FieldId::Hours)),
    ("status", Column::Field(FieldId::Status)),
    ("state", Column::Field(FieldId::Status)),
    ("notes", Column::Field(FieldId::Notes)),
    ("comments", Column::Field(FieldId::Notes)),
    ("comment", Column::Field(FieldId::Notes)),
    ("description", Column::Field(FieldId::Notes)),
];

/// Lowercases, collapses runs of non-alphanumerics to one space, and trims.
pub fn normalize_header(raw: &str) -> String {
    let lowered = raw.trim().to_lowercase();
    NON_ALNUM_RE
        .replace_all(&lowered, " ")
        .trim()
        .to_string()
}

/// Static header alias table, optionally extended by configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderMap {
    aliases: BTreeMap<String, Column>,
}

impl Default for HeaderMap {
    fn default() -> Self {
        let aliases = DEFAULT_ALIASES
            .iter()
            .map(|(alias, column)| ((*alias).to_string(), *column))
            .collect();
        Self { aliases }
    }
}

impl HeaderMap {
    /// Builds the default table plus extra aliases.
    ///
    /// Extra aliases are normalized the same way as header cells and override
    /// a default alias with the same normalized text.
    pub fn with_aliases<'a>(extra: impl IntoIterator<Item = (&'a str, Column)>) -> Self {
        let mut map = Self::default();
        for (alias, column) in extra {
            let normalized = normalize_header(alias);
            if !normalized.is_empty() {
                map.aliases.insert(normalized, column);
            }
        }
        map
    }

    /// Resolves raw header text to its column role.
    pub fn resolve(&self, header: &str) -> Option<Column> {
        self.aliases.get(&normalize_header(header)).copied()
    }
}
