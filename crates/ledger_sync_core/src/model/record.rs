//! Keyed ledger record and per-store snapshot.
//!
//! # Responsibility
//! - Define the normalized record shape shared by source and destination.
//! - Keep snapshot keys unique with first-occurrence-wins insertion.
//!
//! # Invariants
//! - `primary_key` is trimmed and non-empty.
//! - A snapshot never holds two records with the same key.
//! - `origin_sheet` is bookkeeping only and never takes part in value comparison.
//! - Value comparison covers only fields both records carry; a section without
//!   a column for a field neither agrees nor disagrees on it.

use super::field::{FieldId, MalformedValue, Value};
use super::timestamp::Timestamp;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};

/// One normalized ledger entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub primary_key: String,
    pub fields: BTreeMap<FieldId, Value>,
    pub modified_at: Option<Timestamp>,
    /// Source section the record was read from (or should be written to).
    pub origin_sheet: Option<String>,
    /// Fields the originating section has a column for; `None` carries all.
    pub carried: Option<BTreeSet<FieldId>>,
}

impl Record {
    pub fn new(primary_key: impl Into<String>) -> Self {
        Self {
            primary_key: primary_key.into().trim().to_string(),
            fields: BTreeMap::new(),
            modified_at: None,
            origin_sheet: None,
            carried: None,
        }
    }

    pub fn with_field(mut self, field: FieldId, value: Value) -> Self {
        self.fields.insert(field, value);
        self
    }

    pub fn with_text(self, field: FieldId, text: impl Into<String>) -> Self {
        self.with_field(field, Value::Text(text.into()))
    }

    pub fn with_modified_at(mut self, modified_at: Timestamp) -> Self {
        self.modified_at = Some(modified_at);
        self
    }

    pub fn with_origin_sheet(mut self, sheet: impl Into<String>) -> Self {
        self.origin_sheet = Some(sheet.into());
        self
    }

    pub fn with_carried(mut self, fields: impl IntoIterator<Item = FieldId>) -> Self {
        self.carried = Some(fields.into_iter().collect());
        self
    }

    /// Whether this record's store has a place for `field`.
    pub fn carries(&self, field: FieldId) -> bool {
        self.carried
            .as_ref()
            .map_or(true, |fields| fields.contains(&field))
    }

    /// Field-by-field comparison over the fields both records carry.
    pub fn same_values(&self, other: &Record) -> bool {
        FieldId::ALL
            .into_iter()
            .filter(|&field| self.carries(field) && other.carries(field))
            .all(|field| self.fields.get(&field) == other.fields.get(&field))
    }

    /// This record with `fallback`'s values for every field it does not carry.
    pub fn filled_from(&self, fallback: &Record) -> Record {
        let mut record = self.clone();
        for (&field, value) in &fallback.fields {
            if !self.carries(field) {
                record.fields.insert(field, value.clone());
            }
        }
        record.carried = None;
        record
    }

    pub fn rendered(&self, field: FieldId) -> Option<String> {
        self.fields.get(&field).map(Value::render)
    }
}

/// Point-in-time keyed read of one store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    records: BTreeMap<String, Record>,
}

impl Snapshot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a record unless its key is already present.
    ///
    /// Returns the rejected record when the key already exists, so callers can
    /// report the duplicate.
    pub fn insert_first(&mut self, record: Record) -> Result<(), Record> {
        if self.records.contains_key(&record.primary_key) {
            return Err(record);
        }
        self.records.insert(record.primary_key.clone(), record);
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<&Record> {
        self.records.get(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.records.contains_key(key)
    }

    /// Keys in ascending order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.records.keys().map(String::as_str)
    }

    pub fn records(&self) -> impl Iterator<Item = &Record> {
        self.records.values()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl FromIterator<Record> for Snapshot {
    fn from_iter<T: IntoIterator<Item = Record>>(iter: T) -> Self {
        let mut snapshot = Snapshot::new();
        for record in iter {
            let _ = snapshot.insert_first(record);
        }
        snapshot
    }
}

/// A value that was nulled while reading a row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MalformedCell {
    pub key: String,
    pub column: String,
    pub raw: String,
}

impl MalformedCell {
    pub fn from_value(key: &str, value: MalformedValue) -> Self {
        Self {
            key: key.to_string(),
            column: value.field.as_str().to_string(),
            raw: value.raw,
        }
    }
}

/// Recoverable findings collected while building a snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReadDiagnostics {
    /// Keys whose later occurrences were dropped.
    pub duplicate_keys: Vec<String>,
    pub rows_without_key: usize,
    pub malformed_values: Vec<MalformedCell>,
    /// Optional sections that were skipped.
    pub sections_skipped: Vec<String>,
}

impl ReadDiagnostics {
    pub fn is_clean(&self) -> bool {
        self.duplicate_keys.is_empty()
            && self.rows_without_key == 0
            && self.malformed_values.is_empty()
            && self.sections_skipped.is_empty()
    }
}
