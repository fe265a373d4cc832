//! Destination-side store: one relational activity table.
//!
//! # Responsibility
//! - Read the whole table into a keyed snapshot with the same value rules as
//!   the workbook extractor.
//! - Apply one destination batch inside a single immediate transaction.
//!
//! # Invariants
//! - Snapshot reads never open a write transaction.
//! - A batch commits completely or not at all; the first failing row rolls
//!   back every statement before it.
//! - An insert hitting an existing key or an update matching no row is a
//!   write conflict, never silently ignored.
//! - Updates and deletes address a row by the key exactly as stored, so a
//!   padded stored key stays reachable through its trimmed snapshot key.

use crate::db::schema::{checked_table_name, KEY_COLUMN, MODIFIED_AT_COLUMN, ORIGIN_SHEET_COLUMN};
use crate::db::{DbError, DbResult};
use crate::model::field::{FieldId, Value};
use crate::model::header::Column;
use crate::model::record::{MalformedCell, Record};
use crate::model::timestamp::{parse_timestamp, Timestamp};
use crate::source::Extraction;
use log::{error, info, warn};
use rusqlite::types::{ToSqlOutput, ValueRef};
use rusqlite::{params_from_iter, Connection, ErrorCode, Row, Transaction, TransactionBehavior};
use serde::Serialize;
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::time::Instant;

pub type StoreResult<T> = Result<T, StoreError>;

/// Destination failure.
#[derive(Debug)]
pub enum StoreError {
    Db(DbError),
    /// A single row could not be written; the whole batch was rolled back.
    WriteConflict {
        key: String,
        action: WriteAction,
        reason: String,
    },
}

impl Display for StoreError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Db(err) => write!(f, "{err}"),
            Self::WriteConflict {
                key,
                action,
                reason,
            } => write!(
                f,
                "destination {} of `{key}` failed, batch rolled back: {reason}",
                action.as_str()
            ),
        }
    }
}

impl Error for StoreError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Db(err) => Some(err),
            Self::WriteConflict { .. } => None,
        }
    }
}

impl From<DbError> for StoreError {
    fn from(value: DbError) -> Self {
        Self::Db(value)
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Db(DbError::Sqlite(value))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteAction {
    Insert,
    Update,
    Delete,
}

impl WriteAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Insert => "insert",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

/// Destination writes of one run, applied as one transaction.
#[derive(Debug, Clone, Copy, Default)]
pub struct DestinationBatch<'a> {
    pub inserts: &'a [Record],
    pub updates: &'a [Record],
    pub deletes: &'a [String],
}

impl DestinationBatch<'_> {
    pub fn is_empty(&self) -> bool {
        self.inserts.is_empty() && self.updates.is_empty() && self.deletes.is_empty()
    }
}

/// Rows actually changed by a committed batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchOutcome {
    pub inserted: usize,
    pub updated: usize,
    pub deleted: usize,
}

/// Keyed read and transactional write access to the destination table.
pub trait RowStore {
    fn read_snapshot(&self) -> StoreResult<Extraction>;
    fn apply_batch(&self, batch: &DestinationBatch<'_>) -> StoreResult<BatchOutcome>;
}

/// SQLite-backed destination table.
pub struct SqliteRowStore<'conn> {
    conn: &'conn Connection,
    table: String,
    /// Trimmed key to stored key, for rows of the last read whose key is padded.
    stored_keys: RefCell<BTreeMap<String, String>>,
}

impl<'conn> SqliteRowStore<'conn> {
    /// Binds the store to `table`.
    ///
    /// # Errors
    /// - `DbError::InvalidTableName` when `table` is not a plain identifier.
    pub fn new(conn: &'conn Connection, table: &str) -> DbResult<Self> {
        Ok(Self {
            conn,
            table: checked_table_name(table)?.to_string(),
            stored_keys: RefCell::default(),
        })
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    fn select_sql(&self) -> String {
        let mut columns = vec![KEY_COLUMN];
        columns.extend(FieldId::ALL.iter().map(|field| field.as_str()));
        columns.push(MODIFIED_AT_COLUMN);
        columns.push(ORIGIN_SHEET_COLUMN);
        format!(
            "SELECT {} FROM {} ORDER BY {KEY_COLUMN};",
            columns.join(", "),
            self.table
        )
    }
}

impl RowStore for SqliteRowStore<'_> {
    fn read_snapshot(&self) -> StoreResult<Extraction> {
        let started_at = Instant::now();
        let mut stmt = match self.conn.prepare(&self.select_sql()) {
            Ok(stmt) => stmt,
            Err(err) => {
                error!(
                    "event=dest_read module=store status=error table={} error_code=select_failed error={}",
                    self.table, err
                );
                return Err(err.into());
            }
        };

        let mut extraction = Extraction::default();
        let mut stored_keys = BTreeMap::new();
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            let raw_key = cell_text(row.get_ref(0)?);
            let Some(record) = parse_record_row(row, &mut extraction)? else {
                extraction.diagnostics.rows_without_key += 1;
                continue;
            };
            let padded = raw_key
                .filter(|raw| *raw != record.primary_key)
                .map(|raw| (record.primary_key.clone(), raw));
            match extraction.snapshot.insert_first(record) {
                Ok(()) => {
                    if let Some((key, raw)) = padded {
                        stored_keys.insert(key, raw);
                    }
                }
                Err(duplicate) => {
                    warn!(
                        "event=dest_duplicate module=store status=skip table={} key={}",
                        self.table, duplicate.primary_key
                    );
                    extraction
                        .diagnostics
                        .duplicate_keys
                        .push(duplicate.primary_key);
                }
            }
        }
        *self.stored_keys.borrow_mut() = stored_keys;

        info!(
            "event=dest_read module=store status=ok table={} records={} malformed={} duration_ms={}",
            self.table,
            extraction.snapshot.len(),
            extraction.diagnostics.malformed_values.len(),
            started_at.elapsed().as_millis()
        );
        Ok(extraction)
    }

    fn apply_batch(&self, batch: &DestinationBatch<'_>) -> StoreResult<BatchOutcome> {
        let started_at = Instant::now();
        info!(
            "event=dest_batch module=store status=start table={} inserts={} updates={} deletes={}",
            self.table,
            batch.inserts.len(),
            batch.updates.len(),
            batch.deletes.len()
        );

        // Dropping `tx` on any early return rolls the batch back.
        let tx = Transaction::new_unchecked(self.conn, TransactionBehavior::Immediate)?;
        let result = write_batch(&tx, &self.table, batch, &self.stored_keys.borrow());
        let outcome = match result {
            Ok(outcome) => outcome,
            Err(err) => {
                error!(
                    "event=dest_batch module=store status=error table={} error_code=batch_rolled_back error={}",
                    self.table, err
                );
                return Err(err);
            }
        };
        tx.commit()?;

        info!(
            "event=dest_batch module=store status=ok table={} inserted={} updated={} deleted={} duration_ms={}",
            self.table,
            outcome.inserted,
            outcome.updated,
            outcome.deleted,
            started_at.elapsed().as_millis()
        );
        Ok(outcome)
    }
}

fn write_batch(
    tx: &Transaction<'_>,
    table: &str,
    batch: &DestinationBatch<'_>,
    stored_keys: &BTreeMap<String, String>,
) -> StoreResult<BatchOutcome> {
    let mut outcome = BatchOutcome::default();
    let stored_key = |key: &str| -> String {
        stored_keys
            .get(key)
            .cloned()
            .unwrap_or_else(|| key.to_string())
    };

    let field_columns: Vec<&str> = FieldId::ALL.iter().map(|field| field.as_str()).collect();
    let insert_sql = format!(
        "INSERT INTO {table} ({KEY_COLUMN}, {}, {MODIFIED_AT_COLUMN}, {ORIGIN_SHEET_COLUMN}) VALUES ({});",
        field_columns.join(", "),
        (1..=field_columns.len() + 3)
            .map(|index| format!("?{index}"))
            .collect::<Vec<_>>()
            .join(", ")
    );
    let update_sql = format!(
        "UPDATE {table} SET {}, {MODIFIED_AT_COLUMN} = ?{}, {ORIGIN_SHEET_COLUMN} = ?{} WHERE {KEY_COLUMN} = ?1;",
        field_columns
            .iter()
            .enumerate()
            .map(|(index, column)| format!("{column} = ?{}", index + 2))
            .collect::<Vec<_>>()
            .join(", "),
        field_columns.len() + 2,
        field_columns.len() + 3
    );
    let delete_sql = format!("DELETE FROM {table} WHERE {KEY_COLUMN} = ?1;");

    for record in batch.inserts {
        tx.execute(
            &insert_sql,
            params_from_iter(row_params(record, &record.primary_key)),
        )
            .map_err(|err| conflict_or_db(record, WriteAction::Insert, err))?;
        outcome.inserted += 1;
    }

    for record in batch.updates {
        let key = stored_key(record.primary_key.as_str());
        let changed = tx
            .execute(&update_sql, params_from_iter(row_params(record, &key)))
            .map_err(|err| conflict_or_db(record, WriteAction::Update, err))?;
        if changed == 0 {
            return Err(StoreError::WriteConflict {
                key: record.primary_key.clone(),
                action: WriteAction::Update,
                reason: "no destination row holds this key".to_string(),
            });
        }
        outcome.updated += 1;
    }

    for key in batch.deletes {
        outcome.deleted += tx.execute(&delete_sql, [stored_key(key.as_str())])?;
    }

    Ok(outcome)
}

fn conflict_or_db(record: &Record, action: WriteAction, err: rusqlite::Error) -> StoreError {
    match err.sqlite_error_code() {
        Some(ErrorCode::ConstraintViolation) => StoreError::WriteConflict {
            key: record.primary_key.clone(),
            action,
            reason: err.to_string(),
        },
        _ => StoreError::from(err),
    }
}

/// Bind values in column order: key, every field, modified_at, origin_sheet.
fn row_params<'a>(record: &'a Record, key: &'a str) -> Vec<ToSqlOutput<'a>> {
    let mut params = Vec::with_capacity(FieldId::ALL.len() + 3);
    params.push(ToSqlOutput::from(key));
    for field in FieldId::ALL {
        let value = match record.fields.get(&field) {
            None => ToSqlOutput::from(rusqlite::types::Null),
            Some(Value::Hours(hundredths)) => ToSqlOutput::from(*hundredths as f64 / 100.0),
            Some(other) => ToSqlOutput::from(other.render()),
        };
        params.push(value);
    }
    params.push(match record.modified_at {
        Some(timestamp) => ToSqlOutput::from(timestamp.to_storage_string()),
        None => ToSqlOutput::from(rusqlite::types::Null),
    });
    params.push(match record.origin_sheet.as_deref() {
        Some(sheet) => ToSqlOutput::from(sheet),
        None => ToSqlOutput::from(rusqlite::types::Null),
    });
    params
}

fn parse_record_row(row: &Row<'_>, extraction: &mut Extraction) -> StoreResult<Option<Record>> {
    let Some(key) = cell_text(row.get_ref(0)?) else {
        return Ok(None);
    };
    let key = key.trim();
    if key.is_empty() {
        return Ok(None);
    }

    let mut record = Record::new(key);
    for (offset, field) in FieldId::ALL.into_iter().enumerate() {
        let Some(raw) = cell_text(row.get_ref(offset + 1)?) else {
            continue;
        };
        match field.parse_value(&raw) {
            Ok(Some(value)) => {
                record.fields.insert(field, value);
            }
            Ok(None) => {}
            Err(malformed) => {
                warn!(
                    "event=dest_value module=store status=skip key={} column={}",
                    key, field
                );
                extraction
                    .diagnostics
                    .malformed_values
                    .push(MalformedCell::from_value(key, malformed));
            }
        }
    }

    let modified_at_index = FieldId::ALL.len() + 1;
    match row.get_ref(modified_at_index)? {
        ValueRef::Null => {}
        ValueRef::Integer(seconds) => {
            record.modified_at = Timestamp::from_epoch_seconds(seconds);
        }
        other => {
            let raw = cell_text(other).unwrap_or_default();
            record.modified_at = parse_timestamp(&raw);
            if record.modified_at.is_none() && !raw.trim().is_empty() {
                extraction.diagnostics.malformed_values.push(MalformedCell {
                    key: key.to_string(),
                    column: Column::ModifiedAt.as_str().to_string(),
                    raw: raw.trim().to_string(),
                });
            }
        }
    }

    record.origin_sheet = cell_text(row.get_ref(modified_at_index + 1)?)
        .map(|sheet| sheet.trim().to_string())
        .filter(|sheet| !sheet.is_empty());

    Ok(Some(record))
}

/// Text form of a stored cell; `None` for NULL.
fn cell_text(value: ValueRef<'_>) -> Option<String> {
    match value {
        ValueRef::Null => None,
        ValueRef::Integer(number) => Some(number.to_string()),
        ValueRef::Real(number) => Some(number.to_string()),
        ValueRef::Text(bytes) | ValueRef::Blob(bytes) => {
            Some(String::from_utf8_lossy(bytes).into_owned())
        }
    }
}
