//! Destination activity table layout.
//!
//! # Invariants
//! - Column names are `entry_key`, `modified_at`, `origin_sheet` plus one
//!   column per `FieldId` named by `FieldId::as_str`.
//! - Table names are validated identifiers before being spliced into SQL.

use super::{DbError, DbResult};
use crate::model::field::FieldId;
use log::info;
use once_cell::sync::Lazy;
use regex::Regex;
use rusqlite::Connection;

pub const KEY_COLUMN: &str = "entry_key";
pub const MODIFIED_AT_COLUMN: &str = "modified_at";
pub const ORIGIN_SHEET_COLUMN: &str = "origin_sheet";

static TABLE_NAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]{0,62}$").expect("valid table name regex"));

/// Returns whether `name` can be used unquoted as a table identifier.
pub fn is_valid_table_name(name: &str) -> bool {
    TABLE_NAME_RE.is_match(name) && !name.to_ascii_lowercase().starts_with("sqlite_")
}

pub(crate) fn checked_table_name(name: &str) -> DbResult<&str> {
    if is_valid_table_name(name) {
        Ok(name)
    } else {
        Err(DbError::InvalidTableName(name.to_string()))
    }
}

fn column_type(field: FieldId) -> &'static str {
    match field {
        FieldId::Hours => "REAL",
        FieldId::Employee
        | FieldId::ActivityDate
        | FieldId::Activity
        | FieldId::Client
        | FieldId::Status
        | FieldId::Notes => "TEXT",
    }
}

/// `CREATE TABLE IF NOT EXISTS` statement for an activity table.
pub fn create_table_sql(table: &str) -> DbResult<String> {
    let table = checked_table_name(table)?;
    let mut columns = vec![format!("{KEY_COLUMN} TEXT PRIMARY KEY NOT NULL")];
    for field in FieldId::ALL {
        columns.push(format!("{} {}", field.as_str(), column_type(field)));
    }
    columns.push(format!("{MODIFIED_AT_COLUMN} TEXT"));
    columns.push(format!("{ORIGIN_SHEET_COLUMN} TEXT"));

    Ok(format!(
        "CREATE TABLE IF NOT EXISTS {table} (\n    {}\n);",
        columns.join(",\n    ")
    ))
}

/// Creates the destination table when missing. Existing tables are untouched.
pub fn ensure_activity_table(conn: &Connection, table: &str) -> DbResult<()> {
    conn.execute_batch(&create_table_sql(table)?)?;
    info!("event=schema_ensure module=db status=ok table={table}");
    Ok(())
}

/// Whether `table` exists in the connected database.
pub fn table_exists(conn: &Connection, table: &str) -> DbResult<bool> {
    let exists: i64 = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1);",
        [table],
        |row| row.get(0),
    )?;
    Ok(exists == 1)
}
