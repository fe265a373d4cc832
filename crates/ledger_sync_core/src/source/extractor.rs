//! Workbook sections → keyed snapshot.
//!
//! # Responsibility
//! - Map header text to canonical columns and build typed records.
//! - Absorb per-cell and per-row problems as diagnostics.
//!
//! # Invariants
//! - Rows without a key are dropped and counted.
//! - Duplicate keys keep the first occurrence (section order, then row order).
//! - Unparseable timestamps become `None` and are recorded as malformed cells.

use super::sheet::is_blank_row;
use super::{ColumnLayout, SectionSpec, Sheet, SourceError, SourceHandle};
use crate::model::header::{Column, HeaderMap};
use crate::model::record::{MalformedCell, ReadDiagnostics, Record, Snapshot};
use crate::model::timestamp::parse_timestamp;
use log::{error, info, warn};
use std::time::Instant;

/// Snapshot plus the recoverable findings gathered while building it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Extraction {
    pub snapshot: Snapshot,
    pub diagnostics: ReadDiagnostics,
}

/// Reads every configured section of a workbook into one snapshot.
pub struct RowExtractor<'a> {
    handle: &'a SourceHandle,
    headers: &'a HeaderMap,
}

impl<'a> RowExtractor<'a> {
    pub fn new(handle: &'a SourceHandle, headers: &'a HeaderMap) -> Self {
        Self { handle, headers }
    }

    /// Builds the source snapshot.
    ///
    /// # Errors
    /// - Workbook directory unreadable.
    /// - A required section missing, unparseable, or without a key column.
    pub fn extract(&self) -> Result<Extraction, SourceError> {
        let started_at = Instant::now();
        info!(
            "event=source_extract module=source status=start workbook={} sections={}",
            self.handle.workbook.display(),
            self.handle.sections.len()
        );

        if let Err(err) = self.handle.check_workbook() {
            error!(
                "event=source_extract module=source status=error error_code=workbook_unreadable error={}",
                err
            );
            return Err(err);
        }

        let mut extraction = Extraction::default();
        for section in &self.handle.sections {
            match load_section(self.handle, section, self.headers) {
                Ok((sheet, layout)) => collect_rows(&sheet, &layout, &mut extraction),
                Err(err) if section.optional => {
                    warn!(
                        "event=source_section module=source status=skip section={} error={}",
                        section.name, err
                    );
                    extraction
                        .diagnostics
                        .sections_skipped
                        .push(section.name.clone());
                }
                Err(err) => {
                    error!(
                        "event=source_extract module=source status=error error_code=section_unreadable section={} error={}",
                        section.name, err
                    );
                    return Err(err);
                }
            }
        }

        info!(
            "event=source_extract module=source status=ok records={} duplicates={} rows_without_key={} malformed={} duration_ms={}",
            extraction.snapshot.len(),
            extraction.diagnostics.duplicate_keys.len(),
            extraction.diagnostics.rows_without_key,
            extraction.diagnostics.malformed_values.len(),
            started_at.elapsed().as_millis()
        );
        Ok(extraction)
    }
}

/// Opens one section and resolves its header layout.
pub(crate) fn load_section(
    handle: &SourceHandle,
    section: &SectionSpec,
    headers: &HeaderMap,
) -> Result<(Sheet, ColumnLayout), SourceError> {
    let sheet = Sheet::open(handle, &section.name)?;
    let layout = ColumnLayout::detect(&sheet, section.header_row, headers)?;
    Ok((sheet, layout))
}

fn collect_rows(sheet: &Sheet, layout: &ColumnLayout, extraction: &mut Extraction) {
    for index in layout.data_rows(sheet) {
        let row = &sheet.rows()[index];
        if is_blank_row(row) {
            continue;
        }

        let Some(record) = read_row(layout, row, sheet.section(), &mut extraction.diagnostics)
        else {
            extraction.diagnostics.rows_without_key += 1;
            continue;
        };

        if let Err(duplicate) = extraction.snapshot.insert_first(record) {
            warn!(
                "event=source_duplicate module=source status=skip section={} row={} key={}",
                sheet.section(),
                index + 1,
                duplicate.primary_key
            );
            extraction
                .diagnostics
                .duplicate_keys
                .push(duplicate.primary_key);
        }
    }
}

/// Converts one data row into a record; `None` when the key cell is blank.
pub(crate) fn read_row(
    layout: &ColumnLayout,
    row: &[String],
    section: &str,
    diagnostics: &mut ReadDiagnostics,
) -> Option<Record> {
    let key = layout.key_of(row)?;
    let mut record = Record::new(key)
        .with_origin_sheet(section)
        .with_carried(layout.fields.keys().copied());

    for (&field, &index) in &layout.fields {
        let raw = row.get(index).map(String::as_str).unwrap_or("");
        match field.parse_value(raw) {
            Ok(Some(value)) => {
                record.fields.insert(field, value);
            }
            Ok(None) => {}
            Err(malformed) => {
                warn!(
                    "event=source_value module=source status=skip section={} key={} column={}",
                    section, key, field
                );
                diagnostics
                    .malformed_values
                    .push(MalformedCell::from_value(key, malformed));
            }
        }
    }

    if let Some(index) = layout.modified_at {
        let raw = row.get(index).map(String::as_str).unwrap_or("");
        record.modified_at = parse_timestamp(raw);
        if record.modified_at.is_none() && !raw.trim().is_empty() {
            diagnostics.malformed_values.push(MalformedCell {
                key: key.to_string(),
                column: Column::ModifiedAt.as_str().to_string(),
                raw: raw.trim().to_string(),
            });
        }
    }

    Some(record)
}
