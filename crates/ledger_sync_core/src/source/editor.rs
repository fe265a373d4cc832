//! In-place workbook mutation used by the in-place source strategy.
//!
//! # Responsibility
//! - Locate rows by primary key and overwrite their mapped cells.
//! - Append rows for inserts and physically remove rows for deletions.
//!
//! # Invariants
//! - Unmapped columns, rows outside the data range and rows of other keys are
//!   never modified.
//! - Only sections that changed are rewritten, each through an atomic rename.

use super::extractor::load_section;
use super::{ColumnLayout, Sheet, SourceError, SourceHandle};
use crate::model::header::HeaderMap;
use crate::model::record::Record;
use log::{info, warn};

struct EditableSection {
    sheet: Sheet,
    layout: ColumnLayout,
    dirty: bool,
}

impl EditableSection {
    fn find_row(&self, key: &str) -> Option<usize> {
        self.layout
            .data_rows(&self.sheet)
            .find(|&index| self.layout.key_of(&self.sheet.rows()[index]) == Some(key))
    }
}

/// Loaded workbook sections open for editing.
pub struct WorkbookEditor {
    sections: Vec<EditableSection>,
    /// Optional sections that failed to load.
    skipped: Vec<String>,
}

impl WorkbookEditor {
    /// Loads every readable section.
    ///
    /// # Errors
    /// - Same fatal conditions as extraction: unreadable workbook or required
    ///   section. Unreadable optional sections are left out.
    pub fn open(handle: &SourceHandle, headers: &HeaderMap) -> Result<Self, SourceError> {
        handle.check_workbook()?;
        let mut sections = Vec::new();
        let mut skipped = Vec::new();
        for section in &handle.sections {
            match load_section(handle, section, headers) {
                Ok((sheet, layout)) => sections.push(EditableSection {
                    sheet,
                    layout,
                    dirty: false,
                }),
                Err(err) if section.optional => {
                    warn!(
                        "event=source_edit module=source status=skip section={} error={}",
                        section.name, err
                    );
                    skipped.push(section.name.clone());
                }
                Err(err) => return Err(err),
            }
        }
        Ok(Self { sections, skipped })
    }

    pub fn contains(&self, key: &str) -> bool {
        self.sections
            .iter()
            .any(|section| section.find_row(key).is_some())
    }

    /// Overwrites the mapped cells of the row holding `record.primary_key`.
    ///
    /// The record's `origin_sheet` is searched first. Returns `false` when no
    /// section holds the key.
    pub fn update(&mut self, record: &Record) -> bool {
        let Some((section_index, row_index)) = self.locate(record) else {
            return false;
        };
        let section = &mut self.sections[section_index];
        write_cells(&section.layout, &mut section.sheet.rows_mut()[row_index], record);
        section.dirty = true;
        true
    }

    /// Appends a row after the last data row of the target section.
    ///
    /// Targets `origin_sheet` when loaded, otherwise the first section.
    /// Returns `false` when no section is available or when `origin_sheet`
    /// names a section that failed to load.
    pub fn insert(&mut self, record: &Record) -> bool {
        if let Some(origin) = record.origin_sheet.as_deref() {
            if self.skipped.iter().any(|name| name == origin) {
                return false;
            }
        }
        let target = record
            .origin_sheet
            .as_deref()
            .and_then(|name| {
                self.sections
                    .iter()
                    .position(|section| section.sheet.section() == name)
            })
            .or_else(|| (!self.sections.is_empty()).then_some(0));
        let Some(target) = target else {
            return false;
        };

        let section = &mut self.sections[target];
        let at = section.layout.data_rows(&section.sheet).end;
        let mut row = vec![String::new(); section.layout.required_width()];
        write_cells(&section.layout, &mut row, record);
        section.sheet.rows_mut().insert(at, row);
        section.dirty = true;
        true
    }

    /// Removes every data row holding `key`; returns how many were removed.
    pub fn remove(&mut self, key: &str) -> usize {
        let mut removed = 0;
        for section in &mut self.sections {
            let range = section.layout.data_rows(&section.sheet);
            let layout = &section.layout;
            let mut index = 0;
            let before = section.sheet.rows().len();
            section.sheet.rows_mut().retain(|row| {
                let drop_row = range.contains(&index) && layout.key_of(row) == Some(key);
                index += 1;
                !drop_row
            });
            let count = before - section.sheet.rows().len();
            if count > 0 {
                section.dirty = true;
                removed += count;
            }
        }
        removed
    }

    /// Writes every modified section back to disk.
    ///
    /// Returns the names of the rewritten sections.
    pub fn save(&mut self) -> Result<Vec<String>, SourceError> {
        let mut saved = Vec::new();
        for section in self.sections.iter_mut().filter(|section| section.dirty) {
            section.sheet.save()?;
            section.dirty = false;
            info!(
                "event=source_save module=source status=ok section={}",
                section.sheet.section()
            );
            saved.push(section.sheet.section().to_string());
        }
        Ok(saved)
    }

    fn locate(&self, record: &Record) -> Option<(usize, usize)> {
        let preferred = record.origin_sheet.as_deref();
        let ordered = self
            .sections
            .iter()
            .enumerate()
            .filter(|(_, section)| Some(section.sheet.section()) == preferred)
            .chain(
                self.sections
                    .iter()
                    .enumerate()
                    .filter(|(_, section)| Some(section.sheet.section()) != preferred),
            );

        for (section_index, section) in ordered {
            if let Some(row_index) = section.find_row(&record.primary_key) {
                return Some((section_index, row_index));
            }
        }
        None
    }
}

fn write_cells(layout: &ColumnLayout, row: &mut Vec<String>, record: &Record) {
    let width = layout.required_width();
    if row.len() < width {
        row.resize(width, String::new());
    }

    row[layout.key] = record.primary_key.clone();
    for (&field, &index) in &layout.fields {
        row[index] = record.rendered(field).unwrap_or_default();
    }
    if let Some(index) = layout.modified_at {
        row[index] = record
            .modified_at
            .map(|value| value.to_storage_string())
            .unwrap_or_default();
    }
}
