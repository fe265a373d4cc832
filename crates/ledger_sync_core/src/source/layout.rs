//! Column positions resolved from a section header row.

use super::sheet::is_blank_row;
use super::{Sheet, SourceError};
use crate::model::field::FieldId;
use crate::model::header::{Column, HeaderMap};
use log::warn;
use std::collections::BTreeMap;
use std::ops::Range;

/// Where each canonical column lives in one section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnLayout {
    /// 0-based index of the header row within the sheet.
    pub header_index: usize,
    pub key: usize,
    pub modified_at: Option<usize>,
    pub fields: BTreeMap<FieldId, usize>,
    /// Header width; new rows are padded to it.
    pub width: usize,
}

impl ColumnLayout {
    /// Resolves the header row of `sheet`.
    ///
    /// The first column matching a canonical target wins; later matches are
    /// ignored with a warning. Unmapped headers are ignored.
    ///
    /// # Errors
    /// - `HeaderRowOutOfRange` when the sheet has fewer rows than `header_row`.
    /// - `MissingKeyColumn` when no header maps to the primary key.
    pub fn detect(
        sheet: &Sheet,
        header_row: usize,
        headers: &HeaderMap,
    ) -> Result<Self, SourceError> {
        let header_index = header_row.saturating_sub(1);
        let Some(cells) = sheet.rows().get(header_index) else {
            return Err(SourceError::HeaderRowOutOfRange {
                section: sheet.section().to_string(),
                header_row,
                rows: sheet.rows().len(),
            });
        };

        let mut key = None;
        let mut modified_at = None;
        let mut fields = BTreeMap::new();
        for (index, text) in cells.iter().enumerate() {
            let Some(column) = headers.resolve(text) else {
                continue;
            };
            let taken = match column {
                Column::Key => key.is_some(),
                Column::ModifiedAt => modified_at.is_some(),
                Column::Field(field) => fields.contains_key(&field),
            };
            if taken {
                warn!(
                    "event=header_duplicate module=source status=skip section={} column={} header_index={}",
                    sheet.section(),
                    column,
                    index
                );
                continue;
            }
            match column {
                Column::Key => key = Some(index),
                Column::ModifiedAt => modified_at = Some(index),
                Column::Field(field) => {
                    fields.insert(field, index);
                }
            }
        }

        let Some(key) = key else {
            return Err(SourceError::MissingKeyColumn {
                section: sheet.section().to_string(),
            });
        };

        Ok(Self {
            header_index,
            key,
            modified_at,
            fields,
            width: cells.len(),
        })
    }

    /// Data rows: after the header through the last non-empty row.
    pub fn data_rows(&self, sheet: &Sheet) -> Range<usize> {
        let start = self.header_index + 1;
        match sheet.last_non_empty_row() {
            Some(last) if last >= start => start..last + 1,
            _ => start..start,
        }
    }

    /// Trimmed primary key of a row, if present.
    pub fn key_of<'r>(&self, row: &'r [String]) -> Option<&'r str> {
        if is_blank_row(row) {
            return None;
        }
        row.get(self.key)
            .map(|cell| cell.trim())
            .filter(|key| !key.is_empty())
    }

    /// Highest column index any canonical column occupies, plus one.
    pub fn required_width(&self) -> usize {
        let highest = self
            .fields
            .values()
            .copied()
            .chain(self.modified_at)
            .chain(std::iter::once(self.key))
            .max()
            .unwrap_or(0);
        self.width.max(highest + 1)
    }
}
