//! Raw cell grid of one workbook section.

use super::{SourceError, SourceHandle};
use csv::{ReaderBuilder, StringRecord, WriterBuilder};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

const TEMP_SUFFIX: &str = "csv.tmp";

/// Every row of a section exactly as stored, ragged rows included.
///
/// Empty physical lines are kept as zero-cell rows, so row numbers match
/// line numbers until a quoted cell spans several lines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sheet {
    section: String,
    path: PathBuf,
    rows: Vec<Vec<String>>,
}

impl Sheet {
    /// Reads one section of the workbook.
    ///
    /// # Errors
    /// - `SourceError::SectionMissing` when the section file does not exist.
    /// - `SourceError::Csv` when the file cannot be opened or parsed.
    pub fn open(handle: &SourceHandle, section: &str) -> Result<Self, SourceError> {
        let path = handle.section_path(section);
        match std::fs::metadata(&path) {
            Ok(metadata) if metadata.is_file() => {}
            Ok(_) => {
                return Err(SourceError::SectionMissing {
                    section: section.to_string(),
                    path,
                });
            }
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(SourceError::SectionMissing {
                    section: section.to_string(),
                    path,
                });
            }
            Err(source) => return Err(SourceError::io(&path, source)),
        }

        let csv_error = |source| SourceError::Csv {
            section: section.to_string(),
            source,
        };
        let bytes = std::fs::read(&path).map_err(|source| SourceError::io(&path, source))?;
        let mut reader = ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .from_reader(bytes.as_slice());

        // The reader swallows empty lines; recover them from the bytes each
        // read consumed.
        let mut rows = Vec::new();
        let mut record = StringRecord::new();
        let mut consumed = 0;
        let mut at_line_start = true;
        while reader.read_record(&mut record).map_err(csv_error)? {
            let end = usize::try_from(reader.position().byte()).unwrap_or(bytes.len());
            let chunk = bytes.get(consumed..end).unwrap_or_default();
            push_empty_lines(&mut rows, chunk, at_line_start);
            rows.push(record.iter().map(str::to_string).collect());
            at_line_start = chunk.last() == Some(&b'\n');
            consumed = end;
        }
        push_empty_lines(
            &mut rows,
            bytes.get(consumed..).unwrap_or_default(),
            at_line_start,
        );

        Ok(Self {
            section: section.to_string(),
            path,
            rows,
        })
    }

    pub fn from_rows(
        section: impl Into<String>,
        path: impl Into<PathBuf>,
        rows: Vec<Vec<String>>,
    ) -> Self {
        Self {
            section: section.into(),
            path: path.into(),
            rows,
        }
    }

    pub fn section(&self) -> &str {
        &self.section
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn rows(&self) -> &[Vec<String>] {
        &self.rows
    }

    pub(crate) fn rows_mut(&mut self) -> &mut Vec<Vec<String>> {
        &mut self.rows
    }

    /// Index of the last row holding any non-blank cell.
    pub fn last_non_empty_row(&self) -> Option<usize> {
        self.rows.iter().rposition(|row| !is_blank_row(row))
    }

    /// Rewrites the section through a sibling temp file and a rename.
    pub fn save(&self) -> Result<(), SourceError> {
        let temp_path = self.path.with_extension(TEMP_SUFFIX);
        let csv_error = |source| SourceError::Csv {
            section: self.section.clone(),
            source,
        };

        let mut bytes = Vec::new();
        for row in &self.rows {
            if row.is_empty() {
                bytes.push(b'\n');
            } else {
                bytes.extend(encode_row(row).map_err(csv_error)?);
            }
        }
        std::fs::write(&temp_path, bytes).map_err(|source| SourceError::io(&temp_path, source))?;

        std::fs::rename(&temp_path, &self.path).map_err(|source| {
            let _ = std::fs::remove_file(&temp_path);
            SourceError::io(&self.path, source)
        })
    }
}

/// Pushes one zero-cell row per empty line at the start of `chunk`.
///
/// A chunk read right after a `\r` terminator starts with that record's `\n`.
fn push_empty_lines(rows: &mut Vec<Vec<String>>, chunk: &[u8], at_line_start: bool) {
    let newlines = chunk
        .iter()
        .take_while(|byte| matches!(byte, b'\r' | b'\n'))
        .filter(|byte| **byte == b'\n')
        .count();
    let empty = if at_line_start {
        newlines
    } else {
        newlines.saturating_sub(1)
    };
    rows.extend(std::iter::repeat_with(Vec::new).take(empty));
}

fn encode_row(row: &[String]) -> Result<Vec<u8>, csv::Error> {
    let mut writer = WriterBuilder::new().flexible(true).from_writer(Vec::new());
    writer.write_record(row)?;
    writer
        .into_inner()
        .map_err(|err| csv::Error::from(err.into_error()))
}

pub(crate) fn is_blank_row(row: &[String]) -> bool {
    row.iter().all(|cell| cell.trim().is_empty())
}
