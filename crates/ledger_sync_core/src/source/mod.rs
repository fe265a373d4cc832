//! Spreadsheet-side store: workbook sections on disk.
//!
//! # Responsibility
//! - Describe where the ledger lives (`SourceHandle`).
//! - Read sections into keyed snapshots (`RowExtractor`).
//! - Rewrite sections in place for the in-place strategy (`WorkbookEditor`).
//!
//! # Invariants
//! - A workbook is a directory; each section is `<workbook>/<section>.csv`.
//! - Header rows are 1-based; rows above the header are never interpreted.
//! - Required sections are fatal when unreadable, optional ones are skipped.

use crate::config::SourceConfig;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::path::{Path, PathBuf};

mod editor;
mod extractor;
mod layout;
mod sheet;

pub use editor::WorkbookEditor;
pub use extractor::{Extraction, RowExtractor};
pub use layout::ColumnLayout;
pub use sheet::Sheet;

const SECTION_EXTENSION: &str = "csv";

/// One tabular section of the workbook.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SectionSpec {
    pub name: String,
    /// 1-based header row.
    pub header_row: usize,
    pub optional: bool,
}

impl SectionSpec {
    pub fn required(name: impl Into<String>, header_row: usize) -> Self {
        Self {
            name: name.into(),
            header_row,
            optional: false,
        }
    }

    pub fn optional(name: impl Into<String>, header_row: usize) -> Self {
        Self {
            optional: true,
            ..Self::required(name, header_row)
        }
    }
}

/// Location of the ledger and the sections that feed one logical source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceHandle {
    pub workbook: PathBuf,
    pub sections: Vec<SectionSpec>,
}

impl SourceHandle {
    pub fn new(workbook: impl Into<PathBuf>, sections: Vec<SectionSpec>) -> Self {
        Self {
            workbook: workbook.into(),
            sections,
        }
    }

    pub fn from_config(config: &SourceConfig) -> Self {
        Self {
            workbook: config.workbook.clone(),
            sections: config
                .sections
                .iter()
                .map(|section| SectionSpec {
                    name: section.name.trim().to_string(),
                    header_row: section.header_row,
                    optional: section.optional,
                })
                .collect(),
        }
    }

    pub fn section_path(&self, section: &str) -> PathBuf {
        self.workbook
            .join(format!("{section}.{SECTION_EXTENSION}"))
    }

    /// Fails when the workbook directory itself cannot be read.
    pub(crate) fn check_workbook(&self) -> Result<(), SourceError> {
        let metadata =
            std::fs::metadata(&self.workbook).map_err(|source| SourceError::WorkbookUnreadable {
                path: self.workbook.clone(),
                source,
            })?;
        if !metadata.is_dir() {
            return Err(SourceError::WorkbookUnreadable {
                path: self.workbook.clone(),
                source: std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    "workbook path is not a directory",
                ),
            });
        }
        Ok(())
    }
}

#[derive(Debug)]
pub enum SourceError {
    WorkbookUnreadable {
        path: PathBuf,
        source: std::io::Error,
    },
    SectionMissing {
        section: String,
        path: PathBuf,
    },
    Csv {
        section: String,
        source: csv::Error,
    },
    HeaderRowOutOfRange {
        section: String,
        header_row: usize,
        rows: usize,
    },
    MissingKeyColumn {
        section: String,
    },
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl SourceError {
    /// Section the error is scoped to, if any.
    pub fn section(&self) -> Option<&str> {
        match self {
            Self::SectionMissing { section, .. }
            | Self::Csv { section, .. }
            | Self::HeaderRowOutOfRange { section, .. }
            | Self::MissingKeyColumn { section } => Some(section),
            Self::WorkbookUnreadable { .. } | Self::Io { .. } => None,
        }
    }

    pub(crate) fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

impl Display for SourceError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::WorkbookUnreadable { path, source } => {
                write!(f, "workbook `{}` is unreadable: {source}", path.display())
            }
            Self::SectionMissing { section, path } => {
                write!(f, "section `{section}` not found at `{}`", path.display())
            }
            Self::Csv { section, source } => {
                write!(f, "section `{section}` could not be parsed: {source}")
            }
            Self::HeaderRowOutOfRange {
                section,
                header_row,
                rows,
            } => write!(
                f,
                "section `{section}` header row {header_row} is beyond its {rows} rows"
            ),
            Self::MissingKeyColumn { section } => {
                write!(f, "section `{section}` has no primary key column")
            }
            Self::Io { path, source } => {
                write!(f, "source I/O failure at `{}`: {source}", path.display())
            }
        }
    }
}

impl Error for SourceError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::WorkbookUnreadable { source, .. } | Self::Io { source, .. } => Some(source),
            Self::Csv { source, .. } => Some(source),
            Self::SectionMissing { .. }
            | Self::HeaderRowOutOfRange { .. }
            | Self::MissingKeyColumn { .. } => None,
        }
    }
}
