//! Pending-changes artifact: source actions left to an operator.

use super::ApplyError;
use crate::model::field::FieldId;
use crate::model::record::Record;
use csv::WriterBuilder;
use log::info;
use serde::Serialize;
use std::io::ErrorKind;
use std::path::Path;

const TEMP_EXTENSION: &str = "tmp";
const LEADING_COLUMNS: [&str; 4] = ["action", "entry_key", "origin_sheet", "modified_at"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PendingAction {
    AddToSource,
    UpdateInSource,
    RemoveFromSource,
}

impl PendingAction {
    /// Operator-facing tag written to the artifact.
    pub fn tag(self) -> &'static str {
        match self {
            Self::AddToSource => "add to source",
            Self::UpdateInSource => "update in source",
            Self::RemoveFromSource => "remove from source",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingEntry {
    pub action: PendingAction,
    pub record: Record,
}

/// Entries collected during one run, written once at the end.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PendingChanges {
    entries: Vec<PendingEntry>,
}

impl PendingChanges {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an entry unless the same action is already pending for the key.
    pub fn push(&mut self, action: PendingAction, record: Record) -> bool {
        if self.contains(action, &record.primary_key) {
            return false;
        }
        self.entries.push(PendingEntry { action, record });
        true
    }

    pub fn contains(&self, action: PendingAction, key: &str) -> bool {
        self.entries
            .iter()
            .any(|entry| entry.action == action && entry.record.primary_key == key)
    }

    pub fn entries(&self) -> &[PendingEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Rewrites the artifact at `path`, or removes it when nothing is pending.
    ///
    /// Returns whether an artifact now exists.
    pub fn write_to(&self, path: &Path) -> Result<bool, ApplyError> {
        if self.entries.is_empty() {
            return match std::fs::remove_file(path) {
                Ok(()) => {
                    info!(
                        "event=pending_changes module=apply status=ok entries=0 path={} removed=true",
                        path.display()
                    );
                    Ok(false)
                }
                Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
                Err(source) => Err(ApplyError::artifact_io(path, source)),
            };
        }

        let temp_path = path.with_extension(TEMP_EXTENSION);
        let artifact_error = |source| ApplyError::Artifact {
            path: path.to_path_buf(),
            source,
        };
        let mut writer = WriterBuilder::new()
            .from_path(&temp_path)
            .map_err(artifact_error)?;

        let header = LEADING_COLUMNS
            .iter()
            .copied()
            .chain(FieldId::ALL.iter().map(|field| field.as_str()));
        writer.write_record(header).map_err(artifact_error)?;

        let mut ordered: Vec<&PendingEntry> = self.entries.iter().collect();
        ordered.sort_by(|left, right| {
            (left.action, &left.record.primary_key).cmp(&(right.action, &right.record.primary_key))
        });
        for entry in ordered {
            writer
                .write_record(artifact_row(entry))
                .map_err(artifact_error)?;
        }
        writer
            .flush()
            .map_err(|source| ApplyError::artifact_io(&temp_path, source))?;
        drop(writer);

        std::fs::rename(&temp_path, path).map_err(|source| {
            let _ = std::fs::remove_file(&temp_path);
            ApplyError::artifact_io(path, source)
        })?;

        info!(
            "event=pending_changes module=apply status=ok entries={} path={}",
            self.entries.len(),
            path.display()
        );
        Ok(true)
    }
}

fn artifact_row(entry: &PendingEntry) -> Vec<String> {
    let record = &entry.record;
    let mut row = vec![
        entry.action.tag().to_string(),
        record.primary_key.clone(),
        record.origin_sheet.clone().unwrap_or_default(),
        record
            .modified_at
            .map(|value| value.to_storage_string())
            .unwrap_or_default(),
    ];
    row.extend(
        FieldId::ALL
            .iter()
            .map(|&field| record.rendered(field).unwrap_or_default()),
    );
    row
}
