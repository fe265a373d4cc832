//! Change-set execution against both stores.
//!
//! # Responsibility
//! - Commit destination actions as one transactional batch.
//! - Hand source actions to the configured `SourceWriter` once the
//!   destination batch has committed.
//!
//! # Invariants
//! - No source write happens unless the destination batch committed.
//! - Source-side failures after commit never undo the destination batch;
//!   affected rows are reported as unapplied.

use crate::config::StrategyKind;
use crate::model::header::HeaderMap;
use crate::reconcile::ChangeSet;
use crate::source::SourceHandle;
use crate::store::{BatchOutcome, DestinationBatch, RowStore, StoreError};
use serde::Serialize;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::path::{Path, PathBuf};

mod export;
mod in_place;
mod pending;

pub use export::ExportWriter;
pub use in_place::InPlaceWriter;
pub use pending::{PendingAction, PendingChanges, PendingEntry};

#[derive(Debug)]
pub enum ApplyError {
    /// The destination batch was rolled back or could not start.
    Destination(StoreError),
    Artifact {
        path: PathBuf,
        source: csv::Error,
    },
}

impl ApplyError {
    pub(crate) fn artifact_io(path: &Path, source: std::io::Error) -> Self {
        Self::Artifact {
            path: path.to_path_buf(),
            source: csv::Error::from(source),
        }
    }
}

impl Display for ApplyError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Destination(err) => write!(f, "{err}"),
            Self::Artifact { path, source } => write!(
                f,
                "failed to write pending changes `{}`: {source}",
                path.display()
            ),
        }
    }
}

impl Error for ApplyError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Destination(err) => Some(err),
            Self::Artifact { source, .. } => Some(source),
        }
    }
}

impl From<StoreError> for ApplyError {
    fn from(value: StoreError) -> Self {
        Self::Destination(value)
    }
}

/// A row that was classified but could not be carried out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnappliedRow {
    pub key: String,
    pub action: String,
    pub reason: String,
}

/// What a source writer did with the source-side actions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SourceOutcome {
    pub inserted: usize,
    pub updated: usize,
    pub removed: usize,
    pub exported: usize,
    pub unapplied: Vec<UnappliedRow>,
}

/// Carries out `InsertIntoSource`, `UpdateInSource` and
/// `DeleteFromSourceNeeded`.
pub trait SourceWriter {
    fn strategy(&self) -> StrategyKind;

    /// Runs after the destination batch committed.
    fn write(&mut self, changes: &ChangeSet, pending: &mut PendingChanges) -> SourceOutcome;
}

/// Picks the writer for `strategy`.
pub fn source_writer<'a>(
    strategy: StrategyKind,
    handle: &'a SourceHandle,
    headers: &'a HeaderMap,
) -> Box<dyn SourceWriter + 'a> {
    match strategy {
        StrategyKind::Export => Box::new(ExportWriter),
        StrategyKind::InPlace => Box::new(InPlaceWriter::new(handle, headers)),
    }
}

/// Result of one apply step.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ApplyOutcome {
    pub destination: BatchOutcome,
    pub source: SourceOutcome,
}

/// Executes a change set: destination first, then the source writer.
pub struct Applier<'a, S: RowStore> {
    store: &'a S,
    writer: Box<dyn SourceWriter + 'a>,
}

impl<'a, S: RowStore> Applier<'a, S> {
    pub fn new(store: &'a S, writer: Box<dyn SourceWriter + 'a>) -> Self {
        Self { store, writer }
    }

    pub fn strategy(&self) -> StrategyKind {
        self.writer.strategy()
    }

    /// Applies `changes`.
    ///
    /// # Errors
    /// - `ApplyError::Destination` when the destination batch fails; nothing
    ///   was written to either store.
    pub fn apply(
        &mut self,
        changes: &ChangeSet,
        pending: &mut PendingChanges,
    ) -> Result<ApplyOutcome, ApplyError> {
        let batch = DestinationBatch {
            inserts: &changes.insert_into_destination,
            updates: &changes.update_in_destination,
            deletes: &changes.delete_from_destination,
        };
        let destination = if batch.is_empty() {
            BatchOutcome::default()
        } else {
            self.store.apply_batch(&batch)?
        };

        let source = self.writer.write(changes, pending);
        Ok(ApplyOutcome {
            destination,
            source,
        })
    }
}
