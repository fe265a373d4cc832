//! Post-apply deletion pass.
//!
//! # Responsibility
//! - Re-read both stores after the apply step and compare their key sets.
//! - Propagate source-side deletions to the destination, or report them.
//! - Report source rows the destination no longer holds.
//!
//! # Invariants
//! - Runs only after the destination batch committed.
//! - Deletion propagation is its own transaction, separate from the apply
//!   batch.
//! - Keys whose source write was deferred this run are never deleted from the
//!   destination.
//! - Records whose `origin_sheet` names a section skipped by the re-read are
//!   neither deleted nor reported.

use crate::apply::{PendingAction, PendingChanges};
use crate::config::DeletionPolicy;
use crate::model::header::HeaderMap;
use crate::reconcile::from_section;
use crate::source::{RowExtractor, SourceError, SourceHandle};
use crate::store::{DestinationBatch, RowStore, StoreError};
use log::{info, warn};
use serde::Serialize;
use std::collections::BTreeSet;
use std::error::Error;
use std::fmt::{Display, Formatter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictKind {
    /// In the destination, gone from the source; left in place by policy.
    DeletedFromSource,
    /// In the source, gone from the destination; needs manual removal.
    MissingFromDestination,
    /// Destination-only key kept because its source write was deferred.
    SourceWriteDeferred,
}

impl ConflictKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::DeletedFromSource => "deleted_from_source",
            Self::MissingFromDestination => "missing_from_destination",
            Self::SourceWriteDeferred => "source_write_deferred",
        }
    }
}

/// Operator-facing finding of the deletion pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Conflict {
    pub key: String,
    pub kind: ConflictKind,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeletionReport {
    pub deleted_from_destination: Vec<String>,
    pub conflicts: Vec<Conflict>,
}

#[derive(Debug)]
pub enum ConflictError {
    Source(SourceError),
    Destination(StoreError),
}

impl Display for ConflictError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Source(err) => write!(f, "deletion pass could not re-read source: {err}"),
            Self::Destination(err) => write!(f, "deletion pass failed on destination: {err}"),
        }
    }
}

impl Error for ConflictError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Source(err) => Some(err),
            Self::Destination(err) => Some(err),
        }
    }
}

impl From<SourceError> for ConflictError {
    fn from(value: SourceError) -> Self {
        Self::Source(value)
    }
}

impl From<StoreError> for ConflictError {
    fn from(value: StoreError) -> Self {
        Self::Destination(value)
    }
}

/// Second pass over both stores once the apply step is done.
pub struct ConflictReporter<'a, S: RowStore> {
    handle: &'a SourceHandle,
    headers: &'a HeaderMap,
    store: &'a S,
    policy: DeletionPolicy,
}

impl<'a, S: RowStore> ConflictReporter<'a, S> {
    pub fn new(
        handle: &'a SourceHandle,
        headers: &'a HeaderMap,
        store: &'a S,
        policy: DeletionPolicy,
    ) -> Self {
        Self {
            handle,
            headers,
            store,
            policy,
        }
    }

    /// Runs the deletion pass.
    ///
    /// `inserted_this_run` holds keys written to the destination by the apply
    /// step; `deferred` holds keys whose source write was not carried out.
    ///
    /// # Errors
    /// - Either store cannot be re-read, or the propagation batch rolls back.
    pub fn detect(
        &self,
        inserted_this_run: &BTreeSet<String>,
        deferred: &BTreeSet<String>,
        pending: &mut PendingChanges,
    ) -> Result<DeletionReport, ConflictError> {
        let extraction = RowExtractor::new(self.handle, self.headers).extract()?;
        let skipped = extraction.diagnostics.sections_skipped;
        let source = extraction.snapshot;
        let destination = self.store.read_snapshot()?.snapshot;

        let mut report = DeletionReport::default();
        let mut candidates = Vec::new();
        for record in destination.records() {
            let key = record.primary_key.as_str();
            if source.contains_key(key) {
                continue;
            }
            if from_section(record, &skipped) {
                info!(
                    "event=deletion_pass module=conflict status=skip key={} reason=section_skipped",
                    key
                );
                continue;
            }
            if deferred.contains(key) {
                report.conflicts.push(Conflict {
                    key: key.to_string(),
                    kind: ConflictKind::SourceWriteDeferred,
                });
                continue;
            }
            match self.policy {
                DeletionPolicy::Propagate => candidates.push(key.to_string()),
                DeletionPolicy::Report => report.conflicts.push(Conflict {
                    key: key.to_string(),
                    kind: ConflictKind::DeletedFromSource,
                }),
            }
        }

        for record in source.records() {
            let key = record.primary_key.as_str();
            if destination.contains_key(key) || inserted_this_run.contains(key) {
                continue;
            }
            report.conflicts.push(Conflict {
                key: key.to_string(),
                kind: ConflictKind::MissingFromDestination,
            });
            pending.push(PendingAction::RemoveFromSource, record.clone());
        }

        if !candidates.is_empty() {
            let outcome = self.store.apply_batch(&DestinationBatch {
                deletes: &candidates,
                ..DestinationBatch::default()
            })?;
            if outcome.deleted != candidates.len() {
                warn!(
                    "event=deletion_pass module=conflict status=partial expected={} deleted={}",
                    candidates.len(),
                    outcome.deleted
                );
            }
            report.deleted_from_destination = candidates;
        }

        info!(
            "event=deletion_pass module=conflict status=ok policy={} deleted={} conflicts={}",
            self.policy.as_str(),
            report.deleted_from_destination.len(),
            report.conflicts.len()
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::{ConflictKind, ConflictReporter};
    use crate::apply::{PendingAction, PendingChanges};
    use crate::config::DeletionPolicy;
    use crate::db::open_db_in_memory;
    use crate::db::schema::ensure_activity_table;
    use crate::model::header::HeaderMap;
    use crate::model::record::Record;
    use crate::source::{SectionSpec, SourceHandle};
    use crate::store::{DestinationBatch, RowStore, SqliteRowStore};
    use std::collections::BTreeSet;

    fn fixture(dir: &std::path::Path) -> SourceHandle {
        std::fs::write(dir.join("Activities.csv"), "ID,Notes\nK1,a\nK2,b\n").unwrap();
        SourceHandle::new(dir, vec![SectionSpec::required("Activities", 1)])
    }

    #[test]
    fn propagates_destination_only_keys_and_reports_source_only_keys() {
        let dir = tempfile::tempdir().unwrap();
        let handle = fixture(dir.path());
        let headers = HeaderMap::default();
        let conn = open_db_in_memory().unwrap();
        ensure_activity_table(&conn, "activities").unwrap();
        let store = SqliteRowStore::new(&conn, "activities").unwrap();
        store
            .apply_batch(&DestinationBatch {
                inserts: &[Record::new("K1"), Record::new("K3"), Record::new("K4")],
                ..DestinationBatch::default()
            })
            .unwrap();

        let mut pending = PendingChanges::new();
        let deferred = BTreeSet::from(["K4".to_string()]);
        let report = ConflictReporter::new(&handle, &headers, &store, DeletionPolicy::Propagate)
            .detect(&BTreeSet::new(), &deferred, &mut pending)
            .unwrap();

        assert_eq!(report.deleted_from_destination, vec!["K3".to_string()]);
        let kinds: Vec<(&str, ConflictKind)> = report
            .conflicts
            .iter()
            .map(|conflict| (conflict.key.as_str(), conflict.kind))
            .collect();
        assert_eq!(
            kinds,
            vec![
                ("K4", ConflictKind::SourceWriteDeferred),
                ("K2", ConflictKind::MissingFromDestination),
            ]
        );
        assert!(pending.contains(PendingAction::RemoveFromSource, "K2"));

        let keys: Vec<String> = store
            .read_snapshot()
            .unwrap()
            .snapshot
            .keys()
            .map(str::to_string)
            .collect();
        assert_eq!(keys, vec!["K1", "K4"]);
    }

    #[test]
    fn report_policy_leaves_destination_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let handle = fixture(dir.path());
        let headers = HeaderMap::default();
        let conn = open_db_in_memory().unwrap();
        ensure_activity_table(&conn, "activities").unwrap();
        let store = SqliteRowStore::new(&conn, "activities").unwrap();
        store
            .apply_batch(&DestinationBatch {
                inserts: &[Record::new("K3")],
                ..DestinationBatch::default()
            })
            .unwrap();

        let inserted = BTreeSet::from(["K1".to_string(), "K2".to_string()]);
        let mut pending = PendingChanges::new();
        let report = ConflictReporter::new(&handle, &headers, &store, DeletionPolicy::Report)
            .detect(&inserted, &BTreeSet::new(), &mut pending)
            .unwrap();

        assert!(report.deleted_from_destination.is_empty());
        assert_eq!(report.conflicts.len(), 1);
        assert_eq!(report.conflicts[0].kind, ConflictKind::DeletedFromSource);
        assert!(pending.is_empty());
        assert_eq!(store.read_snapshot().unwrap().snapshot.len(), 1);
    }

    #[test]
    fn rows_of_a_skipped_section_survive_propagation() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("Activities.csv"), "ID,Notes\nK1,a\n").unwrap();
        let handle = SourceHandle::new(
            dir.path(),
            vec![
                SectionSpec::required("Activities", 1),
                SectionSpec::optional("Archive", 1),
            ],
        );
        let headers = HeaderMap::default();
        let conn = open_db_in_memory().unwrap();
        ensure_activity_table(&conn, "activities").unwrap();
        let store = SqliteRowStore::new(&conn, "activities").unwrap();
        store
            .apply_batch(&DestinationBatch {
                inserts: &[
                    Record::new("K1").with_origin_sheet("Activities"),
                    Record::new("A1").with_origin_sheet("Archive"),
                ],
                ..DestinationBatch::default()
            })
            .unwrap();

        let mut pending = PendingChanges::new();
        let report = ConflictReporter::new(&handle, &headers, &store, DeletionPolicy::Propagate)
            .detect(&BTreeSet::new(), &BTreeSet::new(), &mut pending)
            .unwrap();

        assert!(report.deleted_from_destination.is_empty());
        assert!(report.conflicts.is_empty());
        assert!(store.read_snapshot().unwrap().snapshot.contains_key("A1"));
    }
}
