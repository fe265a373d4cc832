//! In-place strategy: rewrite workbook sections directly.

use super::{PendingAction, PendingChanges, SourceOutcome, SourceWriter, UnappliedRow};
use crate::config::StrategyKind;
use crate::model::header::HeaderMap;
use crate::model::record::Record;
use crate::reconcile::ChangeSet;
use crate::source::{SourceHandle, WorkbookEditor};
use log::{error, info, warn};

/// Applies source actions to the workbook. Rows that cannot be written are
/// reported as unapplied and queued in the pending-changes artifact instead.
pub struct InPlaceWriter<'a> {
    handle: &'a SourceHandle,
    headers: &'a HeaderMap,
}

impl<'a> InPlaceWriter<'a> {
    pub fn new(handle: &'a SourceHandle, headers: &'a HeaderMap) -> Self {
        Self { handle, headers }
    }
}

#[derive(Clone, Copy)]
enum Edit {
    Insert,
    Update,
    Remove,
}

impl Edit {
    fn pending_action(self) -> PendingAction {
        match self {
            Self::Insert => PendingAction::AddToSource,
            Self::Update => PendingAction::UpdateInSource,
            Self::Remove => PendingAction::RemoveFromSource,
        }
    }
}

impl SourceWriter for InPlaceWriter<'_> {
    fn strategy(&self) -> StrategyKind {
        StrategyKind::InPlace
    }

    fn write(&mut self, changes: &ChangeSet, pending: &mut PendingChanges) -> SourceOutcome {
        let edits: Vec<(Edit, &Record)> = changes
            .insert_into_source
            .iter()
            .map(|record| (Edit::Insert, record))
            .chain(
                changes
                    .update_in_source
                    .iter()
                    .map(|record| (Edit::Update, record)),
            )
            .chain(
                changes
                    .delete_from_source_needed
                    .iter()
                    .map(|record| (Edit::Remove, record)),
            )
            .collect();

        let mut outcome = SourceOutcome::default();
        if edits.is_empty() {
            return outcome;
        }

        let mut editor = match WorkbookEditor::open(self.handle, self.headers) {
            Ok(editor) => editor,
            Err(err) => {
                error!(
                    "event=source_write module=apply status=error strategy=in_place error_code=workbook_open_failed error={}",
                    err
                );
                let reason = err.to_string();
                for (edit, record) in edits {
                    defer(&mut outcome, pending, edit, record, &reason);
                }
                return outcome;
            }
        };

        let mut applied = Vec::new();
        for (edit, record) in edits {
            let done = match edit {
                Edit::Insert if editor.contains(&record.primary_key) => editor.update(record),
                Edit::Insert => editor.insert(record),
                Edit::Update => editor.update(record),
                Edit::Remove => editor.remove(&record.primary_key) > 0,
            };
            if done {
                applied.push((edit, record));
            } else {
                warn!(
                    "event=source_edit module=apply status=skip key={} action={}",
                    record.primary_key,
                    edit.pending_action().tag()
                );
                defer(
                    &mut outcome,
                    pending,
                    edit,
                    record,
                    "row or section not present in the workbook",
                );
            }
        }

        match editor.save() {
            Ok(sections) => {
                for (edit, _) in &applied {
                    match edit {
                        Edit::Insert => outcome.inserted += 1,
                        Edit::Update => outcome.updated += 1,
                        Edit::Remove => outcome.removed += 1,
                    }
                }
                info!(
                    "event=source_write module=apply status=ok strategy=in_place inserted={} updated={} removed={} sections_saved={}",
                    outcome.inserted,
                    outcome.updated,
                    outcome.removed,
                    sections.len()
                );
            }
            Err(err) => {
                error!(
                    "event=source_write module=apply status=error strategy=in_place error_code=section_save_failed error={}",
                    err
                );
                let reason = err.to_string();
                for (edit, record) in applied {
                    defer(&mut outcome, pending, edit, record, &reason);
                }
            }
        }
        outcome
    }
}

fn defer(
    outcome: &mut SourceOutcome,
    pending: &mut PendingChanges,
    edit: Edit,
    record: &Record,
    reason: &str,
) {
    let action = edit.pending_action();
    outcome.unapplied.push(UnappliedRow {
        key: record.primary_key.clone(),
        action: action.tag().to_string(),
        reason: reason.to_string(),
    });
    if pending.push(action, record.clone()) {
        outcome.exported += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::InPlaceWriter;
    use crate::apply::{PendingAction, PendingChanges, SourceWriter};
    use crate::model::field::FieldId;
    use crate::model::header::HeaderMap;
    use crate::model::record::Record;
    use crate::reconcile::ChangeSet;
    use crate::source::{SectionSpec, SourceHandle};

    #[test]
    fn applies_edits_and_defers_missing_rows() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("Activities.csv"),
            "ID,Task,Notes\nK1,old,keep\nK2,doomed,\n",
        )
        .unwrap();
        let handle = SourceHandle::new(dir.path(), vec![SectionSpec::required("Activities", 1)]);
        let headers = HeaderMap::default();

        let changes = ChangeSet {
            insert_into_source: vec![Record::new("K3").with_text(FieldId::Activity, "new")],
            update_in_source: vec![
                Record::new("K1").with_text(FieldId::Activity, "fresh"),
                Record::new("K404"),
            ],
            delete_from_source_needed: vec![Record::new("K2")],
            ..ChangeSet::default()
        };
        let mut pending = PendingChanges::new();
        let outcome = InPlaceWriter::new(&handle, &headers).write(&changes, &mut pending);

        assert_eq!((outcome.inserted, outcome.updated, outcome.removed), (1, 1, 1));
        assert_eq!(outcome.unapplied.len(), 1);
        assert_eq!(outcome.unapplied[0].key, "K404");
        assert!(pending.contains(PendingAction::UpdateInSource, "K404"));
        assert_eq!(
            std::fs::read_to_string(dir.path().join("Activities.csv")).unwrap(),
            "ID,Task,Notes\nK1,fresh,\nK3,new,\n"
        );
    }

    #[test]
    fn unreadable_workbook_defers_everything() {
        let handle = SourceHandle::new(
            "/nonexistent/ledger",
            vec![SectionSpec::required("Activities", 1)],
        );
        let headers = HeaderMap::default();
        let changes = ChangeSet {
            insert_into_source: vec![Record::new("K3")],
            ..ChangeSet::default()
        };
        let mut pending = PendingChanges::new();
        let outcome = InPlaceWriter::new(&handle, &headers).write(&changes, &mut pending);

        assert_eq!(outcome.inserted, 0);
        assert_eq!(outcome.unapplied.len(), 1);
        assert!(pending.contains(PendingAction::AddToSource, "K3"));
    }
}
