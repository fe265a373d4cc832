//! Export strategy: the source is never mutated.

use super::{PendingAction, PendingChanges, SourceOutcome, SourceWriter};
use crate::config::StrategyKind;
use crate::reconcile::ChangeSet;
use log::info;

/// Queues every source action in the pending-changes artifact.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExportWriter;

impl SourceWriter for ExportWriter {
    fn strategy(&self) -> StrategyKind {
        StrategyKind::Export
    }

    fn write(&mut self, changes: &ChangeSet, pending: &mut PendingChanges) -> SourceOutcome {
        let queued = [
            (PendingAction::AddToSource, &changes.insert_into_source),
            (PendingAction::UpdateInSource, &changes.update_in_source),
            (
                PendingAction::RemoveFromSource,
                &changes.delete_from_source_needed,
            ),
        ];

        let mut outcome = SourceOutcome::default();
        for (action, records) in queued {
            for record in records {
                if pending.push(action, record.clone()) {
                    outcome.exported += 1;
                }
            }
        }

        info!(
            "event=source_write module=apply status=ok strategy=export exported={}",
            outcome.exported
        );
        outcome
    }
}
