//! Snapshot comparison and conflict resolution.
//!
//! # Responsibility
//! - Classify every key of the source/destination union into exactly one
//!   action (or no action).
//!
//! # Invariants
//! - Resolution is a pure function of the two records, the strategy and the
//!   injected run clock.
//! - Timestamps are compared with `Timestamp::cmp_seconds` only.
//! - "Both timestamped" is decided before the asymmetric cases.
//! - A key lands in at most one action list.
//! - Destination-only records from a section that could not be read are left
//!   alone; their absence from the source says nothing.

use crate::config::StrategyKind;
use crate::model::record::{Record, Snapshot};
use crate::model::timestamp::Timestamp;
use log::info;
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::BTreeSet;

/// Actions computed for one run.
///
/// `delete_from_source_needed` is reported, never applied automatically.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSet {
    pub insert_into_destination: Vec<Record>,
    pub update_in_destination: Vec<Record>,
    pub insert_into_source: Vec<Record>,
    pub update_in_source: Vec<Record>,
    pub delete_from_destination: Vec<String>,
    pub delete_from_source_needed: Vec<Record>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.counts() == ChangeCounts::default()
    }

    pub fn counts(&self) -> ChangeCounts {
        ChangeCounts {
            insert_into_destination: self.insert_into_destination.len(),
            update_in_destination: self.update_in_destination.len(),
            insert_into_source: self.insert_into_source.len(),
            update_in_source: self.update_in_source.len(),
            delete_from_destination: self.delete_from_destination.len(),
            delete_from_source_needed: self.delete_from_source_needed.len(),
        }
    }

    /// Whether any destination statement would be issued.
    pub fn touches_destination(&self) -> bool {
        !(self.insert_into_destination.is_empty()
            && self.update_in_destination.is_empty()
            && self.delete_from_destination.is_empty())
    }

    fn push(&mut self, resolution: Resolution) {
        match resolution {
            Resolution::InsertIntoDestination(record) => self.insert_into_destination.push(record),
            Resolution::UpdateInDestination(record) => self.update_in_destination.push(record),
            Resolution::InsertIntoSource(record) => self.insert_into_source.push(record),
            Resolution::UpdateInSource(record) => self.update_in_source.push(record),
            Resolution::DeleteFromSourceNeeded(record) => {
                self.delete_from_source_needed.push(record)
            }
            Resolution::NoOp => {}
        }
    }
}

/// Per-list sizes of a change set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ChangeCounts {
    pub insert_into_destination: usize,
    pub update_in_destination: usize,
    pub insert_into_source: usize,
    pub update_in_source: usize,
    pub delete_from_destination: usize,
    pub delete_from_source_needed: usize,
}

/// Outcome for one key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    InsertIntoDestination(Record),
    UpdateInDestination(Record),
    InsertIntoSource(Record),
    UpdateInSource(Record),
    DeleteFromSourceNeeded(Record),
    NoOp,
}

/// Resolves one key.
///
/// `now` stamps records that enter the destination without a usable
/// timestamp. Winning destination records keep the source row's
/// `origin_sheet` so in-place writes find the right section.
pub fn resolve(
    source: Option<&Record>,
    destination: Option<&Record>,
    strategy: StrategyKind,
    now: Timestamp,
) -> Resolution {
    match (source, destination) {
        (None, None) => Resolution::NoOp,
        (Some(source), None) => {
            let mut record = source.clone();
            if record.modified_at.is_none() {
                record.modified_at = Some(now);
            }
            Resolution::InsertIntoDestination(record)
        }
        (None, Some(destination)) => match strategy {
            StrategyKind::Export => Resolution::DeleteFromSourceNeeded(destination.clone()),
            StrategyKind::InPlace => Resolution::InsertIntoSource(destination.clone()),
        },
        (Some(source), Some(destination)) => match (source.modified_at, destination.modified_at) {
            (Some(source_at), Some(destination_at)) => match destination_at.cmp_seconds(&source_at) {
                Ordering::Greater => Resolution::UpdateInSource(keep_origin(destination, source)),
                Ordering::Less => Resolution::UpdateInDestination(source.filled_from(destination)),
                Ordering::Equal => Resolution::NoOp,
            },
            (None, Some(_)) if !source.same_values(destination) => {
                Resolution::UpdateInSource(keep_origin(destination, source))
            }
            (Some(_), None) if !source.same_values(destination) => {
                let mut record = source.filled_from(destination);
                record.modified_at = Some(now);
                Resolution::UpdateInDestination(record)
            }
            _ => Resolution::NoOp,
        },
    }
}

/// Computes the change set over the sorted key union of both snapshots.
pub fn reconcile(
    source: &Snapshot,
    destination: &Snapshot,
    strategy: StrategyKind,
    now: Timestamp,
) -> ChangeSet {
    reconcile_with_skipped_sections(source, destination, strategy, now, &[])
}

/// `reconcile` for a source read that skipped `skipped_sections`.
///
/// Destination-only records whose `origin_sheet` names a skipped section
/// resolve to no action.
pub fn reconcile_with_skipped_sections(
    source: &Snapshot,
    destination: &Snapshot,
    strategy: StrategyKind,
    now: Timestamp,
    skipped_sections: &[String],
) -> ChangeSet {
    let keys: BTreeSet<&str> = source.keys().chain(destination.keys()).collect();
    let mut changes = ChangeSet::default();
    let mut held_back = 0;
    for key in keys {
        let source_record = source.get(key);
        let destination_record = destination.get(key);
        if source_record.is_none()
            && destination_record.is_some_and(|record| from_section(record, skipped_sections))
        {
            held_back += 1;
            continue;
        }
        changes.push(resolve(source_record, destination_record, strategy, now));
    }
    if held_back > 0 {
        info!(
            "event=reconcile module=reconcile status=skip reason=section_skipped records={}",
            held_back
        );
    }
    changes
}

/// Whether `record` was last seen in one of `sections`.
pub(crate) fn from_section(record: &Record, sections: &[String]) -> bool {
    record
        .origin_sheet
        .as_deref()
        .is_some_and(|sheet| sections.iter().any(|section| section == sheet))
}

fn keep_origin(winner: &Record, source: &Record) -> Record {
    let mut record = winner.clone();
    if source.origin_sheet.is_some() {
        record.origin_sheet = source.origin_sheet.clone();
    }
    record
}

#[cfg(test)]
mod tests {
    use super::{reconcile, reconcile_with_skipped_sections, resolve, Resolution};
    use crate::config::StrategyKind;
    use crate::model::field::FieldId;
    use crate::model::record::{Record, Snapshot};
    use crate::model::timestamp::{parse_timestamp, Timestamp};

    fn at(raw: &str) -> Timestamp {
        parse_timestamp(raw).unwrap()
    }

    fn now() -> Timestamp {
        at("2024-06-01 12:00:00")
    }

    fn record(key: &str, activity: &str) -> Record {
        Record::new(key).with_text(FieldId::Activity, activity)
    }

    #[test]
    fn source_only_inserts_and_stamps_missing_timestamp() {
        let stamped = record("K1", "x").with_modified_at(at("2024-01-01 08:00:00"));
        assert_eq!(
            resolve(Some(&stamped), None, StrategyKind::Export, now()),
            Resolution::InsertIntoDestination(stamped.clone())
        );

        let Resolution::InsertIntoDestination(inserted) =
            resolve(Some(&record("K1", "x")), None, StrategyKind::Export, now())
        else {
            panic!("expected insert");
        };
        assert_eq!(inserted.modified_at, Some(now()));
    }

    #[test]
    fn destination_only_depends_on_strategy() {
        let dest = record("K3", "y").with_modified_at(at("2024-01-01 08:00:00"));
        assert_eq!(
            resolve(None, Some(&dest), StrategyKind::Export, now()),
            Resolution::DeleteFromSourceNeeded(dest.clone())
        );
        assert_eq!(
            resolve(None, Some(&dest), StrategyKind::InPlace, now()),
            Resolution::InsertIntoSource(dest)
        );
    }

    #[test]
    fn newer_destination_updates_source_and_keeps_source_section() {
        let source = record("K1", "x")
            .with_modified_at(at("2024-01-01 09:00:00"))
            .with_origin_sheet("Week 2");
        let dest = record("K1", "y").with_modified_at(at("2024-01-01 10:00:00"));

        let Resolution::UpdateInSource(update) =
            resolve(Some(&source), Some(&dest), StrategyKind::Export, now())
        else {
            panic!("expected source update");
        };
        assert_eq!(update.rendered(FieldId::Activity).as_deref(), Some("y"));
        assert_eq!(update.modified_at, dest.modified_at);
        assert_eq!(update.origin_sheet.as_deref(), Some("Week 2"));
    }

    #[test]
    fn sub_second_difference_is_not_an_update() {
        let source = record("K1", "x").with_modified_at(at("2024-01-01 09:00:00.900"));
        let dest = record("K1", "y").with_modified_at(at("2024-01-01 09:00:00.100"));
        assert_eq!(
            resolve(Some(&source), Some(&dest), StrategyKind::InPlace, now()),
            Resolution::NoOp
        );
    }

    #[test]
    fn asymmetric_timestamps_fall_back_to_content() {
        let untimed = record("K1", "x");
        let timed_same = record("K1", "x").with_modified_at(at("2024-01-01 09:00:00"));
        let timed_other = record("K1", "z").with_modified_at(at("2024-01-01 09:00:00"));

        assert_eq!(
            resolve(Some(&untimed), Some(&timed_same), StrategyKind::Export, now()),
            Resolution::NoOp
        );
        assert!(matches!(
            resolve(Some(&untimed), Some(&timed_other), StrategyKind::Export, now()),
            Resolution::UpdateInSource(_)
        ));

        let Resolution::UpdateInDestination(update) =
            resolve(Some(&timed_other), Some(&untimed), StrategyKind::Export, now())
        else {
            panic!("expected destination update");
        };
        assert_eq!(update.modified_at, Some(now()));
        assert_eq!(
            resolve(Some(&timed_same), Some(&untimed), StrategyKind::Export, now()),
            Resolution::NoOp
        );
    }

    #[test]
    fn neither_timestamped_is_a_no_op_even_when_values_differ() {
        assert_eq!(
            resolve(
                Some(&record("K1", "x")),
                Some(&record("K1", "y")),
                StrategyKind::InPlace,
                now()
            ),
            Resolution::NoOp
        );
    }

    #[test]
    fn scenario_newer_source_overwrites_destination() {
        let source: Snapshot = [record("K1", "x").with_modified_at(at("2024-01-01 10:00:00"))]
            .into_iter()
            .collect();
        let dest: Snapshot = [record("K1", "y").with_modified_at(at("2024-01-01 09:00:00"))]
            .into_iter()
            .collect();

        let changes = reconcile(&source, &dest, StrategyKind::Export, now());
        assert_eq!(changes.update_in_destination.len(), 1);
        let update = &changes.update_in_destination[0];
        assert_eq!(update.rendered(FieldId::Activity).as_deref(), Some("x"));
        assert_eq!(update.modified_at, Some(at("2024-01-01 10:00:00")));
        assert_eq!(changes.counts().update_in_destination, 1);
    }

    #[test]
    fn scenario_untimestamped_equal_source_writes_nothing() {
        let source: Snapshot = [record("K2", "x")].into_iter().collect();
        let dest: Snapshot = [record("K2", "x").with_modified_at(at("2024-01-01 09:00:00"))]
            .into_iter()
            .collect();
        assert!(reconcile(&source, &dest, StrategyKind::Export, now()).is_empty());
    }

    #[test]
    fn union_is_visited_in_key_order_and_lists_stay_disjoint() {
        let source: Snapshot = [record("B", "1"), record("A", "1")].into_iter().collect();
        let dest: Snapshot = [record("C", "1").with_modified_at(at("2024-01-01 09:00:00"))]
            .into_iter()
            .collect();

        let changes = reconcile(&source, &dest, StrategyKind::Export, now());
        let inserted: Vec<&str> = changes
            .insert_into_destination
            .iter()
            .map(|record| record.primary_key.as_str())
            .collect();
        assert_eq!(inserted, vec!["A", "B"]);
        assert_eq!(changes.delete_from_source_needed.len(), 1);
        assert!(changes.update_in_source.is_empty());
        assert!(changes.delete_from_destination.is_empty());
        assert!(changes.touches_destination());
    }

    #[test]
    fn fields_without_a_source_column_neither_conflict_nor_get_cleared() {
        let sheet_row = record("K1", "x").with_carried([FieldId::Activity]);
        let table_row = record("K1", "x")
            .with_text(FieldId::Client, "Acme")
            .with_modified_at(at("2024-01-01 09:00:00"));
        assert_eq!(
            resolve(Some(&sheet_row), Some(&table_row), StrategyKind::InPlace, now()),
            Resolution::NoOp
        );

        let newer = record("K1", "y")
            .with_carried([FieldId::Activity])
            .with_modified_at(at("2024-01-01 10:00:00"));
        let Resolution::UpdateInDestination(update) =
            resolve(Some(&newer), Some(&table_row), StrategyKind::InPlace, now())
        else {
            panic!("expected destination update");
        };
        assert_eq!(update.rendered(FieldId::Activity).as_deref(), Some("y"));
        assert_eq!(update.rendered(FieldId::Client).as_deref(), Some("Acme"));
    }

    #[test]
    fn destination_rows_of_skipped_sections_are_left_alone() {
        let source: Snapshot = [record("K1", "x").with_origin_sheet("Activities")]
            .into_iter()
            .collect();
        let dest: Snapshot = [
            record("K1", "x").with_origin_sheet("Activities"),
            record("A1", "old").with_origin_sheet("Archive"),
            record("K9", "loose"),
        ]
        .into_iter()
        .collect();

        let skipped = vec!["Archive".to_string()];
        for strategy in [StrategyKind::Export, StrategyKind::InPlace] {
            let changes =
                reconcile_with_skipped_sections(&source, &dest, strategy, now(), &skipped);
            let touched: Vec<&str> = changes
                .insert_into_source
                .iter()
                .chain(&changes.delete_from_source_needed)
                .map(|record| record.primary_key.as_str())
                .collect();
            assert_eq!(touched, vec!["K9"]);
        }
    }
}
