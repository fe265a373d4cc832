//! One reconciliation run, from lock acquisition to lock release.
//!
//! # Responsibility
//! - Drive the run state machine:
//!   `Idle → Locked → Extracting → Reconciling → Applying →
//!   DetectingDeletions → Reporting → Unlocked`.
//! - Map failures to `RunError` and successful runs to a `RunSummary`.
//!
//! # Invariants
//! - Nothing is read before the lock is held.
//! - The lock is released on every exit path, panics included.
//! - Pre-flight failures end in `AbortedBeforeMutation` with no write issued.

use crate::apply::{source_writer, Applier, ApplyError, PendingChanges, SourceOutcome};
use crate::config::{ConfigError, DeletionPolicy, StrategyKind, SyncConfig};
use crate::conflict::{Conflict, ConflictError, ConflictReporter};
use crate::db::schema::{ensure_activity_table, table_exists};
use crate::db::{open_db, open_db_in_memory, open_existing_db, DbError};
use crate::lock::{LockError, RunLock};
use crate::model::record::ReadDiagnostics;
use crate::model::timestamp::Timestamp;
use crate::reconcile::{reconcile_with_skipped_sections, ChangeCounts};
use crate::source::{Extraction, RowExtractor, SourceError, SourceHandle};
use crate::store::{BatchOutcome, RowStore, SqliteRowStore, StoreError};
use log::{error, info, warn};
use rusqlite::Connection;
use serde::Serialize;
use std::collections::BTreeSet;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Idle,
    Locked,
    Extracting,
    Reconciling,
    Applying,
    DetectingDeletions,
    Reporting,
    Unlocked,
    AbortedBeforeMutation,
}

impl RunState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Locked => "locked",
            Self::Extracting => "extracting",
            Self::Reconciling => "reconciling",
            Self::Applying => "applying",
            Self::DetectingDeletions => "detecting_deletions",
            Self::Reporting => "reporting",
            Self::Unlocked => "unlocked",
            Self::AbortedBeforeMutation => "aborted_before_mutation",
        }
    }
}

/// Per-invocation overrides.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Overrides `sync.strategy`.
    pub strategy: Option<StrategyKind>,
    /// Read both stores and compute the change set without writing.
    pub dry_run: bool,
    /// Run clock; `Timestamp::now()` when unset.
    pub now: Option<Timestamp>,
}

/// Outcome of a completed run.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub strategy: StrategyKind,
    pub deletion_policy: DeletionPolicy,
    pub dry_run: bool,
    pub states: Vec<RunState>,
    /// Change set computed by the reconciler.
    pub planned: ChangeCounts,
    /// Rows changed by the apply batch.
    pub destination: BatchOutcome,
    pub source: SourceOutcome,
    pub deleted_from_destination: Vec<String>,
    pub conflicts: Vec<Conflict>,
    pub source_diagnostics: ReadDiagnostics,
    pub destination_diagnostics: ReadDiagnostics,
    /// Artifact path when this run left pending changes.
    pub pending_changes: Option<PathBuf>,
    pub duration_ms: u64,
}

impl RunSummary {
    /// Whether an operator needs to look at something.
    pub fn needs_attention(&self) -> bool {
        !self.conflicts.is_empty()
            || !self.source.unapplied.is_empty()
            || self.pending_changes.is_some()
            || !self.source_diagnostics.is_clean()
            || !self.destination_diagnostics.is_clean()
    }
}

#[derive(Debug)]
pub enum RunError {
    Config(ConfigError),
    Lock(LockError),
    Source(SourceError),
    /// Destination could not be opened or read.
    Destination(StoreError),
    Apply(ApplyError),
    DeletionPass(ConflictError),
}

impl RunError {
    /// Process exit status for this failure.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Config(_) => 2,
            Self::Lock(LockError::Held { .. }) => 3,
            Self::Lock(LockError::Io { .. }) => 1,
            Self::Source(_) | Self::DeletionPass(ConflictError::Source(_)) => 4,
            Self::Destination(_) => 5,
            Self::Apply(ApplyError::Destination(_))
            | Self::DeletionPass(ConflictError::Destination(_)) => 6,
            Self::Apply(ApplyError::Artifact { .. }) => 1,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            Self::Config(_) => "config_invalid",
            Self::Lock(LockError::Held { .. }) => "lock_held",
            Self::Lock(LockError::Io { .. }) => "lock_io",
            Self::Source(_) => "source_unreadable",
            Self::Destination(_) => "destination_unreachable",
            Self::Apply(ApplyError::Destination(_)) => "batch_rolled_back",
            Self::Apply(ApplyError::Artifact { .. }) => "artifact_write_failed",
            Self::DeletionPass(_) => "deletion_pass_failed",
        }
    }
}

impl Display for RunError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(err) => write!(f, "{err}"),
            Self::Lock(err) => write!(f, "{err}"),
            Self::Source(err) => write!(f, "{err}"),
            Self::Destination(err) => write!(f, "destination unreachable: {err}"),
            Self::Apply(err) => write!(f, "{err}"),
            Self::DeletionPass(err) => write!(f, "{err}"),
        }
    }
}

impl Error for RunError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Config(err) => Some(err),
            Self::Lock(err) => Some(err),
            Self::Source(err) => Some(err),
            Self::Destination(err) => Some(err),
            Self::Apply(err) => Some(err),
            Self::DeletionPass(err) => Some(err),
        }
    }
}

impl From<ConfigError> for RunError {
    fn from(value: ConfigError) -> Self {
        Self::Config(value)
    }
}

impl From<LockError> for RunError {
    fn from(value: LockError) -> Self {
        Self::Lock(value)
    }
}

impl From<SourceError> for RunError {
    fn from(value: SourceError) -> Self {
        Self::Source(value)
    }
}

impl From<StoreError> for RunError {
    fn from(value: StoreError) -> Self {
        Self::Destination(value)
    }
}

impl From<DbError> for RunError {
    fn from(value: DbError) -> Self {
        Self::Destination(StoreError::Db(value))
    }
}

impl From<ApplyError> for RunError {
    fn from(value: ApplyError) -> Self {
        Self::Apply(value)
    }
}

impl From<ConflictError> for RunError {
    fn from(value: ConflictError) -> Self {
        Self::DeletionPass(value)
    }
}

struct StateTrace {
    run_id: Uuid,
    states: Vec<RunState>,
    mutated: bool,
}

impl StateTrace {
    fn new(run_id: Uuid) -> Self {
        Self {
            run_id,
            states: vec![RunState::Idle],
            mutated: false,
        }
    }

    fn enter(&mut self, state: RunState) {
        info!(
            "event=run_state module=pipeline status=ok run_id={} state={}",
            self.run_id,
            state.as_str()
        );
        self.states.push(state);
    }

    fn current(&self) -> RunState {
        self.states.last().copied().unwrap_or(RunState::Idle)
    }
}

/// Executes one run under the configured lock.
///
/// # Errors
/// - See `RunError::exit_code` for the failure classes.
pub fn run(config: &SyncConfig, options: &RunOptions) -> Result<RunSummary, RunError> {
    let started_at = Instant::now();
    let run_id = Uuid::new_v4();
    let strategy = options.strategy.unwrap_or(config.sync.strategy);
    info!(
        "event=sync_run module=pipeline status=start run_id={} strategy={} dry_run={}",
        run_id,
        strategy.as_str(),
        options.dry_run
    );

    let mut trace = StateTrace::new(run_id);
    let stale_after = config.lock.stale_after_secs.map(Duration::from_secs);
    let lock = match RunLock::acquire_with_staleness(&config.lock.path, stale_after) {
        Ok(lock) => lock,
        Err(err) => {
            let err = RunError::from(err);
            trace.enter(RunState::AbortedBeforeMutation);
            log_failure(run_id, RunState::Idle, &err, started_at);
            return Err(err);
        }
    };
    trace.enter(RunState::Locked);

    let result = run_locked(config, options, strategy, &mut trace);

    if let Err(err) = lock.release() {
        warn!(
            "event=lock_release module=pipeline status=error run_id={} error={}",
            run_id, err
        );
    }

    match result {
        Ok(mut summary) => {
            trace.enter(RunState::Unlocked);
            summary.run_id = run_id;
            summary.states = trace.states;
            summary.duration_ms = started_at.elapsed().as_millis() as u64;
            info!(
                "event=sync_run module=pipeline status=ok run_id={} dry_run={} conflicts={} unapplied={} duration_ms={}",
                run_id,
                summary.dry_run,
                summary.conflicts.len(),
                summary.source.unapplied.len(),
                summary.duration_ms
            );
            Ok(summary)
        }
        Err(err) => {
            let terminal = if trace.mutated {
                RunState::Unlocked
            } else {
                RunState::AbortedBeforeMutation
            };
            let failed_in = trace.current();
            trace.enter(terminal);
            log_failure(run_id, failed_in, &err, started_at);
            Err(err)
        }
    }
}

fn run_locked(
    config: &SyncConfig,
    options: &RunOptions,
    strategy: StrategyKind,
    trace: &mut StateTrace,
) -> Result<RunSummary, RunError> {
    trace.enter(RunState::Extracting);
    let handle = SourceHandle::from_config(&config.source);
    let headers = config.header_map();
    let source = RowExtractor::new(&handle, &headers).extract()?;

    let conn = open_destination(config, options.dry_run)?;
    let table = config.destination.table.as_str();
    let store = SqliteRowStore::new(&conn, table)?;
    let destination = if table_exists(&conn, table)? {
        store.read_snapshot()?
    } else if options.dry_run {
        Extraction::default()
    } else if config.destination.create_table {
        ensure_activity_table(&conn, table)?;
        store.read_snapshot()?
    } else {
        // Surfaces as "no such table" from the read.
        store.read_snapshot()?
    };

    trace.enter(RunState::Reconciling);
    let now = options.now.unwrap_or_else(Timestamp::now);
    let changes = reconcile_with_skipped_sections(
        &source.snapshot,
        &destination.snapshot,
        strategy,
        now,
        &source.diagnostics.sections_skipped,
    );
    let planned = changes.counts();
    info!(
        "event=reconcile module=pipeline status=ok insert_dest={} update_dest={} insert_source={} update_source={} delete_source_needed={}",
        planned.insert_into_destination,
        planned.update_in_destination,
        planned.insert_into_source,
        planned.update_in_source,
        planned.delete_from_source_needed
    );

    let mut summary = RunSummary {
        run_id: trace.run_id,
        strategy,
        deletion_policy: config.sync.deletion_policy,
        dry_run: options.dry_run,
        states: Vec::new(),
        planned,
        destination: BatchOutcome::default(),
        source: SourceOutcome::default(),
        deleted_from_destination: Vec::new(),
        conflicts: Vec::new(),
        source_diagnostics: source.diagnostics,
        destination_diagnostics: destination.diagnostics,
        pending_changes: None,
        duration_ms: 0,
    };
    if options.dry_run {
        trace.enter(RunState::Reporting);
        return Ok(summary);
    }

    trace.enter(RunState::Applying);
    let mut pending = PendingChanges::new();
    let mut applier = Applier::new(&store, source_writer(strategy, &handle, &headers));
    let applied = applier.apply(&changes, &mut pending)?;
    trace.mutated = true;

    trace.enter(RunState::DetectingDeletions);
    let inserted: BTreeSet<String> = changes
        .insert_into_destination
        .iter()
        .map(|record| record.primary_key.clone())
        .collect();
    let deferred: BTreeSet<String> = applied
        .source
        .unapplied
        .iter()
        .map(|row| row.key.clone())
        .collect();
    let detected = ConflictReporter::new(&handle, &headers, &store, config.sync.deletion_policy)
        .detect(&inserted, &deferred, &mut pending);

    // Rows deferred by the apply phase are flushed even when detection fails.
    let artifact = &config.sync.pending_changes;
    let flushed = pending.write_to(artifact);
    let deletions = detected?;

    trace.enter(RunState::Reporting);
    if flushed? {
        summary.pending_changes = Some(artifact.clone());
    }

    summary.destination = applied.destination;
    summary.source = applied.source;
    summary.deleted_from_destination = deletions.deleted_from_destination;
    summary.conflicts = deletions.conflicts;
    Ok(summary)
}

/// Only a real run that may create the table may create the database file.
/// A dry run against a missing file previews against an empty in-memory one.
fn open_destination(config: &SyncConfig, dry_run: bool) -> Result<Connection, RunError> {
    let database = &config.destination.database;
    if !config.destination.create_table {
        return Ok(open_existing_db(database)?);
    }
    if !dry_run {
        return Ok(open_db(database)?);
    }
    if matches!(database.try_exists(), Ok(false)) {
        info!(
            "event=db_open module=pipeline status=skip reason=dry_run_missing_database path={}",
            database.display()
        );
        return Ok(open_db_in_memory()?);
    }
    Ok(open_existing_db(database)?)
}

fn log_failure(run_id: Uuid, failed_in: RunState, err: &RunError, started_at: Instant) {
    error!(
        "event=sync_run module=pipeline status=error run_id={} failed_in={} error_code={} duration_ms={} error={}",
        run_id,
        failed_in.as_str(),
        err.code(),
        started_at.elapsed().as_millis(),
        err
    );
}

#[cfg(test)]
mod tests {
    use super::{RunError, RunState};
    use crate::apply::ApplyError;
    use crate::config::ConfigError;
    use crate::lock::LockError;
    use crate::store::{StoreError, WriteAction};
    use std::path::PathBuf;

    #[test]
    fn exit_codes_are_distinct_per_failure_class() {
        let held = RunError::Lock(LockError::Held {
            path: PathBuf::from("sync.lock"),
            owner: Some("42".to_string()),
        });
        let config = RunError::Config(ConfigError::Invalid("bad".to_string()));
        let rolled_back = RunError::Apply(ApplyError::Destination(StoreError::WriteConflict {
            key: "K1".to_string(),
            action: WriteAction::Insert,
            reason: "UNIQUE constraint failed".to_string(),
        }));

        assert_eq!(config.exit_code(), 2);
        assert_eq!(held.exit_code(), 3);
        assert_eq!(rolled_back.exit_code(), 6);
        assert!(rolled_back.to_string().contains("K1"));
    }

    #[test]
    fn state_names_are_snake_case() {
        assert_eq!(RunState::DetectingDeletions.as_str(), "detecting_deletions");
        assert_eq!(
            serde_json::to_string(&RunState::AbortedBeforeMutation).unwrap(),
            "\"aborted_before_mutation\""
        );
    }
}
