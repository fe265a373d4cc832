//! Core two-way reconciliation between a spreadsheet activity ledger and a
//! relational activity table.
//! This crate is the single source of truth for sync invariants.

pub mod apply;
pub mod config;
pub mod conflict;
pub mod db;
pub mod lock;
pub mod logging;
pub mod model;
pub mod pipeline;
pub mod reconcile;
pub mod source;
pub mod store;

pub use apply::{Applier, ApplyError, PendingAction, PendingChanges, SourceWriter};
pub use config::{ConfigError, DeletionPolicy, StrategyKind, SyncConfig};
pub use conflict::{Conflict, ConflictKind, ConflictReporter};
pub use lock::{LockError, RunLock};
pub use logging::{default_log_level, init_logging, logging_status};
pub use model::field::{FieldId, Value};
pub use model::record::{Record, Snapshot};
pub use model::timestamp::{parse_timestamp, Timestamp};
pub use pipeline::{run, RunError, RunOptions, RunState, RunSummary};
pub use reconcile::{reconcile, ChangeSet};
pub use source::{RowExtractor, SourceError, SourceHandle};
pub use store::{RowStore, SqliteRowStore, StoreError};

/// Returns the core crate version.
pub fn core_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
