use ledger_sync_core::db::open_db;
use ledger_sync_core::db::schema::ensure_activity_table;
use ledger_sync_core::{
    parse_timestamp, run, ConflictKind, FieldId, RowExtractor, RowStore, RunError, RunOptions,
    RunState, Snapshot, SourceHandle, SqliteRowStore, StrategyKind, SyncConfig, Timestamp,
};
use rusqlite::Connection;
use tempfile::TempDir;

const LEDGER_TITLE: &str = "Weekly activity ledger,,,,,,\n";
const LEDGER_HEADER: &str = "ID,Staff,Date,Task,Hours,Notes,Last Modified\n";

struct Fixture {
    dir: TempDir,
    config: SyncConfig,
}

impl Fixture {
    fn new(strategy: &str, extra_sync: &str) -> Self {
        Self::with_sections(strategy, extra_sync, r#"[{ name = "Activities", header_row = 2 }]"#)
    }

    fn with_sections(strategy: &str, extra_sync: &str, sections: &str) -> Self {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("ledger")).unwrap();
        let text = format!(
            r#"
[source]
workbook = "ledger"
sections = {sections}

[destination]
database = "dest.sqlite3"

[sync]
strategy = "{strategy}"
pending_changes = "pending.csv"
{extra_sync}

[lock]
path = "sync.lock"
"#
        );
        let config = SyncConfig::from_toml_str(&text, dir.path()).unwrap();
        Self { dir, config }
    }

    fn write_section(&self, name: &str, rows: &str) {
        std::fs::write(
            self.dir.path().join("ledger").join(format!("{name}.csv")),
            format!("{LEDGER_TITLE}{LEDGER_HEADER}{rows}"),
        )
        .unwrap();
    }

    fn read_section(&self, name: &str) -> String {
        std::fs::read_to_string(self.dir.path().join("ledger").join(format!("{name}.csv")))
            .unwrap()
    }

    fn dest(&self) -> Connection {
        let conn = open_db(&self.config.destination.database).unwrap();
        ensure_activity_table(&conn, "activities").unwrap();
        conn
    }

    fn seed_dest(&self, sql: &str) {
        self.dest().execute_batch(sql).unwrap();
    }

    fn dest_snapshot(&self) -> Snapshot {
        let conn = self.dest();
        let store = SqliteRowStore::new(&conn, "activities").unwrap();
        store.read_snapshot().unwrap().snapshot
    }

    fn pending_path(&self) -> std::path::PathBuf {
        self.dir.path().join("pending.csv")
    }
}

fn at(raw: &str) -> Timestamp {
    parse_timestamp(raw).unwrap()
}

fn fixed_clock() -> RunOptions {
    RunOptions {
        now: Some(at("2024-06-01 12:00:00")),
        ..RunOptions::default()
    }
}

#[test]
fn held_lock_aborts_without_touching_either_store() {
    let fixture = Fixture::new("export", "");
    fixture.write_section("Activities", "K1,Ada,2024-03-01,x,1,,\n");
    std::fs::write(&fixture.config.lock.path, "4242\n").unwrap();

    let err = run(&fixture.config, &RunOptions::default()).unwrap_err();

    assert!(matches!(err, RunError::Lock(_)));
    assert_eq!(err.exit_code(), 3);
    assert!(!fixture.config.destination.database.exists());
    assert!(!fixture.pending_path().exists());
    assert_eq!(
        std::fs::read_to_string(&fixture.config.lock.path).unwrap(),
        "4242\n"
    );
}

#[test]
fn newer_source_row_overwrites_destination() {
    let fixture = Fixture::new("export", "");
    fixture.write_section("Activities", "K1,Ada,2024-03-01,x,7.5,,2024-03-01 10:00:00\n");
    fixture.seed_dest(
        "INSERT INTO activities (entry_key, employee, activity_date, activity, hours, modified_at)
         VALUES ('K1', 'Ada', '2024-03-01', 'y', 7.5, '2024-03-01 09:00:00');",
    );

    let summary = run(&fixture.config, &fixed_clock()).unwrap();
    assert_eq!(summary.destination.updated, 1);

    let (activity, modified_at): (String, String) = fixture
        .dest()
        .query_row(
            "SELECT activity, modified_at FROM activities WHERE entry_key = 'K1';",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .unwrap();
    assert_eq!(activity, "x");
    assert_eq!(modified_at, "2024-03-01 10:00:00");
    assert!(!fixture.pending_path().exists());
}

#[test]
fn untimestamped_source_equal_to_destination_writes_nothing() {
    let fixture = Fixture::new("export", "");
    fixture.write_section("Activities", "K2,,,x,,,\n");
    fixture.seed_dest(
        "INSERT INTO activities (entry_key, activity, modified_at)
         VALUES ('K2', 'x', '2024-03-01 09:00:00');",
    );

    let summary = run(&fixture.config, &fixed_clock()).unwrap();

    assert_eq!(summary.planned, Default::default());
    assert_eq!(summary.destination, Default::default());
    assert!(summary.conflicts.is_empty());
    assert_eq!(
        fixture.dest_snapshot().get("K2").unwrap().modified_at,
        Some(at("2024-03-01 09:00:00"))
    );
}

#[test]
fn destination_only_key_is_exported_and_propagated_once() {
    let fixture = Fixture::new("export", "");
    fixture.write_section("Activities", "K1,Ada,2024-03-01,x,1,,2024-03-01 10:00:00\n");
    fixture.seed_dest(
        "INSERT INTO activities (entry_key, activity, modified_at)
         VALUES ('K3', 'stale', '2024-02-01 09:00:00');",
    );

    let first = run(&fixture.config, &fixed_clock()).unwrap();
    assert_eq!(first.planned.delete_from_source_needed, 1);
    assert_eq!(first.deleted_from_destination, vec!["K3".to_string()]);
    assert_eq!(first.pending_changes.as_deref(), Some(fixture.pending_path().as_path()));

    let artifact = std::fs::read_to_string(fixture.pending_path()).unwrap();
    let lines: Vec<&str> = artifact.lines().collect();
    assert_eq!(
        lines[0],
        "action,entry_key,origin_sheet,modified_at,employee,activity_date,activity,client,hours,status,notes"
    );
    assert_eq!(
        lines[1],
        "remove from source,K3,,2024-02-01 09:00:00,,,stale,,,,"
    );
    assert_eq!(lines.len(), 2);

    let keys: Vec<String> = fixture
        .dest_snapshot()
        .keys()
        .map(str::to_string)
        .collect();
    assert_eq!(keys, vec!["K1"]);

    let second = run(&fixture.config, &fixed_clock()).unwrap();
    assert_eq!(second.planned, Default::default());
    assert!(second.deleted_from_destination.is_empty());
    assert!(second.pending_changes.is_none());
    assert!(!fixture.pending_path().exists());
}

#[test]
fn report_policy_keeps_destination_only_rows() {
    let fixture = Fixture::new("export", r#"deletion_policy = "report""#);
    fixture.write_section("Activities", "");
    fixture.seed_dest("INSERT INTO activities (entry_key, activity) VALUES ('K3', 'keep');");

    let summary = run(&fixture.config, &fixed_clock()).unwrap();

    assert!(summary.deleted_from_destination.is_empty());
    assert_eq!(summary.conflicts.len(), 1);
    assert_eq!(summary.conflicts[0].kind, ConflictKind::DeletedFromSource);
    assert!(fixture.dest_snapshot().contains_key("K3"));
    assert!(summary.needs_attention());
}

#[test]
fn in_place_run_converges_and_second_run_is_empty() {
    let fixture = Fixture::new("in_place", "");
    fixture.write_section(
        "Activities",
        "K1,Ada,2024-03-01,draft,7.5,,2024-03-01 09:00:00\nK2,Grace,2024-03-02,review,2,,\n",
    );
    fixture.seed_dest(
        "INSERT INTO activities (entry_key, employee, activity_date, activity, hours, modified_at)
         VALUES ('K1', 'Ada', '2024-03-01', 'final', 7.5, '2024-03-01 11:00:00');
         INSERT INTO activities (entry_key, employee, activity, hours, modified_at)
         VALUES ('K3', 'Linus', 'deploy', 1.25, '2024-03-01 08:00:00');",
    );

    let first = run(&fixture.config, &fixed_clock()).unwrap();
    assert_eq!(first.strategy, StrategyKind::InPlace);
    assert_eq!(first.planned.insert_into_destination, 1);
    assert_eq!(first.planned.update_in_source, 1);
    assert_eq!(first.planned.insert_into_source, 1);
    assert_eq!((first.source.inserted, first.source.updated), (1, 1));
    assert!(first.source.unapplied.is_empty());
    assert!(first.pending_changes.is_none());
    assert_eq!(
        fixture.read_section("Activities"),
        format!(
            "{LEDGER_TITLE}{LEDGER_HEADER}\
K1,Ada,2024-03-01,final,7.5,,2024-03-01 11:00:00
K2,Grace,2024-03-02,review,2,,
K3,Linus,,deploy,1.25,,2024-03-01 08:00:00
"
        )
    );

    let second = run(&fixture.config, &fixed_clock()).unwrap();
    assert_eq!(second.planned, Default::default());
    assert_eq!(second.destination, Default::default());
    assert!(second.deleted_from_destination.is_empty());
    assert!(second.conflicts.is_empty());
    assert_eq!(
        second.states,
        vec![
            RunState::Idle,
            RunState::Locked,
            RunState::Extracting,
            RunState::Reconciling,
            RunState::Applying,
            RunState::DetectingDeletions,
            RunState::Reporting,
            RunState::Unlocked,
        ]
    );
}

#[test]
fn inserted_record_round_trips_with_timestamp() {
    let fixture = Fixture::new("export", "");
    fixture.write_section("Activities", "K5,Ada,01/03/2024,audit,7:30,\"on site, late\",\n");
    let before = Timestamp::now().floor_seconds();

    let summary = run(&fixture.config, &RunOptions::default()).unwrap();
    assert_eq!(summary.destination.inserted, 1);

    let handle = SourceHandle::from_config(&fixture.config.source);
    let headers = fixture.config.header_map();
    let source = RowExtractor::new(&handle, &headers).extract().unwrap().snapshot;
    let dest = fixture.dest_snapshot();

    let original = source.get("K5").unwrap();
    let stored = dest.get("K5").unwrap();
    assert!(original.same_values(stored));
    assert_eq!(stored.rendered(FieldId::Hours).as_deref(), Some("7.5"));
    assert_eq!(stored.origin_sheet.as_deref(), Some("Activities"));
    assert!(stored.modified_at.unwrap() >= before);
}

#[test]
fn duplicate_source_keys_keep_first_occurrence_across_sections() {
    let fixture = Fixture::with_sections(
        "export",
        "",
        r#"[{ name = "Activities", header_row = 2 }, { name = "Week 2", header_row = 2 }]"#,
    );
    fixture.write_section("Activities", "K1,Ada,,first,,,\n,nobody,,orphan,,,\n");
    fixture.write_section("Week 2", "K1,Ada,,second,,,\nK2,Grace,,other,,,\n");

    let summary = run(&fixture.config, &fixed_clock()).unwrap();

    assert_eq!(summary.source_diagnostics.duplicate_keys, vec!["K1".to_string()]);
    assert_eq!(summary.source_diagnostics.rows_without_key, 1);
    let dest = fixture.dest_snapshot();
    let k1 = dest.get("K1").unwrap();
    assert_eq!(k1.rendered(FieldId::Activity).as_deref(), Some("first"));
    assert_eq!(k1.origin_sheet.as_deref(), Some("Activities"));
    assert_eq!(
        dest.get("K2").unwrap().origin_sheet.as_deref(),
        Some("Week 2")
    );
}

#[test]
fn missing_optional_section_is_skipped() {
    let fixture = Fixture::with_sections(
        "export",
        "",
        r#"[{ name = "Activities", header_row = 2 }, { name = "Archive", optional = true }]"#,
    );
    fixture.write_section("Activities", "K1,Ada,,x,,,\n");

    let summary = run(&fixture.config, &fixed_clock()).unwrap();

    assert_eq!(summary.source_diagnostics.sections_skipped, vec!["Archive".to_string()]);
    assert_eq!(summary.destination.inserted, 1);
}

#[test]
fn missing_required_section_aborts_before_destination_is_opened() {
    let fixture = Fixture::new("export", "");

    let err = run(&fixture.config, &fixed_clock()).unwrap_err();

    assert!(matches!(err, RunError::Source(_)));
    assert_eq!(err.exit_code(), 4);
    assert!(!fixture.config.destination.database.exists());
    assert!(!fixture.config.lock.path.exists());
}

#[test]
fn failing_row_rolls_back_whole_destination_batch() {
    let fixture = Fixture::new("in_place", "");
    fixture.write_section("Activities", "A,Ada,,ok,8,,\nB,Grace,,too long,30,,\n");
    let conn = open_db(&fixture.config.destination.database).unwrap();
    conn.execute_batch(
        "CREATE TABLE activities (
            entry_key TEXT PRIMARY KEY NOT NULL,
            employee TEXT,
            activity_date TEXT,
            activity TEXT,
            client TEXT,
            hours REAL CHECK (hours IS NULL OR hours <= 24),
            status TEXT,
            notes TEXT,
            modified_at TEXT,
            origin_sheet TEXT
        );",
    )
    .unwrap();
    drop(conn);
    let ledger_before = fixture.read_section("Activities");

    let err = run(&fixture.config, &fixed_clock()).unwrap_err();

    assert!(matches!(err, RunError::Apply(_)));
    assert_eq!(err.exit_code(), 6);
    assert!(fixture.dest_snapshot().is_empty());
    assert_eq!(fixture.read_section("Activities"), ledger_before);
    assert!(!fixture.pending_path().exists());
    assert!(!fixture.config.lock.path.exists());
}

#[test]
fn dry_run_reports_without_writing() {
    let fixture = Fixture::new("export", "");
    fixture.write_section("Activities", "K1,Ada,,x,,,\n");

    let options = RunOptions {
        dry_run: true,
        ..fixed_clock()
    };
    let summary = run(&fixture.config, &options).unwrap();

    assert!(summary.dry_run);
    assert_eq!(summary.planned.insert_into_destination, 1);
    assert_eq!(summary.destination.inserted, 0);
    assert_eq!(
        summary.states.last().copied(),
        Some(RunState::Unlocked)
    );
    assert!(!summary.states.contains(&RunState::Applying));
    assert!(!fixture.pending_path().exists());
    assert!(!fixture.config.destination.database.exists());

    drop(open_db(&fixture.config.destination.database).unwrap());
    let again = run(&fixture.config, &options).unwrap();
    assert_eq!(again.planned.insert_into_destination, 1);

    let conn = open_db(&fixture.config.destination.database).unwrap();
    let tables: i64 = conn
        .query_row(
            "SELECT count(*) FROM sqlite_master WHERE name = 'activities';",
            [],
            |row| row.get(0),
        )
        .unwrap();
    assert_eq!(tables, 0);
}

#[test]
fn missing_database_without_create_table_is_unreachable() {
    let mut fixture = Fixture::new("export", "");
    fixture.config.destination.create_table = false;
    fixture.write_section("Activities", "K1,Ada,,x,,,\n");

    let err = run(&fixture.config, &fixed_clock()).unwrap_err();

    assert!(matches!(err, RunError::Destination(_)));
    assert_eq!(err.exit_code(), 5);
    assert!(!fixture.config.destination.database.exists());
    assert!(!fixture.config.lock.path.exists());
}

#[test]
fn rows_of_a_vanished_optional_section_are_left_alone() {
    let fixture = Fixture::with_sections(
        "export",
        "",
        r#"[{ name = "Activities", header_row = 2 }, { name = "Archive", header_row = 2, optional = true }]"#,
    );
    fixture.write_section("Activities", "K1,Ada,,x,,,2024-03-01 10:00:00\n");
    fixture.write_section("Archive", "A1,Grace,,old,,,2024-01-01 10:00:00\nA2,Linus,,older,,,\n");
    let first = run(&fixture.config, &fixed_clock()).unwrap();
    assert_eq!(first.destination.inserted, 3);

    std::fs::remove_file(fixture.dir.path().join("ledger").join("Archive.csv")).unwrap();

    let exported = run(&fixture.config, &fixed_clock()).unwrap();
    assert_eq!(exported.source_diagnostics.sections_skipped, vec!["Archive".to_string()]);
    assert_eq!(exported.planned, Default::default());
    assert!(exported.deleted_from_destination.is_empty());
    assert!(!fixture.pending_path().exists());
    let keys: Vec<String> = fixture
        .dest_snapshot()
        .keys()
        .map(str::to_string)
        .collect();
    assert_eq!(keys, vec!["A1", "A2", "K1"]);

    let activities_before = fixture.read_section("Activities");
    let options = RunOptions {
        strategy: Some(StrategyKind::InPlace),
        ..fixed_clock()
    };
    let in_place = run(&fixture.config, &options).unwrap();
    assert_eq!(in_place.planned, Default::default());
    assert_eq!(in_place.source.inserted, 0);
    assert_eq!(fixture.read_section("Activities"), activities_before);
    assert_eq!(fixture.dest_snapshot().len(), 3);
}

#[test]
fn destination_fields_without_a_sheet_column_are_kept() {
    let fixture = Fixture::new("in_place", "");
    fixture.write_section("Activities", "K1,Ada,,x,,,2024-03-01 10:00:00\n");
    fixture.seed_dest(
        "INSERT INTO activities (entry_key, employee, activity, client, modified_at)
         VALUES ('K1', 'Ada', 'x', 'Acme', '2024-03-01 10:00:00');",
    );
    let ledger_before = fixture.read_section("Activities");

    for _ in 0..2 {
        let summary = run(&fixture.config, &fixed_clock()).unwrap();
        assert_eq!(summary.planned, Default::default());
        assert!(summary.conflicts.is_empty());
    }
    assert_eq!(fixture.read_section("Activities"), ledger_before);

    fixture.write_section("Activities", "K1,Ada,,y,,,2024-03-02 10:00:00\n");
    let summary = run(&fixture.config, &fixed_clock()).unwrap();
    assert_eq!(summary.destination.updated, 1);

    let dest = fixture.dest_snapshot();
    let k1 = dest.get("K1").unwrap();
    assert_eq!(k1.rendered(FieldId::Activity).as_deref(), Some("y"));
    assert_eq!(k1.rendered(FieldId::Client).as_deref(), Some("Acme"));
}

#[test]
fn failed_deletion_pass_still_writes_pending_changes() {
    let fixture = Fixture::new("export", "");
    fixture.write_section("Activities", "K1,Ada,,x,,,2024-03-01 10:00:00\n");
    fixture.seed_dest(
        "INSERT INTO activities (entry_key, activity, modified_at)
         VALUES ('K3', 'stale', '2024-02-01 09:00:00');
         CREATE TRIGGER keep_rows BEFORE DELETE ON activities
         BEGIN SELECT RAISE(ABORT, 'rows are protected'); END;",
    );

    let err = run(&fixture.config, &fixed_clock()).unwrap_err();

    assert!(matches!(err, RunError::DeletionPass(_)));
    assert_eq!(err.exit_code(), 6);
    let artifact = std::fs::read_to_string(fixture.pending_path()).unwrap();
    assert!(artifact.contains("remove from source,K3,"));
    let dest = fixture.dest_snapshot();
    assert!(dest.contains_key("K1"));
    assert!(dest.contains_key("K3"));
    assert!(!fixture.config.lock.path.exists());
}

#[test]
fn strategy_override_takes_precedence_over_config() {
    let fixture = Fixture::new("export", "");
    fixture.write_section("Activities", "");
    fixture.seed_dest(
        "INSERT INTO activities (entry_key, activity, modified_at)
         VALUES ('K7', 'from app', '2024-03-01 09:00:00');",
    );

    let options = RunOptions {
        strategy: Some(StrategyKind::InPlace),
        ..fixed_clock()
    };
    let summary = run(&fixture.config, &options).unwrap();

    assert_eq!(summary.strategy, StrategyKind::InPlace);
    assert_eq!(summary.source.inserted, 1);
    assert!(fixture.read_section("Activities").contains("K7,,,from app,,,2024-03-01 09:00:00"));
    assert!(fixture.dest_snapshot().contains_key("K7"));
}
