//! `ledger-sync` command line entry point.
//!
//! # Responsibility
//! - Load configuration, initialize logging and run one reconciliation batch.
//! - Map the run outcome to a process exit status.

use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use ledger_sync_core::{
    default_log_level, init_logging, run, RunError, RunOptions, RunSummary, StrategyKind,
    SyncConfig,
};
use std::path::PathBuf;
use std::process::ExitCode;

const EXIT_UNEXPECTED: u8 = 1;
const EXIT_CONFIG: u8 = 2;

fn cli() -> Command {
    let config_arg = Arg::new("config")
        .long("config")
        .short('c')
        .required(true)
        .value_parser(value_parser!(PathBuf))
        .help("Path to the TOML configuration file");

    Command::new("ledger-sync")
        .version(ledger_sync_core::core_version())
        .about("Two-way reconciliation between an activity ledger workbook and a SQLite table")
        .subcommand_required(true)
        .subcommand(
            Command::new("run")
                .about("Run one reconciliation batch")
                .arg(config_arg.clone())
                .arg(
                    Arg::new("strategy")
                        .long("strategy")
                        .value_parser(["export", "in_place"])
                        .help("Override sync.strategy"),
                )
                .arg(
                    Arg::new("dry-run")
                        .long("dry-run")
                        .action(ArgAction::SetTrue)
                        .help("Compute the change set without writing either store"),
                )
                .arg(
                    Arg::new("format")
                        .long("format")
                        .default_value("text")
                        .value_parser(["text", "json"])
                        .help("Summary output format"),
                )
                .arg(
                    Arg::new("log-level")
                        .long("log-level")
                        .help("Override logging.level (trace|debug|info|warn|error)"),
                ),
        )
        .subcommand(
            Command::new("check-config")
                .about("Validate a configuration file and exit")
                .arg(config_arg),
        )
}

fn main() -> ExitCode {
    let matches = cli().get_matches();
    match matches.subcommand() {
        Some(("run", args)) => run_command(args),
        Some(("check-config", args)) => check_config(args),
        _ => ExitCode::from(EXIT_UNEXPECTED),
    }
}

fn load_config(args: &ArgMatches) -> Result<SyncConfig, ExitCode> {
    let Some(path) = args.get_one::<PathBuf>("config") else {
        return Err(ExitCode::from(EXIT_CONFIG));
    };
    SyncConfig::load(path).map_err(|err| {
        eprintln!("ledger-sync: {err}");
        ExitCode::from(EXIT_CONFIG)
    })
}

fn check_config(args: &ArgMatches) -> ExitCode {
    match load_config(args) {
        Ok(config) => {
            println!(
                "config ok: {} section(s), table `{}`, strategy {}",
                config.source.sections.len(),
                config.destination.table,
                config.sync.strategy.as_str()
            );
            ExitCode::SUCCESS
        }
        Err(code) => code,
    }
}

fn run_command(args: &ArgMatches) -> ExitCode {
    let config = match load_config(args) {
        Ok(config) => config,
        Err(code) => return code,
    };

    let level = args
        .get_one::<String>("log-level")
        .cloned()
        .or_else(|| config.logging.level.clone())
        .unwrap_or_else(|| default_log_level().to_string());
    if let Err(err) = init_logging(&level, config.logging.dir.as_deref()) {
        eprintln!("ledger-sync: {err}");
        return ExitCode::from(EXIT_CONFIG);
    }

    let options = RunOptions {
        strategy: args
            .get_one::<String>("strategy")
            .and_then(|value| StrategyKind::parse(value)),
        dry_run: args.get_flag("dry-run"),
        now: None,
    };
    let json = args.get_one::<String>("format").map(String::as_str) == Some("json");

    match run(&config, &options) {
        Ok(summary) => {
            if json {
                match serde_json::to_string_pretty(&summary) {
                    Ok(text) => println!("{text}"),
                    Err(err) => {
                        eprintln!("ledger-sync: failed to encode summary: {err}");
                        return ExitCode::from(EXIT_UNEXPECTED);
                    }
                }
            } else {
                print!("{}", render_text(&summary));
            }
            ExitCode::SUCCESS
        }
        Err(err) => {
            eprintln!("ledger-sync: {err}");
            exit_code_for(&err)
        }
    }
}

fn exit_code_for(err: &RunError) -> ExitCode {
    u8::try_from(err.exit_code())
        .map(ExitCode::from)
        .unwrap_or(ExitCode::from(EXIT_UNEXPECTED))
}

fn render_text(summary: &RunSummary) -> String {
    let planned = &summary.planned;
    let mut out = String::new();
    out.push_str(&format!(
        "run {} strategy={} deletion_policy={}{}\n",
        summary.run_id,
        summary.strategy.as_str(),
        summary.deletion_policy.as_str(),
        if summary.dry_run { " (dry run)" } else { "" }
    ));
    out.push_str(&format!(
        "  planned: insert_dest={} update_dest={} insert_source={} update_source={} delete_source_needed={}\n",
        planned.insert_into_destination,
        planned.update_in_destination,
        planned.insert_into_source,
        planned.update_in_source,
        planned.delete_from_source_needed
    ));
    if !summary.dry_run {
        out.push_str(&format!(
            "  destination: inserted={} updated={} deleted={} propagated_deletions={}\n",
            summary.destination.inserted,
            summary.destination.updated,
            summary.destination.deleted,
            summary.deleted_from_destination.len()
        ));
        out.push_str(&format!(
            "  source: inserted={} updated={} removed={} exported={}\n",
            summary.source.inserted,
            summary.source.updated,
            summary.source.removed,
            summary.source.exported
        ));
    }

    let diagnostics = &summary.source_diagnostics;
    if !diagnostics.is_clean() {
        out.push_str(&format!(
            "  source diagnostics: duplicates={} rows_without_key={} malformed={} sections_skipped={}\n",
            diagnostics.duplicate_keys.len(),
            diagnostics.rows_without_key,
            diagnostics.malformed_values.len(),
            diagnostics.sections_skipped.join("|")
        ));
    }
    if !summary.destination_diagnostics.is_clean() {
        out.push_str(&format!(
            "  destination diagnostics: malformed={}\n",
            summary.destination_diagnostics.malformed_values.len()
        ));
    }
    for conflict in &summary.conflicts {
        out.push_str(&format!(
            "  conflict: {} {}\n",
            conflict.key,
            conflict.kind.as_str()
        ));
    }
    for row in &summary.source.unapplied {
        out.push_str(&format!(
            "  unapplied: {} ({}): {}\n",
            row.key, row.action, row.reason
        ));
    }
    if let Some(path) = &summary.pending_changes {
        out.push_str(&format!("  pending changes: {}\n", path.display()));
    }
    let states: Vec<&str> = summary.states.iter().map(|state| state.as_str()).collect();
    out.push_str(&format!("  states: {}\n", states.join(" -> ")));
    out
}
