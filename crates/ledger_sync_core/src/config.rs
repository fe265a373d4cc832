//! Run configuration loaded from TOML.
//!
//! # Responsibility
//! - Deserialize the reconciler configuration file.
//! - Resolve relative paths against the configuration file directory.
//! - Reject invalid settings before any store is touched.
//!
//! # Invariants
//! - A validated config has at least one section, unique section names,
//!   1-based header rows, a valid table identifier and known alias targets.

use crate::db::schema::is_valid_table_name;
use crate::model::header::{Column, HeaderMap};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::path::{Path, PathBuf};

const DEFAULT_TABLE: &str = "activities";
const DEFAULT_PENDING_CHANGES: &str = "pending_changes.csv";
const DEFAULT_LOCK_FILE: &str = "ledger-sync.lock";

/// How source-side actions are carried out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    /// Source is never mutated; actions go to the pending-changes artifact.
    #[default]
    Export,
    /// Source sections are rewritten in place.
    InPlace,
}

impl StrategyKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Export => "export",
            Self::InPlace => "in_place",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "export" => Some(Self::Export),
            "in_place" | "inplace" => Some(Self::InPlace),
            _ => None,
        }
    }
}

/// What the post-apply pass does with destination-only keys.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeletionPolicy {
    /// Delete them from the destination in a second transaction.
    #[default]
    Propagate,
    /// Only list them as conflicts.
    Report,
}

impl DeletionPolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Propagate => "propagate",
            Self::Report => "report",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SyncConfig {
    pub source: SourceConfig,
    pub destination: DestinationConfig,
    #[serde(default)]
    pub sync: SyncOptions,
    #[serde(default)]
    pub lock: LockConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SourceConfig {
    /// Workbook directory holding one `<section>.csv` per section.
    pub workbook: PathBuf,
    pub sections: Vec<SectionConfig>,
    /// Extra header text → canonical column name (`key`, `modified_at`, field).
    #[serde(default)]
    pub header_aliases: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SectionConfig {
    pub name: String,
    /// 1-based row number of the header row.
    #[serde(default = "default_header_row")]
    pub header_row: usize,
    #[serde(default)]
    pub optional: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DestinationConfig {
    pub database: PathBuf,
    #[serde(default = "default_table")]
    pub table: String,
    #[serde(default = "default_true")]
    pub create_table: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SyncOptions {
    #[serde(default)]
    pub strategy: StrategyKind,
    #[serde(default)]
    pub deletion_policy: DeletionPolicy,
    #[serde(default = "default_pending_changes")]
    pub pending_changes: PathBuf,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            strategy: StrategyKind::default(),
            deletion_policy: DeletionPolicy::default(),
            pending_changes: default_pending_changes(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LockConfig {
    #[serde(default = "default_lock_path")]
    pub path: PathBuf,
    /// Opt-in takeover threshold for a sentinel left by a killed run.
    #[serde(default)]
    pub stale_after_secs: Option<u64>,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            path: default_lock_path(),
            stale_after_secs: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    pub level: Option<String>,
    /// Rolling log directory; stderr when unset.
    pub dir: Option<PathBuf>,
}

impl SyncConfig {
    /// Reads, resolves and validates a configuration file.
    ///
    /// # Errors
    /// - `ConfigError::Io` when the file cannot be read.
    /// - `ConfigError::Parse` when TOML is malformed or has unknown keys.
    /// - `ConfigError::Invalid` when validation fails.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
        Self::from_toml_str(&text, base_dir)
    }

    /// Parses TOML text; relative paths resolve against `base_dir`.
    pub fn from_toml_str(text: &str, base_dir: &Path) -> Result<Self, ConfigError> {
        let mut config: SyncConfig = toml::from_str(text)?;
        config.resolve_paths(base_dir);
        config.validate()?;
        Ok(config)
    }

    /// Checks cross-field invariants.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.source.sections.is_empty() {
            return Err(ConfigError::Invalid(
                "source.sections must list at least one section".to_string(),
            ));
        }

        let mut names = BTreeSet::new();
        for section in &self.source.sections {
            let name = section.name.trim();
            if name.is_empty() {
                return Err(ConfigError::Invalid(
                    "source section name cannot be empty".to_string(),
                ));
            }
            if name.contains(['/', '\\']) {
                return Err(ConfigError::Invalid(format!(
                    "source section name `{name}` must not contain path separators"
                )));
            }
            if !names.insert(name.to_string()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate source section `{name}`"
                )));
            }
            if section.header_row == 0 {
                return Err(ConfigError::Invalid(format!(
                    "section `{name}` header_row is 1-based; got 0"
                )));
            }
        }

        if !is_valid_table_name(&self.destination.table) {
            return Err(ConfigError::Invalid(format!(
                "destination.table `{}` is not a valid SQL identifier",
                self.destination.table
            )));
        }

        for (alias, target) in &self.source.header_aliases {
            if Column::parse(target).is_none() {
                return Err(ConfigError::Invalid(format!(
                    "header alias `{alias}` targets unknown column `{target}`"
                )));
            }
        }

        Ok(())
    }

    /// Header map with configured aliases applied.
    pub fn header_map(&self) -> HeaderMap {
        HeaderMap::with_aliases(
            self.source
                .header_aliases
                .iter()
                .filter_map(|(alias, target)| {
                    Column::parse(target).map(|column| (alias.as_str(), column))
                }),
        )
    }

    fn resolve_paths(&mut self, base_dir: &Path) {
        resolve_in_place(&mut self.source.workbook, base_dir);
        resolve_in_place(&mut self.destination.database, base_dir);
        resolve_in_place(&mut self.sync.pending_changes, base_dir);
        resolve_in_place(&mut self.lock.path, base_dir);
        if let Some(dir) = self.logging.dir.as_mut() {
            resolve_in_place(dir, base_dir);
        }
    }
}

fn resolve_in_place(path: &mut PathBuf, base_dir: &Path) {
    if path.is_relative() {
        *path = base_dir.join(&*path);
    }
}

fn default_header_row() -> usize {
    1
}

fn default_table() -> String {
    DEFAULT_TABLE.to_string()
}

fn default_true() -> bool {
    true
}

fn default_pending_changes() -> PathBuf {
    PathBuf::from(DEFAULT_PENDING_CHANGES)
}

fn default_lock_path() -> PathBuf {
    PathBuf::from(DEFAULT_LOCK_FILE)
}

#[derive(Debug)]
pub enum ConfigError {
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse(toml::de::Error),
    Invalid(String),
}

impl Display for ConfigError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io { path, source } => {
                write!(f, "failed to read config `{}`: {source}", path.display())
            }
            Self::Parse(err) => write!(f, "invalid config syntax: {err}"),
            Self::Invalid(message) => write!(f, "invalid config: {message}"),
        }
    }
}

impl Error for ConfigError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            Self::Parse(err) => Some(err),
            Self::Invalid(_) => None,
        }
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(value: toml::de::Error) -> Self {
        Self::Parse(value)
    }
}
