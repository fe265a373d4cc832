//! Run-exclusive advisory lock backed by a sentinel file.
//!
//! # Responsibility
//! - Guarantee that at most one reconciliation run holds the sentinel.
//! - Release the sentinel on every exit path through `Drop`.
//!
//! # Invariants
//! - Acquisition is non-blocking: an existing sentinel fails immediately.
//! - Sentinel content is the owner pid; it is informational and never checked
//!   against the live process table.
//! - A sentinel left by a killed run is only taken over when a staleness
//!   threshold is configured explicitly.

use log::{info, warn};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::fs::OpenOptions;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

/// Held run lock. Dropping it removes the sentinel file.
#[derive(Debug)]
pub struct RunLock {
    path: PathBuf,
    owner_pid: u32,
    released: bool,
}

impl RunLock {
    /// Acquires the lock with strict fail-fast semantics.
    ///
    /// # Errors
    /// - `LockError::Held` when the sentinel already exists.
    /// - `LockError::Io` when the sentinel cannot be created or written.
    pub fn acquire(path: impl Into<PathBuf>) -> Result<Self, LockError> {
        Self::acquire_with_staleness(path, None)
    }

    /// Acquires the lock, taking over a sentinel older than `stale_after`.
    pub fn acquire_with_staleness(
        path: impl Into<PathBuf>,
        stale_after: Option<Duration>,
    ) -> Result<Self, LockError> {
        let path = path.into();
        match create_sentinel(&path) {
            Ok(lock) => Ok(lock),
            Err(LockError::Held { path, owner }) => {
                let Some(threshold) = stale_after else {
                    return Err(LockError::Held { path, owner });
                };
                let Some(age) = sentinel_age(&path) else {
                    return Err(LockError::Held { path, owner });
                };
                if age < threshold {
                    return Err(LockError::Held { path, owner });
                }

                warn!(
                    "event=lock_takeover module=lock status=stale path={} owner={} age_secs={}",
                    path.display(),
                    owner.as_deref().unwrap_or("unknown"),
                    age.as_secs()
                );
                std::fs::remove_file(&path).map_err(|source| LockError::Io {
                    path: path.clone(),
                    source,
                })?;
                create_sentinel(&path)
            }
            Err(other) => Err(other),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn owner_pid(&self) -> u32 {
        self.owner_pid
    }

    /// Removes the sentinel and reports failures instead of logging them.
    pub fn release(mut self) -> Result<(), LockError> {
        self.released = true;
        remove_sentinel(&self.path)
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if let Err(err) = remove_sentinel(&self.path) {
            warn!(
                "event=lock_release module=lock status=error path={} error={}",
                self.path.display(),
                err
            );
        }
    }
}

fn create_sentinel(path: &Path) -> Result<RunLock, LockError> {
    let mut file = match OpenOptions::new().write(true).create_new(true).open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == ErrorKind::AlreadyExists => {
            return Err(LockError::Held {
                path: path.to_path_buf(),
                owner: read_owner(path),
            });
        }
        Err(source) => {
            return Err(LockError::Io {
                path: path.to_path_buf(),
                source,
            });
        }
    };

    let owner_pid = std::process::id();
    if let Err(source) = writeln!(file, "{owner_pid}").and_then(|()| file.sync_all()) {
        let _ = std::fs::remove_file(path);
        return Err(LockError::Io {
            path: path.to_path_buf(),
            source,
        });
    }

    info!(
        "event=lock_acquire module=lock status=ok path={} pid={}",
        path.display(),
        owner_pid
    );
    Ok(RunLock {
        path: path.to_path_buf(),
        owner_pid,
        released: false,
    })
}

fn remove_sentinel(path: &Path) -> Result<(), LockError> {
    match std::fs::remove_file(path) {
        Ok(()) => {
            info!(
                "event=lock_release module=lock status=ok path={}",
                path.display()
            );
            Ok(())
        }
        // Already gone: nothing left to release.
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(source) => Err(LockError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

fn read_owner(path: &Path) -> Option<String> {
    let content = std::fs::read_to_string(path).ok()?;
    let trimmed = content.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn sentinel_age(path: &Path) -> Option<Duration> {
    let modified = std::fs::metadata(path).ok()?.modified().ok()?;
    SystemTime::now().duration_since(modified).ok()
}

#[derive(Debug)]
pub enum LockError {
    Held {
        path: PathBuf,
        owner: Option<String>,
    },
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl Display for LockError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Held { path, owner } => write!(
                f,
                "run lock `{}` is held by pid {}",
                path.display(),
                owner.as_deref().unwrap_or("unknown")
            ),
            Self::Io { path, source } => {
                write!(f, "run lock `{}` I/O failure: {source}", path.display())
            }
        }
    }
}

impl Error for LockError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Held { .. } => None,
            Self::Io { source, .. } => Some(source),
        }
    }
}
