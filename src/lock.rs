//! Lock Manager: exclusive ownership of a named run slot.
//!
//! One JSON record per lock name under the lock directory. A record whose
//! owner pid is no longer alive is stale and gets reclaimed.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::RunnerError;

/// Contents of a lock record on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    pub pid: u32,
    pub acquired_at: DateTime<Utc>,
}

/// A held lock. Dropping it releases the record.
#[derive(Debug)]
pub struct RunLock {
    name: String,
    path: PathBuf,
    released: bool,
}

impl RunLock {
    /// Take ownership of `name`, reclaiming a stale record if needed.
    pub fn acquire(lock_dir: &Path, name: &str) -> Result<Self, RunnerError> {
        fs::create_dir_all(lock_dir)?;
        let path = lock_dir.join(format!("{name}.lock"));
        let record = LockRecord {
            pid: std::process::id(),
            acquired_at: Utc::now(),
        };

        // Second pass only happens after a stale record was removed.
        for _ in 0..2 {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    file.write_all(serde_json::to_string(&record)?.as_bytes())?;
                    file.sync_all()?;
                    info!(lock = name, pid = record.pid, "lock acquired");
                    return Ok(Self {
                        name: name.to_string(),
                        path,
                        released: false,
                    });
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    match read_record(&path) {
                        Some(existing) if is_pid_alive(existing.pid) => {
                            return Err(RunnerError::AlreadyRunning {
                                name: name.to_string(),
                                pid: existing.pid,
                            });
                        }
                        existing => {
                            warn!(
                                lock = name,
                                stale_pid = existing.map(|r| r.pid),
                                "removing stale lock"
                            );
                            match fs::remove_file(&path) {
                                Ok(()) => {}
                                Err(e) if e.kind() == ErrorKind::NotFound => {}
                                Err(e) => return Err(e.into()),
                            }
                        }
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }

        // Someone recreated the record between our removal and retry.
        let pid = read_record(&path).map(|r| r.pid).unwrap_or(0);
        Err(RunnerError::AlreadyRunning {
            name: name.to_string(),
            pid,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Remove the record unconditionally.
    pub fn release(mut self) {
        self.remove();
    }

    fn remove(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        match fs::remove_file(&self.path) {
            Ok(()) => info!(lock = %self.name, "lock released"),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => warn!(lock = %self.name, "failed to remove lock record: {e}"),
        }
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        self.remove();
    }
}

/// The live owner of `name`, if any. Stale records are reported as free.
pub fn current_holder(lock_dir: &Path, name: &str) -> Option<LockRecord> {
    read_record(&lock_dir.join(format!("{name}.lock"))).filter(|r| is_pid_alive(r.pid))
}

fn read_record(path: &Path) -> Option<LockRecord> {
    let contents = fs::read_to_string(path).ok()?;
    serde_json::from_str(&contents).ok()
}

/// Check whether a pid is alive with `kill(pid, 0)`.
///
/// EPERM means the process exists but belongs to someone else.
pub fn is_pid_alive(pid: u32) -> bool {
    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    if raw <= 0 {
        return false;
    }
    match kill(Pid::from_raw(raw), None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn dead_pid() -> u32 {
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();
        pid
    }

    #[test]
    fn acquire_writes_record_with_own_pid() {
        let tmp = TempDir::new().unwrap();
        let lock = RunLock::acquire(tmp.path(), "batch").unwrap();
        let record = read_record(&tmp.path().join("batch.lock")).unwrap();
        assert_eq!(record.pid, std::process::id());
        assert_eq!(lock.name(), "batch");
    }

    #[test]
    fn second_acquire_while_owner_alive_fails() {
        let tmp = TempDir::new().unwrap();
        let _held = RunLock::acquire(tmp.path(), "batch").unwrap();
        let second = RunLock::acquire(tmp.path(), "batch");
        match second {
            Err(RunnerError::AlreadyRunning { pid, .. }) => assert_eq!(pid, std::process::id()),
            other => panic!("expected AlreadyRunning, got {other:?}"),
        }
    }

    #[test]
    fn stale_lock_is_reclaimed() {
        let tmp = TempDir::new().unwrap();
        let stale = LockRecord {
            pid: dead_pid(),
            acquired_at: Utc::now(),
        };
        fs::write(
            tmp.path().join("batch.lock"),
            serde_json::to_string(&stale).unwrap(),
        )
        .unwrap();

        let _lock = RunLock::acquire(tmp.path(), "batch").unwrap();
        let record = read_record(&tmp.path().join("batch.lock")).unwrap();
        assert_eq!(record.pid, std::process::id());
    }

    #[test]
    fn corrupt_record_is_treated_as_stale() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("batch.lock"), "not json").unwrap();
        assert!(RunLock::acquire(tmp.path(), "batch").is_ok());
    }

    #[test]
    fn drop_and_release_remove_record() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("batch.lock");
        {
            let _lock = RunLock::acquire(tmp.path(), "batch").unwrap();
            assert!(path.exists());
        }
        assert!(!path.exists());

        let lock = RunLock::acquire(tmp.path(), "batch").unwrap();
        lock.release();
        assert!(!path.exists());
    }

    #[test]
    fn distinct_names_do_not_conflict() {
        let tmp = TempDir::new().unwrap();
        let _a = RunLock::acquire(tmp.path(), "a").unwrap();
        assert!(RunLock::acquire(tmp.path(), "b").is_ok());
    }

    #[test]
    fn current_holder_ignores_stale_records() {
        let tmp = TempDir::new().unwrap();
        assert!(current_holder(tmp.path(), "batch").is_none());
        let lock = RunLock::acquire(tmp.path(), "batch").unwrap();
        assert_eq!(
            current_holder(tmp.path(), "batch").map(|r| r.pid),
            Some(std::process::id())
        );
        lock.release();

        let stale = LockRecord {
            pid: dead_pid(),
            acquired_at: Utc::now(),
        };
        fs::write(tmp.path().join("batch.lock"), serde_json::to_string(&stale).unwrap()).unwrap();
        assert!(current_holder(tmp.path(), "batch").is_none());
    }

    #[test]
    fn pid_liveness() {
        assert!(is_pid_alive(std::process::id()));
        assert!(!is_pid_alive(0));
        assert!(!is_pid_alive(u32::MAX));
        assert!(!is_pid_alive(dead_pid()));
    }
}
