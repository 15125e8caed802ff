use std::fs;
use std::path::Path;
use std::time::{Duration, SystemTime};

use tracing::{debug, info, warn};

use crate::config::{PathsConfig, RetentionConfig};

const DAY: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub work_dirs: usize,
    pub quarantine_dirs: usize,
    pub log_files: usize,
    pub cache_files: usize,
}

impl CleanupReport {
    pub fn total(&self) -> usize {
        self.work_dirs + self.quarantine_dirs + self.log_files + self.cache_files
    }
}

#[derive(Debug, Clone)]
pub struct RetentionCleaner<'a> {
    paths: &'a PathsConfig,
    retention: &'a RetentionConfig,
}

impl<'a> RetentionCleaner<'a> {
    pub fn new(paths: &'a PathsConfig, retention: &'a RetentionConfig) -> Self {
        Self { paths, retention }
    }

    pub fn run(&self) -> CleanupReport {
        self.run_at(SystemTime::now())
    }

    /// Clean as if the current time were `now`.
    pub fn run_at(&self, now: SystemTime) -> CleanupReport {
        let report = CleanupReport {
            work_dirs: purge_run_dirs(&self.paths.work_root(), cutoff(now, self.retention.work_days)),
            quarantine_dirs: purge_run_dirs(
                &self.paths.quarantine_root(),
                cutoff(now, self.retention.quarantine_days),
            ),
            log_files: purge_files(&self.paths.logs_root(), cutoff(now, self.retention.log_days)),
            cache_files: purge_files(&self.paths.cache_root(), cutoff(now, self.retention.cache_days)),
        };
        info!(
            work = report.work_dirs,
            quarantine = report.quarantine_dirs,
            logs = report.log_files,
            cache = report.cache_files,
            "retention cleanup finished"
        );
        report
    }
}

fn cutoff(now: SystemTime, days: u64) -> SystemTime {
    DAY.checked_mul(u32::try_from(days).unwrap_or(u32::MAX))
        .and_then(|window| now.checked_sub(window))
        .unwrap_or(SystemTime::UNIX_EPOCH)
}

fn modified(path: &Path) -> Option<SystemTime> {
    fs::metadata(path).and_then(|m| m.modified()).ok()
}

/// Remove `<root>/<job>/<run>` directories older than `cutoff`, then any job
/// directory left empty.
fn purge_run_dirs(root: &Path, cutoff: SystemTime) -> usize {
    let Ok(jobs) = fs::read_dir(root) else {
        return 0;
    };
    let mut removed = 0;
    for job in jobs.flatten() {
        let job_dir = job.path();
        if !job_dir.is_dir() {
            continue;
        }
        let Ok(runs) = fs::read_dir(&job_dir) else {
            continue;
        };
        for run in runs.flatten() {
            let run_dir = run.path();
            if !run_dir.is_dir() {
                continue;
            }
            if modified(&run_dir).is_some_and(|t| t < cutoff) {
                match fs::remove_dir_all(&run_dir) {
                    Ok(()) => {
                        debug!(dir = %run_dir.display(), "removed expired run directory");
                        removed += 1;
                    }
                    Err(e) => warn!(dir = %run_dir.display(), "failed to remove: {e}"),
                }
            }
        }
        if fs::read_dir(&job_dir).is_ok_and(|mut d| d.next().is_none()) {
            let _ = fs::remove_dir(&job_dir);
        }
    }
    removed
}

/// Remove files older than `cutoff` anywhere under `root`.
fn purge_files(root: &Path, cutoff: SystemTime) -> usize {
    let Ok(entries) = fs::read_dir(root) else {
        return 0;
    };
    let mut removed = 0;
    for entry in entries.flatten() {
        let path = entry.path();
        let Ok(kind) = entry.file_type() else {
            continue;
        };
        if kind.is_dir() {
            removed += purge_files(&path, cutoff);
        } else if modified(&path).is_some_and(|t| t < cutoff) {
            match fs::remove_file(&path) {
                Ok(()) => removed += 1,
                Err(e) => warn!(file = %path.display(), "failed to remove: {e}"),
            }
        }
    }
    removed
}
