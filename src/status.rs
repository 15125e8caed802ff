use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use crate::archive::ResultArchiver;
use crate::config::RunnerConfig;
use crate::lock::{LockRecord, current_holder};
use crate::quarantine::FAILURE_FILE;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobCounts {
    pub job_key: String,
    pub archived: usize,
    pub quarantined: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StatusReport {
    pub lock_holder: Option<LockRecord>,
    pub jobs: Vec<JobCounts>,
}

/// Count archived and quarantined runs per job key.
pub fn collect(config: &RunnerConfig) -> StatusReport {
    let archiver = ResultArchiver::new(config.paths.results_root(), config.archive.clone());
    let mut counts: BTreeMap<String, (usize, usize)> = BTreeMap::new();

    for key in child_dirs(&config.paths.results_root()) {
        counts.entry(key.clone()).or_default().0 = archiver.count_runs(&key);
    }
    let quarantine = config.paths.quarantine_root();
    for key in child_dirs(&quarantine) {
        let runs = child_dirs(&quarantine.join(&key))
            .into_iter()
            .filter(|run| quarantine.join(&key).join(run).join(FAILURE_FILE).is_file())
            .count();
        counts.entry(key).or_default().1 = runs;
    }

    StatusReport {
        lock_holder: current_holder(&config.paths.lock_root(), &config.lock_name),
        jobs: counts
            .into_iter()
            .filter(|(_, (a, q))| a + q > 0)
            .map(|(job_key, (archived, quarantined))| JobCounts {
                job_key,
                archived,
                quarantined,
            })
            .collect(),
    }
}

fn child_dirs(dir: &Path) -> Vec<String> {
    let Ok(entries) = fs::read_dir(dir) else {
        return Vec::new();
    };
    entries
        .flatten()
        .filter(|e| e.file_type().is_ok_and(|t| t.is_dir()))
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .collect()
}
