use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, warn};

use crate::error::{PhaseFailure, RunnerError};
use crate::state_machine::{Job, Run};

pub const FAILURE_FILE: &str = "failure.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub timestamp: DateTime<Utc>,
    pub job_key: String,
    pub run_id: String,
    pub failed_phase: String,
    pub message: String,
    pub elapsed_seconds: f64,
    pub completed_steps: Vec<String>,
    pub signature_source: Option<String>,
}

#[derive(Debug, Clone)]
pub struct FailureRecorder {
    root: PathBuf,
}

impl FailureRecorder {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn run_dir(&self, job_key: &str, run_id: &str) -> PathBuf {
        self.root.join(job_key).join(run_id)
    }

    /// Write the failure record for a run and copy its step logs alongside.
    ///
    /// Refuses to overwrite: a run is quarantined at most once.
    pub fn record(
        &self,
        job: &Job,
        run: &Run,
        failure: &PhaseFailure,
        completed_steps: Vec<String>,
        signature_source: Option<String>,
    ) -> Result<PathBuf, RunnerError> {
        let dir = self.run_dir(&job.key, &run.run_id);
        fs::create_dir_all(&dir)?;

        let record = FailureRecord {
            timestamp: Utc::now(),
            job_key: job.key.clone(),
            run_id: run.run_id.clone(),
            failed_phase: failure.phase.clone(),
            message: failure.message.clone(),
            elapsed_seconds: run.elapsed_secs(),
            completed_steps,
            signature_source,
        };

        let path = dir.join(FAILURE_FILE);
        let mut file = OpenOptions::new().write(true).create_new(true).open(&path)?;
        file.write_all(serde_json::to_string_pretty(&record)?.as_bytes())?;

        let logs = run.work_dir.join("logs");
        if logs.is_dir() {
            if let Err(e) = copy_tree(&logs, &dir.join("logs")) {
                warn!(job = %job.key, "could not copy step logs into quarantine: {e}");
            }
        }

        error!(
            job = %job.key,
            run = %run.run_id,
            phase = %record.failed_phase,
            completed = record.completed_steps.len(),
            "job quarantined: {}",
            record.message
        );
        Ok(path)
    }
}

pub(crate) fn copy_tree(from: &Path, to: &Path) -> std::io::Result<()> {
    fs::create_dir_all(to)?;
    for entry in fs::read_dir(from)? {
        let entry = entry?;
        let target = to.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_tree(&entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), target)?;
        }
    }
    Ok(())
}
