use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::ArchiveConfig;
use crate::error::RunnerError;
use crate::quality::shortlist_candidates;
use crate::state_machine::{Job, Route, RouteIds, RouteStatus, Run, StepTimings};

pub const SUMMARY_FILE: &str = "run_summary.json";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneCounts {
    pub up: usize,
    pub down: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub timestamp: DateTime<Utc>,
    pub job_key: String,
    pub query: String,
    pub run_id: String,
    pub run_date: NaiveDate,
    pub route_statuses: BTreeMap<Route, RouteStatus>,
    pub route_identifiers: RouteIds,
    pub signature_source: Option<String>,
    pub gene_counts: Option<GeneCounts>,
    pub candidate_counts: BTreeMap<Route, usize>,
    pub overlap_count: usize,
    pub elapsed_seconds: f64,
    pub step_timings: StepTimings,
}

/// What the archiver needs to know about one route.
#[derive(Debug, Clone)]
pub struct RouteArtifacts {
    pub route: Route,
    pub status: RouteStatus,
    pub route_dir: PathBuf,
    /// Directories searched, in order, for each archived file name.
    pub sources: Vec<PathBuf>,
    /// Shortlist of the route's final round.
    pub shortlist: Option<PathBuf>,
}

/// Everything about a finished run that goes into the summary.
#[derive(Debug, Clone)]
pub struct ArchiveRequest<'a> {
    pub job: &'a Job,
    pub run: &'a Run,
    pub routes: Vec<RouteArtifacts>,
    pub route_identifiers: RouteIds,
    pub signature_source: Option<String>,
    pub gene_counts: Option<GeneCounts>,
    pub step_timings: StepTimings,
}

/// Writes `<results>/<job>/<date>/<run_id>/` for successful runs.
#[derive(Debug, Clone)]
pub struct ResultArchiver {
    root: PathBuf,
    config: ArchiveConfig,
}

impl ResultArchiver {
    pub fn new(root: impl Into<PathBuf>, config: ArchiveConfig) -> Self {
        Self {
            root: root.into(),
            config,
        }
    }

    pub fn run_dir(&self, job_key: &str, date: NaiveDate, run_id: &str) -> PathBuf {
        self.root
            .join(job_key)
            .join(date.format("%Y-%m-%d").to_string())
            .join(run_id)
    }

    /// Archive a run. Returns the path of the written summary.
    ///
    /// A run directory created here is removed again if archiving fails, so
    /// results storage only ever holds complete runs.
    pub fn archive(&self, request: &ArchiveRequest<'_>) -> Result<PathBuf, RunnerError> {
        let dest = self.run_dir(&request.job.key, request.run.run_date, &request.run.run_id);
        let fresh = !dest.exists();
        let summary = match self.write_run(&dest, request) {
            Ok(summary) => summary,
            Err(e) => {
                if fresh {
                    if let Err(cleanup) = fs::remove_dir_all(&dest) {
                        warn!(dest = %dest.display(), "failed to remove partial archive: {cleanup}");
                    }
                }
                return Err(e);
            }
        };
        info!(
            job = %request.job.key,
            run = %request.run.run_id,
            dest = %dest.display(),
            overlap = summary.overlap_count,
            "run archived"
        );

        for route in request.routes.iter().filter(|r| r.status == RouteStatus::Success) {
            self.purge_intermediates(&route.route_dir);
        }
        Ok(dest.join(SUMMARY_FILE))
    }

    fn write_run(&self, dest: &Path, request: &ArchiveRequest<'_>) -> Result<RunSummary, RunnerError> {
        fs::create_dir_all(dest)?;

        let mut candidates: BTreeMap<Route, Vec<String>> = BTreeMap::new();
        for route in request.routes.iter().filter(|r| r.status == RouteStatus::Success) {
            let route_dest = dest.join(route.route.as_str());
            fs::create_dir_all(&route_dest)?;
            for name in &self.config.route_files {
                match route.sources.iter().map(|dir| dir.join(name)).find(|p| p.is_file()) {
                    Some(src) => {
                        fs::copy(&src, route_dest.join(name)).map_err(|e| RunnerError::Archive {
                            path: src.clone(),
                            message: e.to_string(),
                        })?;
                    }
                    None => warn!(route = %route.route, file = %name, "archive file not produced"),
                }
            }
            let names = match &route.shortlist {
                Some(path) => shortlist_candidates(path).map_err(|message| RunnerError::Archive {
                    path: path.clone(),
                    message,
                })?,
                None => Vec::new(),
            };
            candidates.insert(route.route, names);
        }

        let summary = RunSummary {
            timestamp: Utc::now(),
            job_key: request.job.key.clone(),
            query: request.job.query.clone(),
            run_id: request.run.run_id.clone(),
            run_date: request.run.run_date,
            route_statuses: request.routes.iter().map(|r| (r.route, r.status)).collect(),
            route_identifiers: request.route_identifiers.clone(),
            signature_source: request.signature_source.clone(),
            gene_counts: request.gene_counts,
            candidate_counts: candidates.iter().map(|(r, c)| (*r, c.len())).collect(),
            overlap_count: overlap(&candidates),
            elapsed_seconds: request.run.elapsed_secs(),
            step_timings: request.step_timings.clone(),
        };

        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(dest.join(SUMMARY_FILE))?;
        file.write_all(serde_json::to_string_pretty(&summary)?.as_bytes())?;
        Ok(summary)
    }

    fn purge_intermediates(&self, dir: &Path) {
        let Ok(entries) = fs::read_dir(dir) else {
            return;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                self.purge_intermediates(&path);
            } else if self
                .config
                .purge_after_archive
                .iter()
                .any(|name| entry.file_name().to_string_lossy() == name.as_str())
            {
                match fs::remove_file(&path) {
                    Ok(()) => debug!(file = %path.display(), "purged intermediate"),
                    Err(e) => warn!(file = %path.display(), "failed to purge intermediate: {e}"),
                }
            }
        }
    }

    /// True when any archived run of `job_key` has a summary.
    pub fn has_summary(&self, job_key: &str) -> bool {
        self.count_runs(job_key) > 0
    }

    /// Archived runs (with a summary) for `job_key`.
    pub fn count_runs(&self, job_key: &str) -> usize {
        let Ok(dates) = fs::read_dir(self.root.join(job_key)) else {
            return 0;
        };
        dates
            .flatten()
            .filter_map(|date| fs::read_dir(date.path()).ok())
            .flat_map(|runs| runs.flatten())
            .filter(|run| run.path().join(SUMMARY_FILE).is_file())
            .count()
    }
}

/// Candidates shared by every route that produced a shortlist.
fn overlap(candidates: &BTreeMap<Route, Vec<String>>) -> usize {
    if candidates.len() < 2 {
        return 0;
    }
    let mut sets = candidates
        .values()
        .map(|names| names.iter().map(|n| n.to_lowercase()).collect::<BTreeSet<_>>());
    let Some(first) = sets.next() else {
        return 0;
    };
    sets.fold(first, |acc, set| acc.intersection(&set).cloned().collect())
        .len()
}
