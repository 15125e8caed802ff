use std::path::{Path, PathBuf};
use std::time::Instant;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::route::Route;

/// Route-specific identifiers from the worklist.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteIds {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cross: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
}

impl RouteIds {
    /// Parse `cross=EFO_1;origin=NCT2`. A bare token applies to both routes.
    pub fn parse(field: &str) -> Result<Self, String> {
        let mut ids = RouteIds::default();
        for token in field.split([';', ',']).map(str::trim).filter(|t| !t.is_empty()) {
            match token.split_once('=') {
                Some((key, value)) => {
                    let value = value.trim();
                    if value.is_empty() {
                        return Err(format!("empty value for route id '{key}'"));
                    }
                    match key.trim().to_ascii_lowercase().as_str() {
                        "cross" => ids.cross = Some(value.to_string()),
                        "origin" => ids.origin = Some(value.to_string()),
                        other => return Err(format!("unknown route '{other}'")),
                    }
                }
                None => {
                    ids.cross.get_or_insert_with(|| token.to_string());
                    ids.origin.get_or_insert_with(|| token.to_string());
                }
            }
        }
        Ok(ids)
    }

    pub fn get(&self, route: Route) -> Option<&str> {
        match route {
            Route::Cross => self.cross.as_deref(),
            Route::Origin => self.origin.as_deref(),
        }
    }
}

/// One worklist entry. Immutable while it is processed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    pub key: String,
    pub query: String,
    pub route_ids: RouteIds,
    pub config_ref: Option<PathBuf>,
    /// 1-based worklist line, for diagnostics.
    pub line: usize,
}

impl Job {
    pub fn new(key: impl Into<String>, query: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            query: query.into(),
            route_ids: RouteIds::default(),
            config_ref: None,
            line: 0,
        }
    }
}

/// One processing attempt of a job.
#[derive(Debug, Clone)]
pub struct Run {
    pub run_id: String,
    pub run_date: NaiveDate,
    pub started_at: DateTime<Utc>,
    pub work_dir: PathBuf,
    started: Instant,
}

impl Run {
    /// Start a run for `job` with a fresh id and working directory path.
    pub fn start(job: &Job, work_root: &Path) -> Self {
        let now = Utc::now();
        let suffix = Uuid::new_v4().simple().to_string();
        let run_id = format!("{}_{}", now.format("%Y%m%d_%H%M%S"), &suffix[..8]);
        Self {
            work_dir: work_root.join(&job.key).join(&run_id),
            run_id,
            run_date: now.date_naive(),
            started_at: now,
            started: Instant::now(),
        }
    }

    pub fn route_dir(&self, route: Route) -> PathBuf {
        self.work_dir.join(route.as_str())
    }

    pub fn elapsed_secs(&self) -> f64 {
        (self.started.elapsed().as_secs_f64() * 100.0).round() / 100.0
    }
}
