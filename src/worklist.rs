use std::path::{Path, PathBuf};

use tracing::warn;

use crate::error::RunnerError;
use crate::state_machine::{Job, RouteIds};

/// Jobs parsed from a worklist plus the lines that were rejected.
///
/// One job per line, `job_key|query|route_ids|config_ref`; `#` starts a comment.
#[derive(Debug, Default)]
pub struct Worklist {
    pub jobs: Vec<Job>,
    pub rejected: Vec<RunnerError>,
}

impl Worklist {
    /// Read a worklist file. Relative `config_ref`s resolve against its directory.
    pub fn read(path: &Path) -> Result<Self, RunnerError> {
        let contents = std::fs::read_to_string(path)?;
        let base = path.parent().unwrap_or_else(|| Path::new("."));
        Ok(Self::parse(&contents, base))
    }

    pub fn parse(contents: &str, base: &Path) -> Self {
        let mut worklist = Worklist::default();
        for (idx, raw) in contents.lines().enumerate() {
            let line = idx + 1;
            let trimmed = raw.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            match parse_line(trimmed, line, base) {
                Ok(job) => worklist.jobs.push(job),
                Err(message) => {
                    warn!(line, "skipping worklist line: {message}");
                    worklist.rejected.push(RunnerError::Worklist { line, message });
                }
            }
        }
        worklist
    }

    /// Keep only the named job keys, in worklist order.
    pub fn retain_keys(&mut self, keys: &[String]) {
        if keys.is_empty() {
            return;
        }
        self.jobs.retain(|job| keys.iter().any(|k| k == &job.key));
    }
}

fn parse_line(line: &str, number: usize, base: &Path) -> Result<Job, String> {
    let fields: Vec<&str> = line.split('|').map(str::trim).collect();
    if fields.len() > 4 {
        return Err(format!("expected at most 4 fields, found {}", fields.len()));
    }

    let key = fields[0];
    if key.is_empty() {
        return Err("empty job key".to_string());
    }
    if key.contains(['/', '\\']) || key == "." || key == ".." {
        return Err(format!("job key '{key}' is not a valid directory name"));
    }

    let query = match fields.get(1) {
        Some(q) if !q.is_empty() => q.to_string(),
        _ => default_query(key),
    };
    let route_ids = match fields.get(2) {
        Some(ids) => RouteIds::parse(ids)?,
        None => RouteIds::default(),
    };
    let config_ref = fields
        .get(3)
        .filter(|r| !r.is_empty())
        .map(|r| resolve(base, r));

    Ok(Job {
        key: key.to_string(),
        query,
        route_ids,
        config_ref,
        line: number,
    })
}

/// `idiopathic_pulmonary-fibrosis` becomes `idiopathic pulmonary fibrosis`.
fn default_query(key: &str) -> String {
    key.split(['_', '-'])
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

fn resolve(base: &Path, reference: &str) -> PathBuf {
    let path = PathBuf::from(reference);
    if path.is_absolute() {
        path
    } else {
        base.join(path)
    }
}
