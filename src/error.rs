use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("Config error: {0}")]
    Config(String),

    #[error("Another batch already owns lock '{name}' (pid {pid})")]
    AlreadyRunning { name: String, pid: u32 },

    #[error("Preflight failed: {0}")]
    Preflight(String),

    #[error("Worklist error at line {line}: {message}")]
    Worklist { line: usize, message: String },

    #[error("Archive error for {path}: {message}")]
    Archive { path: PathBuf, message: String },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl RunnerError {
    /// Process exit code used by the binary when this error ends a batch.
    pub fn exit_code(&self) -> u8 {
        match self {
            RunnerError::Preflight(_) => 1,
            RunnerError::AlreadyRunning { .. } => 2,
            _ => 3,
        }
    }
}

/// A route- or job-level failure: the phase that broke and why.
///
/// Phases are short snake_case labels such as `cross_no_config`,
/// `origin_rank_origin` or `cross_evidence_stage2`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{phase}: {message}")]
pub struct PhaseFailure {
    pub phase: String,
    pub message: String,
}

impl PhaseFailure {
    pub fn new(phase: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            phase: phase.into(),
            message: message.into(),
        }
    }
}
