//! Manifest Gate: checks the provenance record a ranking stage leaves behind.
//!
//! A source-mode mismatch is always critical. Step errors are critical unless
//! every erroring step is on the configured non-critical list.

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

/// Status recorded for one step inside a ranking stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Ok,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepError {
    pub step_name: String,
    pub status: StepStatus,
    #[serde(default)]
    pub detail: String,
}

/// Provenance manifest written by a ranking stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub source_mode: String,
    #[serde(default)]
    pub step_errors: Vec<StepError>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ContractViolation {
    #[error("manifest unreadable: {0}")]
    Unreadable(String),

    #[error("source_mode is '{found}', expected '{expected}'")]
    SourceMismatch { expected: String, found: String },

    #[error("critical step errors: {}", .steps.join(", "))]
    CriticalStepErrors { steps: Vec<String> },
}

/// A manifest that passed, possibly with tolerated step errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatePass {
    pub tolerated: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ManifestGate {
    noncritical: Vec<String>,
}

impl ManifestGate {
    pub fn new(noncritical: Vec<String>) -> Self {
        Self { noncritical }
    }

    /// Read `manifest_path` and check it against `expected_source`.
    pub fn validate(
        &self,
        manifest_path: &Path,
        expected_source: &str,
    ) -> Result<GatePass, ContractViolation> {
        let contents = std::fs::read_to_string(manifest_path)
            .map_err(|e| ContractViolation::Unreadable(format!("{}: {e}", manifest_path.display())))?;
        let manifest: Manifest = serde_json::from_str(&contents)
            .map_err(|e| ContractViolation::Unreadable(format!("{}: {e}", manifest_path.display())))?;
        self.check(&manifest, expected_source)
    }

    pub fn check(
        &self,
        manifest: &Manifest,
        expected_source: &str,
    ) -> Result<GatePass, ContractViolation> {
        if manifest.source_mode != expected_source {
            return Err(ContractViolation::SourceMismatch {
                expected: expected_source.to_string(),
                found: manifest.source_mode.clone(),
            });
        }

        let (tolerated, critical): (Vec<&StepError>, Vec<&StepError>) = manifest
            .step_errors
            .iter()
            .filter(|e| e.status == StepStatus::Error)
            .partition(|e| self.noncritical.iter().any(|n| n == &e.step_name));

        if !critical.is_empty() {
            return Err(ContractViolation::CriticalStepErrors {
                steps: critical.iter().map(|e| e.step_name.clone()).collect(),
            });
        }

        for step in &tolerated {
            warn!(step = %step.step_name, detail = %step.detail, "non-critical manifest step error");
        }
        Ok(GatePass {
            tolerated: tolerated.iter().map(|e| e.step_name.clone()).collect(),
        })
    }
}
