//! Preflight Health Checker, run once per batch before any job.
//!
//! Order: free disk space (fatal), required services (fatal only when all
//! are unreachable), optional LLM service (warning only).

use std::path::Path;
use std::time::Duration;

use reqwest::Client;
use tracing::{info, warn};

use crate::config::{RunnerConfig, ServiceEndpoint};
use crate::error::RunnerError;

const BYTES_PER_GB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Reachability check for one external service.
pub trait HealthProbe {
    /// `Ok(status)` when the service answered, `Err(reason)` otherwise.
    async fn probe(&self, endpoint: &ServiceEndpoint) -> Result<u16, String>;
}

/// HTTP GET probe. Any answer below 500 counts as reachable.
pub struct HttpProbe {
    client: Client,
}

impl HttpProbe {
    pub fn new(timeout: Duration) -> Result<Self, RunnerError> {
        let client = Client::builder()
            .connect_timeout(timeout)
            .timeout(timeout)
            .build()?;
        Ok(Self { client })
    }
}

impl HealthProbe for HttpProbe {
    async fn probe(&self, endpoint: &ServiceEndpoint) -> Result<u16, String> {
        let response = self
            .client
            .get(&endpoint.url)
            .send()
            .await
            .map_err(|e| e.to_string())?;
        let status = response.status();
        if status.is_server_error() {
            return Err(format!("HTTP {}", status.as_u16()));
        }
        Ok(status.as_u16())
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PreflightReport {
    pub free_gb: f64,
    pub reachable: Vec<String>,
    pub unreachable: Vec<(String, String)>,
    /// `None` when no LLM service is configured.
    pub llm_reachable: Option<bool>,
}

/// Run all checks against `config`.
pub async fn run_preflight(
    config: &RunnerConfig,
    probe: &impl HealthProbe,
) -> Result<PreflightReport, RunnerError> {
    let mut report = PreflightReport {
        free_gb: check_disk(&config.paths.base(), config.min_free_disk_gb)?,
        ..Default::default()
    };

    for endpoint in &config.services.required {
        match probe.probe(endpoint).await {
            Ok(status) => {
                info!(service = %endpoint.name, status, "service reachable");
                report.reachable.push(endpoint.name.clone());
            }
            Err(why) => {
                warn!(service = %endpoint.name, url = %endpoint.url, "service unreachable: {why}");
                report.unreachable.push((endpoint.name.clone(), why));
            }
        }
    }
    if !config.services.required.is_empty() && report.reachable.is_empty() {
        let names: Vec<&str> = report.unreachable.iter().map(|(n, _)| n.as_str()).collect();
        return Err(RunnerError::Preflight(format!(
            "all required services unreachable: {}",
            names.join(", ")
        )));
    }

    if let Some(llm) = &config.services.llm {
        let ok = match probe.probe(llm).await {
            Ok(_) => true,
            Err(why) => {
                warn!(service = %llm.name, "optional LLM service unreachable, LLM stages may fail: {why}");
                false
            }
        };
        report.llm_reachable = Some(ok);
    }

    info!(
        free_gb = report.free_gb,
        reachable = report.reachable.len(),
        unreachable = report.unreachable.len(),
        "preflight passed"
    );
    Ok(report)
}

/// Free space (GB) on the filesystem holding `path`; fatal below `min_gb`.
pub fn check_disk(path: &Path, min_gb: f64) -> Result<f64, RunnerError> {
    if !path.exists() {
        std::fs::create_dir_all(path)?;
    }
    let bytes = fs2::available_space(path)?;
    let free_gb = bytes as f64 / BYTES_PER_GB;
    if free_gb < min_gb {
        return Err(RunnerError::Preflight(format!(
            "only {free_gb:.1} GB free at {}, need {min_gb:.1} GB",
            path.display()
        )));
    }
    Ok(free_gb)
}
