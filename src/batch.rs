//! Batch driver: one cycle over a worklist.
//!
//! Order: lock, retention, preflight, worklist loop, release. Job failures
//! are counted, never propagated. SIGINT/SIGTERM are handled for as long as
//! the lock is held: they abandon whatever phase is in flight (a running
//! stage's process group dies with the dropped executor future) and the lock
//! is still released.

use std::future::Future;
use std::path::Path;

use tokio::signal::unix::{Signal, SignalKind, signal};
use tracing::{error, info, warn};

use crate::archive::ResultArchiver;
use crate::config::RunnerConfig;
use crate::error::RunnerError;
use crate::lock::RunLock;
use crate::orchestrator::JobRunner;
use crate::preflight::{HealthProbe, run_preflight};
use crate::retention::RetentionCleaner;
use crate::state_machine::Job;
use crate::ui::Ui;
use crate::worklist::Worklist;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub processed: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub failed_keys: Vec<String>,
    /// Worklist lines rejected as malformed.
    pub rejected_lines: usize,
    pub interrupted: bool,
}

pub struct BatchDriver<'a, P> {
    config: &'a RunnerConfig,
    probe: P,
    ui: &'a Ui,
}

impl<'a, P: HealthProbe> BatchDriver<'a, P> {
    pub fn new(config: &'a RunnerConfig, probe: P, ui: &'a Ui) -> Self {
        Self { config, probe, ui }
    }

    /// Run the batch, stopping early on SIGINT or SIGTERM.
    pub async fn run(&self, worklist: &Path, only: &[String]) -> Result<BatchReport, RunnerError> {
        self.run_until(worklist, only, shutdown_signal()).await
    }

    /// Run the batch, stopping early when `shutdown` resolves.
    ///
    /// `shutdown` is raced against everything done under the lock:
    /// retention, preflight and the job loop.
    pub async fn run_until(
        &self,
        worklist: &Path,
        only: &[String],
        shutdown: impl Future<Output = &'static str>,
    ) -> Result<BatchReport, RunnerError> {
        self.config
            .validate_stages()
            .map_err(|e| RunnerError::Config(format!("{e:#}")))?;

        let lock = RunLock::acquire(&self.config.paths.lock_root(), &self.config.lock_name)?;
        info!(lock = lock.name(), "batch lock acquired");

        let mut report = BatchReport::default();
        let outcome = tokio::select! {
            result = self.cycle(worklist, only, &mut report) => result.map(|()| None),
            name = shutdown => Ok(Some(name)),
        };
        lock.release();

        if let Some(name) = outcome? {
            warn!(signal = name, "batch interrupted, abandoning remaining work");
            report.interrupted = true;
        }
        info!(
            processed = report.processed,
            succeeded = report.succeeded,
            failed = report.failed,
            skipped = report.skipped,
            failed_jobs = ?report.failed_keys,
            "batch finished"
        );
        self.ui.batch_summary(&report);
        Ok(report)
    }

    /// Everything between acquiring and releasing the lock.
    async fn cycle(
        &self,
        worklist: &Path,
        only: &[String],
        report: &mut BatchReport,
    ) -> Result<(), RunnerError> {
        let cleanup = RetentionCleaner::new(&self.config.paths, &self.config.retention).run();
        self.ui.cleanup(&cleanup);

        let preflight = run_preflight(self.config, &self.probe).await?;
        self.ui.preflight(&preflight);

        let mut worklist = Worklist::read(worklist)?;
        worklist.retain_keys(only);
        for key in only {
            if !worklist.jobs.iter().any(|job| &job.key == key) {
                warn!(job = %key, "requested job is not in the worklist");
            }
        }

        report.rejected_lines = worklist.rejected.len();
        info!(jobs = worklist.jobs.len(), rejected = report.rejected_lines, "worklist loaded");
        self.process(&worklist.jobs, report).await;
        Ok(())
    }

    async fn process(&self, jobs: &[Job], report: &mut BatchReport) {
        let runner = JobRunner::new(self.config);
        let archiver = ResultArchiver::new(self.config.paths.results_root(), self.config.archive.clone());

        for job in jobs {
            if self.config.skip_completed && archiver.has_summary(&job.key) {
                info!(job = %job.key, "already archived, skipping");
                self.ui.job_skipped(&job.key, "already archived");
                report.skipped += 1;
                continue;
            }

            let progress = self.ui.job(job);
            report.processed += 1;
            match runner.run_job(job, &progress).await {
                Ok(job_report) => {
                    progress.finish(&job_report);
                    if job_report.succeeded() {
                        report.succeeded += 1;
                    } else {
                        report.failed += 1;
                        report.failed_keys.push(job.key.clone());
                    }
                }
                Err(e) => {
                    error!(job = %job.key, "job could not be recorded: {e}");
                    progress.abort(&job.key, &e.to_string());
                    report.failed += 1;
                    report.failed_keys.push(job.key.clone());
                }
            }
        }
    }
}

/// Resolves with the name of the first SIGINT or SIGTERM received.
///
/// The handlers are installed when this is called, not when the future is
/// first polled, so signals arriving in between are not lost to the default
/// disposition. Must be called from within the runtime.
pub fn shutdown_signal() -> impl Future<Output = &'static str> {
    let sigint = listen(SignalKind::interrupt(), "SIGINT");
    let sigterm = listen(SignalKind::terminate(), "SIGTERM");
    async move {
        tokio::select! {
            () = received(sigint) => "SIGINT",
            () = received(sigterm) => "SIGTERM",
        }
    }
}

fn listen(kind: SignalKind, name: &str) -> Option<Signal> {
    match signal(kind) {
        Ok(stream) => Some(stream),
        Err(e) => {
            warn!("cannot listen for {name}: {e}");
            None
        }
    }
}

async fn received(stream: Option<Signal>) {
    match stream {
        Some(mut stream) => {
            stream.recv().await;
        }
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RunMode, ServiceEndpoint};
    use crate::stages::StageCommand;
    use std::collections::BTreeMap;
    use std::path::PathBuf;
    use std::time::Duration;
    use tempfile::TempDir;

    enum Probe {
        Up,
        Down,
        /// Accepts the connection and never answers.
        Hang,
    }

    impl HealthProbe for Probe {
        async fn probe(&self, _endpoint: &ServiceEndpoint) -> Result<u16, String> {
            match self {
                Probe::Up => Ok(200),
                Probe::Down => Err("connection refused".into()),
                Probe::Hang => std::future::pending().await,
            }
        }
    }

    fn stage(script: &str, outputs: &[&str]) -> StageCommand {
        StageCommand {
            program: "sh".into(),
            args: vec!["-c".into(), script.into()],
            outputs: outputs.iter().map(|o| o.to_string()).collect(),
            timeout_secs: None,
            env: BTreeMap::new(),
        }
    }

    /// Origin-only pipeline; jobs whose key starts with `bad` fail at ranking.
    fn config(base: &Path) -> RunnerConfig {
        let mut config = RunnerConfig::default();
        config.run_mode = RunMode::OriginOnly;
        config.paths.base_dir = Some(base.to_path_buf());
        config.min_free_disk_gb = 0.0;
        config.step_timeout_secs = 30;
        config.kill_grace_secs = 1;
        let rank = "case {job_key} in bad*) exit 3;; esac; \
                    printf 'drug,score\\na,0.9\\nb,0.5\\nc,0.1\\n' > ranked.csv; \
                    echo '{\"source_mode\":\"ctgov\",\"step_errors\":[]}' > manifest.json";
        let packaging = "printf 'drug\\na\\nb\\nc\\nd\\ne\\n' > shortlist.csv; \
                         echo '[{\"decision\":\"GO\"},{\"decision\":\"GO\"}]' > decision_cards.json";
        for (name, command) in [
            ("screen_origin", stage("true", &[])),
            ("rank_origin", stage(rank, &["ranked.csv", "manifest.json"])),
            ("evidence", stage("true", &[])),
            ("scoring", stage("true", &[])),
            ("packaging", stage(packaging, &["shortlist.csv"])),
        ] {
            config.stages.insert(name.to_string(), command);
        }
        config
    }

    fn worklist(dir: &Path, lines: &str) -> PathBuf {
        let path = dir.join("worklist.txt");
        std::fs::write(&path, lines).unwrap();
        path
    }

    #[tokio::test]
    async fn processes_every_job_and_counts_outcomes() {
        let tmp = TempDir::new().unwrap();
        let config = config(tmp.path());
        let ui = Ui::new(true);
        let list = worklist(tmp.path(), "# jobs\nipf|fibrosis\nbad_job\nbroken|a|sideways=1\naf\n");

        let report = BatchDriver::new(&config, Probe::Up, &ui)
            .run_until(&list, &[], std::future::pending())
            .await
            .unwrap();

        assert_eq!(report.processed, 3);
        assert_eq!(report.succeeded, 2);
        assert_eq!(report.failed, 1);
        assert_eq!(report.failed_keys, vec!["bad_job"]);
        assert_eq!(report.rejected_lines, 1);
        assert!(!report.interrupted);
        assert!(!config.paths.lock_root().join("discovery-batch.lock").exists());
        assert!(config.paths.quarantine_root().join("bad_job").exists());
    }

    #[tokio::test]
    async fn skip_completed_and_only_filter() {
        let tmp = TempDir::new().unwrap();
        let mut config = config(tmp.path());
        config.skip_completed = true;
        let ui = Ui::new(true);
        let list = worklist(tmp.path(), "ipf\naf\n");
        let driver = BatchDriver::new(&config, Probe::Up, &ui);

        let first = driver
            .run_until(&list, &["ipf".to_string()], std::future::pending())
            .await
            .unwrap();
        assert_eq!((first.processed, first.succeeded, first.skipped), (1, 1, 0));

        let second = driver.run_until(&list, &[], std::future::pending()).await.unwrap();
        assert_eq!((second.processed, second.skipped), (1, 1));
    }

    #[tokio::test]
    async fn held_lock_stops_the_batch() {
        let tmp = TempDir::new().unwrap();
        let config = config(tmp.path());
        let ui = Ui::new(true);
        let list = worklist(tmp.path(), "ipf\n");
        let _held = RunLock::acquire(&config.paths.lock_root(), &config.lock_name).unwrap();

        let err = BatchDriver::new(&config, Probe::Up, &ui)
            .run_until(&list, &[], std::future::pending())
            .await
            .unwrap_err();
        assert_eq!(err.exit_code(), 2);
        assert!(!config.paths.work_root().join("ipf").exists());
    }

    #[tokio::test]
    async fn fatal_preflight_processes_nothing_and_releases_lock() {
        let tmp = TempDir::new().unwrap();
        let config = config(tmp.path());
        let ui = Ui::new(true);
        let list = worklist(tmp.path(), "ipf\n");

        let err = BatchDriver::new(&config, Probe::Down, &ui)
            .run_until(&list, &[], std::future::pending())
            .await
            .unwrap_err();
        assert_eq!(err.exit_code(), 1);
        assert!(!config.paths.work_root().join("ipf").exists());
        assert!(!config.paths.lock_root().join("discovery-batch.lock").exists());
    }

    #[tokio::test]
    async fn missing_stage_commands_are_a_config_error() {
        let tmp = TempDir::new().unwrap();
        let mut config = config(tmp.path());
        config.stages.remove("scoring");
        let ui = Ui::new(true);

        let err = BatchDriver::new(&config, Probe::Up, &ui)
            .run_until(&worklist(tmp.path(), "ipf\n"), &[], std::future::pending())
            .await
            .unwrap_err();
        assert!(matches!(err, RunnerError::Config(_)));
        assert_eq!(err.exit_code(), 3);
    }

    #[tokio::test]
    async fn shutdown_during_preflight_releases_lock() {
        let tmp = TempDir::new().unwrap();
        let config = config(tmp.path());
        let ui = Ui::new(true);
        let list = worklist(tmp.path(), "ipf\n");

        let report = BatchDriver::new(&config, Probe::Hang, &ui)
            .run_until(&list, &[], async {
                tokio::time::sleep(Duration::from_millis(200)).await;
                "SIGTERM"
            })
            .await
            .unwrap();

        assert!(report.interrupted);
        assert_eq!(report.processed, 0);
        assert!(!config.paths.lock_root().join("discovery-batch.lock").exists());
        assert!(!config.paths.work_root().join("ipf").exists());
    }

    #[tokio::test]
    async fn signal_handlers_are_installed_before_first_poll() {
        let shutdown = shutdown_signal();
        nix::sys::signal::raise(nix::sys::signal::Signal::SIGTERM).unwrap();
        let name = tokio::time::timeout(Duration::from_secs(5), shutdown).await.unwrap();
        assert_eq!(name, "SIGTERM");
    }

    #[tokio::test]
    async fn shutdown_abandons_in_flight_job_and_releases_lock() {
        let tmp = TempDir::new().unwrap();
        let mut config = config(tmp.path());
        let marker = tmp.path().join("child-survived");
        config.stages.insert(
            "evidence".into(),
            stage(&format!("sleep 2; touch {}", marker.display()), &[]),
        );
        let ui = Ui::new(true);
        let list = worklist(tmp.path(), "ipf\naf\n");

        let report = BatchDriver::new(&config, Probe::Up, &ui)
            .run_until(&list, &[], async {
                tokio::time::sleep(Duration::from_millis(500)).await;
                "SIGTERM"
            })
            .await
            .unwrap();

        assert!(report.interrupted);
        assert_eq!(report.processed, 1);
        assert_eq!(report.succeeded + report.failed, 0);
        assert!(!config.paths.lock_root().join("discovery-batch.lock").exists());

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(!marker.exists());
    }
}
