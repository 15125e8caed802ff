use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::archive::{ArchiveRequest, ResultArchiver, RouteArtifacts};
use crate::config::{RunMode, RunnerConfig};
use crate::error::{PhaseFailure, RunnerError};
use crate::executor::StepExecutor;
use crate::manifest::ManifestGate;
use crate::quality::{QualityEvaluator, QualityReport};
use crate::quarantine::FailureRecorder;
use crate::signature::{SignatureChain, SignatureChoice};
use crate::stages::{EVIDENCE_CHAIN, StageContext, StageName};
use crate::state_machine::{Job, Route, RouteExecution, RouteStatus, Run, StepTimings};
use crate::topn::{RankedTable, RouteSizing, TopNPolicy, TopNStage};

const RANKED_FILE: &str = "ranked.csv";
const MANIFEST_FILE: &str = "manifest.json";
const CARDS_FILE: &str = "decision_cards.json";
const SHORTLIST_FILE: &str = "shortlist.csv";

/// Receives step-level progress. The default methods do nothing.
pub trait StepObserver {
    fn step_started(&self, _label: &str) {}
    fn route_finished(&self, _route: Route, _status: RouteStatus) {}
}

impl StepObserver for () {}

/// How a job ended.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Archived { summary: PathBuf },
    Quarantined { failure: PhaseFailure, record: PathBuf },
}

#[derive(Debug, Clone)]
pub struct JobReport {
    pub job_key: String,
    pub run_id: String,
    pub routes: Vec<(Route, RouteStatus)>,
    pub outcome: JobOutcome,
}

impl JobReport {
    pub fn succeeded(&self) -> bool {
        matches!(self.outcome, JobOutcome::Archived { .. })
    }

    #[cfg(test)]
    pub fn status(&self, route: Route) -> Option<RouteStatus> {
        self.routes.iter().find(|(r, _)| *r == route).map(|(_, s)| *s)
    }
}

/// Mutable state of one route while it runs.
struct RouteState {
    exec: RouteExecution,
    dir: PathBuf,
    rank_dir: PathBuf,
    final_dir: Option<PathBuf>,
    ctx: StageContext,
    completed: Vec<String>,
    signature: Option<SignatureChoice>,
}

impl RouteState {
    fn route(&self) -> Route {
        self.exec.route
    }

    fn artifacts(&self) -> RouteArtifacts {
        let final_dir = self.final_dir.clone();
        RouteArtifacts {
            route: self.route(),
            status: self.exec.status(),
            route_dir: self.dir.clone(),
            sources: final_dir.iter().cloned().chain([self.rank_dir.clone()]).collect(),
            shortlist: final_dir.map(|dir| dir.join(SHORTLIST_FILE)),
        }
    }
}

/// Sequences stages for one job at a time.
///
/// Cross runs before Origin and stages within a route run strictly in order.
/// A Cross failure never blocks Origin in dual mode; a failure of the
/// mandatory route quarantines the whole job.
pub struct JobRunner<'a> {
    config: &'a RunnerConfig,
    executor: StepExecutor,
    gate: ManifestGate,
    policy: TopNPolicy,
    recorder: FailureRecorder,
    archiver: ResultArchiver,
}

impl<'a> JobRunner<'a> {
    pub fn new(config: &'a RunnerConfig) -> Self {
        Self {
            config,
            executor: StepExecutor::new(
                config.log_tail_lines,
                Duration::from_secs(config.kill_grace_secs),
            ),
            gate: ManifestGate::new(config.manifest.noncritical_steps.clone()),
            policy: TopNPolicy::from_config(&config.topn),
            recorder: FailureRecorder::new(config.paths.quarantine_root()),
            archiver: ResultArchiver::new(config.paths.results_root(), config.archive.clone()),
        }
    }

    /// Process one job end to end: routes, then archive or quarantine.
    ///
    /// Only storage errors while recording the outcome are returned as `Err`.
    pub async fn run_job(
        &self,
        job: &Job,
        observer: &impl StepObserver,
    ) -> Result<JobReport, RunnerError> {
        let run = Run::start(job, &self.config.paths.work_root());
        std::fs::create_dir_all(&run.work_dir)?;
        let mode = self.config.run_mode;
        info!(job = %job.key, run = %run.run_id, %mode, "job started");

        let mut routes: Vec<RouteState> = Vec::new();

        if mode.wants_cross() {
            let mut state = self.route_state(job, &run, Route::Cross);
            match self.cross_config(job) {
                Ok(config_ref) => {
                    state.ctx.set("config_ref", config_ref.to_string_lossy().into_owned());
                    let result = self.run_cross(&mut state, observer).await;
                    self.settle(&mut state, result, RouteStatus::Failed);
                }
                Err(failure) => {
                    let fallback = if mode == RunMode::Dual {
                        RouteStatus::Skipped
                    } else {
                        RouteStatus::Failed
                    };
                    self.settle(&mut state, Err(failure), fallback);
                }
            }
            observer.route_finished(Route::Cross, state.exec.status());
            routes.push(state);
        }

        if mode.wants_origin() {
            let mut state = self.route_state(job, &run, Route::Origin);
            if let Some(config_ref) = &job.config_ref {
                state.ctx.set("config_ref", config_ref.to_string_lossy().into_owned());
            }
            let result = self.run_origin(&mut state, observer).await;
            self.settle(&mut state, result, RouteStatus::Failed);
            observer.route_finished(Route::Origin, state.exec.status());
            routes.push(state);
        }

        let mandatory = if mode.wants_origin() { Route::Origin } else { Route::Cross };
        let statuses: Vec<(Route, RouteStatus)> =
            routes.iter().map(|s| (s.route(), s.exec.status())).collect();
        let completed: Vec<String> = routes.iter().flat_map(|s| s.completed.clone()).collect();
        let mut timings = StepTimings::new();
        for state in &routes {
            timings.extend(&state.exec.timings);
        }
        let signature = routes.iter().find_map(|s| s.signature.clone());
        let signature_source = signature.as_ref().map(|s| s.provider.clone());

        let mandatory_failure = routes
            .iter()
            .find(|s| s.route() == mandatory && s.exec.status() != RouteStatus::Success)
            .map(|s| {
                s.exec.failure.clone().unwrap_or_else(|| {
                    PhaseFailure::new(format!("{mandatory}_route"), "route did not complete")
                })
            });

        let outcome = match mandatory_failure {
            Some(failure) => {
                let record =
                    self.recorder
                        .record(job, &run, &failure, completed, signature_source)?;
                JobOutcome::Quarantined { failure, record }
            }
            None => {
                let request = ArchiveRequest {
                    job,
                    run: &run,
                    routes: routes.iter().map(RouteState::artifacts).collect(),
                    route_identifiers: job.route_ids.clone(),
                    signature_source: signature_source.clone(),
                    gene_counts: signature.map(|s| s.genes),
                    step_timings: timings,
                };
                match self.archiver.archive(&request) {
                    Ok(summary) => JobOutcome::Archived { summary },
                    Err(e) => {
                        error!(job = %job.key, "archival failed: {e}");
                        let failure = PhaseFailure::new("archive", e.to_string());
                        let record =
                            self.recorder
                                .record(job, &run, &failure, completed, signature_source)?;
                        JobOutcome::Quarantined { failure, record }
                    }
                }
            }
        };

        info!(
            job = %job.key,
            run = %run.run_id,
            elapsed_secs = run.elapsed_secs(),
            archived = matches!(outcome, JobOutcome::Archived { .. }),
            "job finished"
        );
        Ok(JobReport {
            job_key: job.key.clone(),
            run_id: run.run_id.clone(),
            routes: statuses,
            outcome,
        })
    }

    fn route_state(&self, job: &Job, run: &Run, route: Route) -> RouteState {
        let dir = run.route_dir(route);
        let ctx = StageContext::new()
            .with("job_key", job.key.as_str())
            .with("query", job.query.as_str())
            .with_path("work_dir", &run.work_dir)
            .with_path("route_dir", &dir)
            .with("route_id", job.route_ids.get(route).unwrap_or_default())
            .with("config_ref", "");
        RouteState {
            exec: RouteExecution::new(route),
            rank_dir: dir.join("rank"),
            dir,
            final_dir: None,
            ctx,
            completed: Vec::new(),
            signature: None,
        }
    }

    /// The job's own config reference, else `<cross_config_dir>/<job_key>.yaml`.
    fn cross_config(&self, job: &Job) -> Result<PathBuf, PhaseFailure> {
        if let Some(path) = &job.config_ref {
            return if path.is_file() {
                Ok(path.clone())
            } else {
                Err(PhaseFailure::new(
                    "cross_no_config",
                    format!("config reference {} does not exist", path.display()),
                ))
            };
        }
        let fallback = self
            .config
            .paths
            .cross_config_root()
            .join(format!("{}.yaml", job.key));
        if fallback.is_file() {
            Ok(fallback)
        } else {
            Err(PhaseFailure::new(
                "cross_no_config",
                format!("no config reference and {} is missing", fallback.display()),
            ))
        }
    }

    fn settle(
        &self,
        state: &mut RouteState,
        result: Result<(), PhaseFailure>,
        on_error: RouteStatus,
    ) {
        let route = state.route();
        let transition = match result {
            Ok(()) => {
                info!(%route, "route succeeded");
                state.exec.succeed()
            }
            Err(failure) if on_error == RouteStatus::Skipped => {
                warn!(%route, phase = %failure.phase, "route skipped: {}", failure.message);
                state.exec.skip(failure)
            }
            Err(failure) => {
                error!(%route, phase = %failure.phase, "route failed: {}", failure.message);
                state.exec.fail(failure)
            }
        };
        if let Err(e) = transition {
            warn!(%route, "{e}");
        }
    }

    async fn run_cross(
        &self,
        state: &mut RouteState,
        observer: &impl StepObserver,
    ) -> Result<(), PhaseFailure> {
        let log_dir = self.log_dir(state);
        observer.step_started("cross.signature");
        let chain = SignatureChain::new(&self.config.signature_providers, self.config.step_timeout_secs)
            .resolve(&self.executor, &state.ctx, &state.dir, &log_dir)
            .await
            .map_err(|e| PhaseFailure::new("cross_signature", e.to_string()))?;
        for (provider, elapsed) in &chain.timings {
            state.exec.record_step(&format!("signature.{provider}"), *elapsed);
        }
        let Some(choice) = chain.choice else {
            return Err(PhaseFailure::new("cross_signature", chain.decision.summary()));
        };
        state.completed.push(format!("cross.signature.{}", choice.provider));
        state.ctx.set("signature", choice.path.to_string_lossy().into_owned());
        state.signature = Some(choice);

        let reversal_dir = state.dir.join("reversal");
        self.run_stage(state, StageName::Reversal, &reversal_dir, None, observer)
            .await?;
        let rank_dir = state.rank_dir.clone();
        self.run_stage(state, StageName::RankCross, &rank_dir, None, observer)
            .await?;
        self.size_and_extract(state, observer).await
    }

    async fn run_origin(
        &self,
        state: &mut RouteState,
        observer: &impl StepObserver,
    ) -> Result<(), PhaseFailure> {
        let screen_dir = state.dir.join("screen");
        self.run_stage(state, StageName::ScreenOrigin, &screen_dir, None, observer)
            .await?;
        let rank_dir = state.rank_dir.clone();
        self.run_stage(state, StageName::RankOrigin, &rank_dir, None, observer)
            .await?;
        self.size_and_extract(state, observer).await
    }

    /// Manifest gate, stage1 sizing, evidence chain, quality, stage2.
    async fn size_and_extract(
        &self,
        state: &mut RouteState,
        observer: &impl StepObserver,
    ) -> Result<(), PhaseFailure> {
        let route = state.route();
        let gate = self
            .gate
            .validate(&state.rank_dir.join(MANIFEST_FILE), route.expected_source_mode())
            .map_err(|v| PhaseFailure::new(format!("{route}_manifest"), v.to_string()))?;
        if !gate.tolerated.is_empty() {
            info!(%route, tolerated = ?gate.tolerated, "manifest passed with non-critical errors");
        }

        let table = RankedTable::read(&state.rank_dir.join(RANKED_FILE));
        let table_ref = table.as_ref().map_err(String::as_str);
        let mut sizing = RouteSizing::new(route);

        let stage1 = sizing
            .stage1(&self.policy, table_ref)
            .map_err(|e| topn_failure(route, e))?
            .clone();
        stage1.write(&state.dir).map_err(|e| topn_failure(route, e))?;

        let stage1_dir = state.dir.join(TopNStage::Stage1.to_string());
        self.run_evidence(state, TopNStage::Stage1, stage1.resolved_topn(), &stage1_dir, observer)
            .await?;
        let quality = self.evaluate(route, TopNStage::Stage1, &stage1_dir);
        quality.write(&state.dir).map_err(|e| topn_failure(route, e))?;
        state.final_dir = Some(stage1_dir);

        let stage2 = sizing
            .stage2(&self.policy, &quality, table_ref)
            .map_err(|e| topn_failure(route, e))?
            .clone();
        stage2.write(&state.dir).map_err(|e| topn_failure(route, e))?;

        if stage2.should_expand() {
            let topn = sizing.begin_expansion().map_err(|e| topn_failure(route, e))?;
            info!(%route, from = stage1.resolved_topn(), to = topn, "expanding evidence window");
            let stage2_dir = state.dir.join(TopNStage::Stage2.to_string());
            self.run_evidence(state, TopNStage::Stage2, topn, &stage2_dir, observer)
                .await?;
            let quality = self.evaluate(route, TopNStage::Stage2, &stage2_dir);
            quality.write(&state.dir).map_err(|e| topn_failure(route, e))?;
            state.final_dir = Some(stage2_dir);
        }
        sizing.finish();
        debug!(%route, rounds = sizing.rounds_used(), state = ?sizing.state(), "sizing finished");
        Ok(())
    }

    fn evaluate(&self, route: Route, stage: TopNStage, dir: &Path) -> QualityReport {
        QualityEvaluator::new(self.config.quality.topk, self.config.min_go_for(route)).evaluate(
            route,
            stage,
            &dir.join(CARDS_FILE),
            &dir.join(SHORTLIST_FILE),
        )
    }

    async fn run_evidence(
        &self,
        state: &mut RouteState,
        round: TopNStage,
        topn: usize,
        dir: &Path,
        observer: &impl StepObserver,
    ) -> Result<(), PhaseFailure> {
        state.ctx.set("topn", topn.to_string());
        for stage in EVIDENCE_CHAIN {
            self.run_stage(state, stage, dir, Some(round), observer).await?;
        }
        Ok(())
    }

    /// Run one configured stage with its output directory as working
    /// directory, then check its declared outputs.
    async fn run_stage(
        &self,
        state: &mut RouteState,
        stage: StageName,
        stage_dir: &Path,
        round: Option<TopNStage>,
        observer: &impl StepObserver,
    ) -> Result<(), PhaseFailure> {
        let route = state.route();
        let (step, phase) = match round {
            Some(round) => (
                format!("{}.{round}", stage.as_str()),
                format!("{route}_{}_{round}", stage.as_str()),
            ),
            None => (stage.as_str().to_string(), format!("{route}_{}", stage.as_str())),
        };
        let label = format!("{route}.{step}");

        let command = self
            .config
            .stages
            .get(stage.as_str())
            .ok_or_else(|| PhaseFailure::new(phase.clone(), "no command configured"))?;
        std::fs::create_dir_all(stage_dir).map_err(|e| PhaseFailure::new(phase.clone(), e.to_string()))?;
        let ctx = state.ctx.clone().with_path("stage_dir", stage_dir);
        let spec = command
            .to_spec(&ctx, stage_dir)
            .map_err(|why| PhaseFailure::new(phase.clone(), why))?;

        observer.step_started(&label);
        let log_path = self.log_dir(state).join(format!("{label}.log"));
        let invocation = self
            .executor
            .run(&label, command.deadline(self.config.step_timeout_secs), &spec, &log_path)
            .await
            .map_err(|e| PhaseFailure::new(phase.clone(), e.to_string()))?;
        state.exec.record_step(&step, invocation.elapsed);

        if !invocation.outcome.is_ok() {
            return Err(PhaseFailure::new(
                phase,
                format!("{} (log: {})", invocation.outcome, log_path.display()),
            ));
        }
        let missing = command.missing_outputs(stage_dir);
        if !missing.is_empty() {
            return Err(PhaseFailure::new(
                format!("{phase}_missing_output"),
                format!("exited 0 without {}", missing.join(", ")),
            ));
        }
        state.completed.push(label);
        Ok(())
    }

    fn log_dir(&self, state: &RouteState) -> PathBuf {
        state
            .dir
            .parent()
            .map(|work_dir| work_dir.join("logs"))
            .unwrap_or_else(|| state.dir.join("logs"))
    }
}

fn topn_failure(route: Route, e: impl std::fmt::Display) -> PhaseFailure {
    PhaseFailure::new(format!("{route}_topn"), e.to_string())
}
