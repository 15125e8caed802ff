//! Interface de terminal do lote: spinners e saída colorida.
//!
//! Usa `indicatif` para o spinner de cada job e `console` para as cores.
//! Com `--quiet` nada é desenhado; os logs continuam indo para o tracing.

use std::time::Duration;

use console::Style;
use indicatif::{ProgressBar, ProgressStyle};

use crate::batch::BatchReport;
use crate::orchestrator::{JobOutcome, JobReport, StepObserver};
use crate::preflight::PreflightReport;
use crate::retention::CleanupReport;
use crate::state_machine::{Job, Route, RouteStatus};
use crate::status::StatusReport;

/// Paleta usada em todas as mensagens.
#[derive(Clone)]
struct Palette {
    green: Style,
    red: Style,
    yellow: Style,
    dim: Style,
}

impl Palette {
    fn new() -> Self {
        Self {
            green: Style::new().green().bold(),
            red: Style::new().red().bold(),
            yellow: Style::new().yellow(),
            dim: Style::new().dim(),
        }
    }

    fn route_status(&self, status: RouteStatus) -> String {
        let style = match status {
            RouteStatus::Success => &self.green,
            RouteStatus::Failed => &self.red,
            RouteStatus::Skipped => &self.yellow,
            RouteStatus::NotRun => &self.dim,
        };
        style.apply_to(status.to_string()).to_string()
    }
}

/// Saída de terminal do processo.
pub struct Ui {
    quiet: bool,
    palette: Palette,
}

impl Ui {
    pub fn new(quiet: bool) -> Self {
        Self {
            quiet,
            palette: Palette::new(),
        }
    }

    /// Inicia o spinner de um job.
    pub fn job(&self, job: &Job) -> JobProgress {
        let pb = if self.quiet {
            ProgressBar::hidden()
        } else {
            let pb = ProgressBar::new_spinner();
            pb.set_style(
                ProgressStyle::default_spinner()
                    .template("{spinner:.cyan} {prefix:.bold} {msg}")
                    .unwrap_or_else(|_| ProgressStyle::default_spinner()),
            );
            pb.enable_steady_tick(Duration::from_millis(100));
            pb
        };
        pb.set_prefix(job.key.clone());
        pb.set_message(job.query.clone());
        JobProgress {
            pb,
            palette: self.palette.clone(),
            quiet: self.quiet,
        }
    }

    /// Informa que um job foi pulado sem ser executado.
    pub fn job_skipped(&self, job_key: &str, reason: &str) {
        if !self.quiet {
            println!("  {} {job_key}: {reason}", self.palette.yellow.apply_to("↷"));
        }
    }

    pub fn preflight(&self, report: &PreflightReport) {
        if self.quiet {
            return;
        }
        println!("  {} {:.1} GB free", self.palette.green.apply_to("✓"), report.free_gb);
        for name in &report.reachable {
            println!("  {} {name} reachable", self.palette.green.apply_to("✓"));
        }
        for (name, why) in &report.unreachable {
            println!("  {} {name} unreachable: {why}", self.palette.red.apply_to("✗"));
        }
        match report.llm_reachable {
            Some(true) => println!("  {} LLM service reachable", self.palette.green.apply_to("✓")),
            Some(false) => println!("  {} LLM service unreachable", self.palette.yellow.apply_to("!")),
            None => {}
        }
    }

    pub fn cleanup(&self, report: &CleanupReport) {
        if self.quiet {
            return;
        }
        if report.total() == 0 {
            println!("  {} nothing old enough to clean", self.palette.dim.apply_to("🧹"));
            return;
        }
        println!(
            "  {} removed {} work dirs, {} quarantine dirs, {} logs, {} cache files",
            self.palette.dim.apply_to("🧹"),
            report.work_dirs,
            report.quarantine_dirs,
            report.log_files,
            report.cache_files
        );
    }

    /// Resumo colorido do fim do lote.
    pub fn batch_summary(&self, report: &BatchReport) {
        if self.quiet {
            return;
        }
        println!();
        println!("{}", self.palette.dim.apply_to("─── Batch Summary ───"));
        println!(
            "  processed {}  {}  {}  skipped {}",
            report.processed,
            self.palette.green.apply_to(format!("succeeded {}", report.succeeded)),
            self.palette.red.apply_to(format!("failed {}", report.failed)),
            report.skipped
        );
        if !report.failed_keys.is_empty() {
            println!("  failed: {}", self.palette.red.apply_to(report.failed_keys.join(", ")));
        }
        if report.interrupted {
            println!("  {}", self.palette.yellow.apply_to("batch interrupted before the worklist finished"));
        }
    }

    pub fn status(&self, report: &StatusReport) {
        match &report.lock_holder {
            Some(holder) => println!(
                "  {} batch running (pid {}, since {})",
                self.palette.yellow.apply_to("●"),
                holder.pid,
                holder.acquired_at.format("%Y-%m-%d %H:%M:%S")
            ),
            None => println!("  {} no batch running", self.palette.dim.apply_to("○")),
        }
        if report.jobs.is_empty() {
            println!("  no archived or quarantined runs");
            return;
        }
        println!("  {:<32} {:>9} {:>12}", "job", "archived", "quarantined");
        for row in &report.jobs {
            println!(
                "  {:<32} {:>9} {:>12}",
                row.job_key,
                self.palette.green.apply_to(row.archived),
                self.palette.red.apply_to(row.quarantined)
            );
        }
    }
}

/// Indicador de progresso de um job em execução.
pub struct JobProgress {
    pb: ProgressBar,
    palette: Palette,
    quiet: bool,
}

impl JobProgress {
    /// Finaliza o spinner e mostra o resultado do job.
    pub fn finish(&self, report: &JobReport) {
        self.pb.finish_and_clear();
        if self.quiet {
            return;
        }
        let routes = report
            .routes
            .iter()
            .map(|(route, status)| format!("{route}={}", self.palette.route_status(*status)))
            .collect::<Vec<_>>()
            .join(" ");
        match &report.outcome {
            JobOutcome::Archived { .. } => println!(
                "  {} {} archived [{routes}]",
                self.palette.green.apply_to("✓"),
                report.job_key
            ),
            JobOutcome::Quarantined { failure, .. } => println!(
                "  {} {} quarantined at {} [{routes}]",
                self.palette.red.apply_to("✗"),
                report.job_key,
                failure.phase
            ),
        }
    }

    /// Finaliza o spinner quando o job não pôde nem ser registrado.
    pub fn abort(&self, job_key: &str, message: &str) {
        self.pb.finish_and_clear();
        if !self.quiet {
            println!("  {} {job_key}: {message}", self.palette.red.apply_to("✗"));
        }
    }
}

impl StepObserver for JobProgress {
    fn step_started(&self, label: &str) {
        self.pb.set_message(label.to_string());
    }

    fn route_finished(&self, route: Route, status: RouteStatus) {
        if !self.quiet {
            self.pb.println(format!(
                "    {} {route}: {}",
                self.palette.dim.apply_to("↳"),
                self.palette.route_status(status)
            ));
        }
    }
}
