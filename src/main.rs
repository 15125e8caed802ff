mod archive;
mod batch;
mod cli;
mod config;
mod error;
mod executor;
mod lock;
mod logging;
mod manifest;
mod orchestrator;
mod preflight;
mod quality;
mod quarantine;
mod retention;
mod signature;
mod stages;
mod state_machine;
mod status;
mod topn;
mod ui;
mod worklist;

use std::process::ExitCode;
use std::time::Duration;

use anyhow::Result;
use chrono::Local;
use clap::Parser;
use tracing::warn;

use batch::BatchDriver;
use cli::{Cli, Command};
use config::RunnerConfig;
use error::RunnerError;
use lock::RunLock;
use logging::Verbosity;
use preflight::{HttpProbe, run_preflight};
use retention::RetentionCleaner;
use ui::Ui;

/// Conventional exit status after SIGINT.
const INTERRUPTED_EXIT: u8 = 130;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e:#}");
            let code = e.downcast_ref::<RunnerError>().map_or(3, RunnerError::exit_code);
            ExitCode::from(code)
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let config = RunnerConfig::load(cli.config.as_deref())
        .map_err(|e| RunnerError::Config(format!("{e:#}")))?;
    let verbosity = Verbosity::from_flags(cli.verbose, cli.quiet);
    let ui = Ui::new(cli.quiet);

    match cli.command {
        Command::Run { worklist, only } => {
            let run_log = logging::batch_log_path(&config.paths.logs_root(), Local::now());
            logging::init(verbosity, Some(&run_log))?;
            let probe = HttpProbe::new(Duration::from_secs(config.services.probe_timeout_secs))?;
            let report = BatchDriver::new(&config, probe, &ui).run(&worklist, &only).await?;
            if report.interrupted {
                return Ok(ExitCode::from(INTERRUPTED_EXIT));
            }
        }
        Command::Preflight => {
            logging::init(verbosity, None)?;
            let probe = HttpProbe::new(Duration::from_secs(config.services.probe_timeout_secs))?;
            let report = run_preflight(&config, &probe).await?;
            ui.preflight(&report);
        }
        Command::Clean => {
            logging::init(verbosity, None)?;
            // Handlers go in before the lock so a signal cannot leave it behind.
            let mut shutdown = std::pin::pin!(batch::shutdown_signal());
            let lock = RunLock::acquire(&config.paths.lock_root(), &config.lock_name)?;
            let report = RetentionCleaner::new(&config.paths, &config.retention).run();
            lock.release();
            ui.cleanup(&report);
            // Give the signal driver a moment to report anything that arrived
            // while cleanup held the thread.
            if let Ok(name) = tokio::time::timeout(Duration::from_millis(100), &mut shutdown).await {
                warn!(signal = name, "cleanup interrupted");
                return Ok(ExitCode::from(INTERRUPTED_EXIT));
            }
        }
        Command::Status => {
            logging::init(verbosity, None)?;
            ui.status(&status::collect(&config));
        }
    }
    Ok(ExitCode::SUCCESS)
}
