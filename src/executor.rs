//! Step Executor: runs one external stage under a deadline.
//!
//! The child is placed in its own process group. A deadline timer races the
//! child; whichever loses is cancelled. On expiry the whole group receives
//! SIGTERM, then SIGKILL after a grace period. The group is swept with SIGKILL
//! on every return path (including the future being dropped), so no
//! descendant outlives the call.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// A fully rendered external command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub env: Vec<(String, String)>,
}

impl CommandSpec {
    #[cfg(test)]
    pub fn new(program: impl Into<String>, args: &[&str], cwd: &Path) -> Self {
        Self {
            program: program.into(),
            args: args.iter().map(|a| a.to_string()).collect(),
            cwd: cwd.to_path_buf(),
            env: Vec::new(),
        }
    }

    fn display(&self) -> String {
        let mut line = self.program.clone();
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }
}

/// How a step ended. There is no fourth outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExitClassification {
    Ok,
    /// Non-zero exit. `code` is `None` when the child died from a signal
    /// or could not be spawned.
    Failed { code: Option<i32> },
    TimedOut,
}

impl ExitClassification {
    pub fn is_ok(&self) -> bool {
        matches!(self, ExitClassification::Ok)
    }
}

impl std::fmt::Display for ExitClassification {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExitClassification::Ok => write!(f, "ok"),
            ExitClassification::Failed { code: Some(code) } => write!(f, "failed (exit code {code})"),
            ExitClassification::Failed { code: None } => write!(f, "failed (no exit code)"),
            ExitClassification::TimedOut => write!(f, "timed out"),
        }
    }
}

/// Outcome of one executor call.
#[derive(Debug, Clone)]
pub struct StepInvocation {
    pub label: String,
    pub deadline: Duration,
    pub log_path: PathBuf,
    pub outcome: ExitClassification,
    pub elapsed: Duration,
}

/// Runs stages one at a time with deadline enforcement and log capture.
#[derive(Debug, Clone)]
pub struct StepExecutor {
    tail_lines: usize,
    kill_grace: Duration,
}

impl StepExecutor {
    pub fn new(tail_lines: usize, kill_grace: Duration) -> Self {
        Self {
            tail_lines,
            kill_grace,
        }
    }

    /// Run `spec` with stdout/stderr captured to `log_path`.
    ///
    /// Returns `Err` only when the log file itself cannot be created.
    pub async fn run(
        &self,
        label: &str,
        deadline: Duration,
        spec: &CommandSpec,
        log_path: &Path,
    ) -> std::io::Result<StepInvocation> {
        if let Some(parent) = log_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut log = File::create(log_path)?;
        writeln!(log, "# step: {label}")?;
        writeln!(log, "# command: {}", spec.display())?;
        writeln!(log, "# deadline: {}s", deadline.as_secs())?;

        info!(step = label, deadline_secs = deadline.as_secs(), "starting step");
        let started = Instant::now();
        let outcome = self.run_with_deadline(deadline, spec, &mut log).await?;
        let elapsed = started.elapsed();
        drop(log);

        match outcome {
            ExitClassification::Ok => {
                info!(step = label, elapsed_secs = elapsed.as_secs_f64(), "step finished");
            }
            _ => {
                warn!(
                    step = label,
                    elapsed_secs = elapsed.as_secs_f64(),
                    log = %log_path.display(),
                    "step {outcome}"
                );
                self.fold_tail(label, log_path);
            }
        }

        Ok(StepInvocation {
            label: label.to_string(),
            deadline,
            log_path: log_path.to_path_buf(),
            outcome,
            elapsed,
        })
    }

    async fn run_with_deadline(
        &self,
        deadline: Duration,
        spec: &CommandSpec,
        log: &mut File,
    ) -> std::io::Result<ExitClassification> {
        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .current_dir(&spec.cwd)
            .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::from(log.try_clone()?))
            .stderr(Stdio::from(log.try_clone()?))
            .process_group(0)
            .kill_on_drop(true);

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                writeln!(log, "failed to spawn {}: {e}", spec.program)?;
                return Ok(ExitClassification::Failed { code: None });
            }
        };

        let group = GroupGuard::new(child.id());

        match timeout(deadline, child.wait()).await {
            Ok(status) => {
                let status = status?;
                Ok(if status.success() {
                    ExitClassification::Ok
                } else {
                    ExitClassification::Failed {
                        code: status.code(),
                    }
                })
            }
            Err(_) => {
                writeln!(
                    log,
                    "# deadline of {}s exceeded, terminating process group",
                    deadline.as_secs()
                )?;
                group.signal(Signal::SIGTERM);
                if timeout(self.kill_grace, child.wait()).await.is_err() {
                    debug!("process group ignored SIGTERM, escalating to SIGKILL");
                    group.signal(Signal::SIGKILL);
                    let _ = child.wait().await;
                }
                Ok(ExitClassification::TimedOut)
            }
        }
    }

    /// Copy the last lines of a step log into the aggregate run log.
    fn fold_tail(&self, label: &str, log_path: &Path) {
        match tail_lines(log_path, self.tail_lines) {
            Ok(lines) => {
                warn!(step = label, "last {} log lines:", lines.len());
                for line in lines {
                    warn!(step = label, "  | {line}");
                }
            }
            Err(e) => warn!(step = label, "could not read step log: {e}"),
        }
    }
}

/// Last `n` lines of a text file, lossily decoded.
pub fn tail_lines(path: &Path, n: usize) -> std::io::Result<Vec<String>> {
    let bytes = fs::read(path)?;
    let text = String::from_utf8_lossy(&bytes);
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(n);
    Ok(lines[start..].iter().map(|l| l.to_string()).collect())
}

/// Owns the child's process group and kills it when dropped.
struct GroupGuard {
    pgid: Option<Pid>,
}

impl GroupGuard {
    fn new(pid: Option<u32>) -> Self {
        let pgid = pid
            .and_then(|p| i32::try_from(p).ok())
            .filter(|p| *p > 0)
            .map(Pid::from_raw);
        Self { pgid }
    }

    fn signal(&self, signal: Signal) {
        if let Some(pgid) = self.pgid {
            // ESRCH just means the group is already gone.
            let _ = killpg(pgid, signal);
        }
    }
}

impl Drop for GroupGuard {
    fn drop(&mut self) {
        self.signal(Signal::SIGKILL);
    }
}
