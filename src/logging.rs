//! Tracing setup: an operator stream on stderr plus, for batch runs, the
//! aggregate run log under the logs directory.
//!
//! Filter priority for stderr, highest first: `DISCOVERY_LOG`, `RUST_LOG`,
//! then `--verbose` / `--quiet`. The run log always records `info` and above
//! so failed-step log tails are never filtered out of it.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;

/// Verbosity chosen on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verbosity {
    Quiet,
    Normal,
    Verbose,
}

impl Verbosity {
    /// `--verbose` wins when both flags are given.
    pub fn from_flags(verbose: bool, quiet: bool) -> Self {
        if verbose {
            Self::Verbose
        } else if quiet {
            Self::Quiet
        } else {
            Self::Normal
        }
    }

    fn default_directive(self) -> &'static str {
        match self {
            Self::Quiet => "error",
            Self::Normal => "warn",
            Self::Verbose => "debug",
        }
    }
}

/// Pick the stderr filter directives. Unparseable env values fall through.
pub fn filter_directives(verbosity: Verbosity, lookup: impl Fn(&str) -> Option<String>) -> String {
    for var in ["DISCOVERY_LOG", "RUST_LOG"] {
        if let Some(directives) = lookup(var) {
            if !directives.trim().is_empty() && EnvFilter::try_new(&directives).is_ok() {
                return directives;
            }
        }
    }
    verbosity.default_directive().to_string()
}

/// `<logs>/batch_<YYYYmmdd_HHMMSS>.log`
pub fn batch_log_path(logs_root: &Path, now: DateTime<Local>) -> PathBuf {
    logs_root.join(format!("batch_{}.log", now.format("%Y%m%d_%H%M%S")))
}

/// Install the global subscriber. Call once, after configuration is loaded.
pub fn init(verbosity: Verbosity, run_log: Option<&Path>) -> Result<()> {
    let directives = filter_directives(verbosity, |key| std::env::var(key).ok());
    let stderr_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .without_time()
        .compact()
        .with_filter(EnvFilter::new(directives));

    let file_layer = match run_log {
        Some(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create {}", parent.display()))?;
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("failed to open run log {}", path.display()))?;
            Some(
                fmt::layer()
                    .with_writer(Mutex::new(file))
                    .with_ansi(false)
                    .with_target(false)
                    .with_filter(EnvFilter::new("info")),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(file_layer)
        .try_init()
        .context("tracing subscriber already installed")
}
