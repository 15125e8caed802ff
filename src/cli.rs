//! Interface de linha de comando baseada em clap.
//!
//! Define a struct [`Cli`] com os subcomandos [`Command`] (run, preflight,
//! clean, status) e as flags globais (--config, --verbose, --quiet).

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Orquestrador em lote para pipelines de descoberta com duas rotas.
#[derive(Debug, Parser)]
#[command(name = "discovery-batch", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Arquivo de configuração TOML (padrão: ./discovery.toml).
    #[arg(long, short, global = true)]
    pub config: Option<PathBuf>,

    /// Habilita saída detalhada (debug).
    #[arg(long, short, global = true, default_value_t = false)]
    pub verbose: bool,

    /// Mostra apenas erros e esconde os spinners.
    #[arg(long, short, global = true, default_value_t = false)]
    pub quiet: bool,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Processa a worklist inteira, um job por vez.
    Run {
        /// Arquivo de worklist (`job_key|query|route_ids|config_ref`).
        worklist: PathBuf,

        /// Processa apenas os jobs indicados (pode repetir).
        #[arg(long = "only", value_name = "JOB_KEY")]
        only: Vec<String>,
    },

    /// Executa apenas as verificações de preflight.
    Preflight,

    /// Executa apenas a limpeza por idade.
    Clean,

    /// Mostra execuções arquivadas e em quarentena por job.
    Status,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_parses_run_subcommand() {
        let cli = Cli::parse_from(["discovery-batch", "run", "jobs.txt", "--only", "ipf", "--only", "af"]);
        match cli.command {
            Command::Run { worklist, only } => {
                assert_eq!(worklist, PathBuf::from("jobs.txt"));
                assert_eq!(only, vec!["ipf", "af"]);
            }
            _ => panic!("expected Run command"),
        }
    }

    #[test]
    fn cli_parses_global_flags() {
        let cli = Cli::parse_from([
            "discovery-batch",
            "status",
            "--config",
            "/etc/discovery.toml",
            "--quiet",
        ]);
        assert!(cli.quiet);
        assert!(!cli.verbose);
        assert_eq!(cli.config, Some(PathBuf::from("/etc/discovery.toml")));
        assert!(matches!(cli.command, Command::Status));
    }

    #[test]
    fn run_requires_a_worklist() {
        assert!(Cli::try_parse_from(["discovery-batch", "run"]).is_err());
    }

    #[test]
    fn cli_verify() {
        Cli::command().debug_assert();
    }
}
