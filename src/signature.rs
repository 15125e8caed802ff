//! Signature provider chain for the Cross route.
//!
//! Providers are tried in configured order until one produces a non-empty
//! `signature.json`. Every attempt lands in a single `signature_decision.json`
//! so a reviewer can see which providers were skipped and why.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::archive::GeneCounts;
use crate::executor::{ExitClassification, StepExecutor};
use crate::stages::{ProviderCommand, StageContext};

pub const SIGNATURE_FILE: &str = "signature.json";
pub const DECISION_FILE: &str = "signature_decision.json";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Signature {
    #[serde(default)]
    pub up_genes: Vec<String>,
    #[serde(default)]
    pub down_genes: Vec<String>,
}

impl Signature {
    pub fn read(path: &Path) -> Result<Self, String> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| format!("cannot read {}: {e}", path.display()))?;
        serde_json::from_str(&contents).map_err(|e| format!("invalid signature {}: {e}", path.display()))
    }

    pub fn counts(&self) -> GeneCounts {
        GeneCounts {
            up: self.up_genes.len(),
            down: self.down_genes.len(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Ok,
    Empty,
    Error,
}

impl fmt::Display for AttemptOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttemptOutcome::Ok => write!(f, "ok"),
            AttemptOutcome::Empty => write!(f, "empty"),
            AttemptOutcome::Error => write!(f, "error"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderAttempt {
    pub provider: String,
    pub outcome: AttemptOutcome,
    pub detail: String,
}

/// Audit record of one pass through the provider list.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureDecision {
    pub attempts: Vec<ProviderAttempt>,
    pub chosen: Option<String>,
}

impl SignatureDecision {
    pub fn write(&self, dir: &Path) -> std::io::Result<PathBuf> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(DECISION_FILE);
        let json = serde_json::to_string_pretty(self).map_err(std::io::Error::other)?;
        std::fs::write(&path, json)?;
        Ok(path)
    }

    /// One-line account of every attempt, for failure messages.
    pub fn summary(&self) -> String {
        if self.attempts.is_empty() {
            return "no signature providers configured".to_string();
        }
        self.attempts
            .iter()
            .map(|a| format!("{}={} ({})", a.provider, a.outcome, a.detail))
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// The winning provider and where its signature lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureChoice {
    pub provider: String,
    pub path: PathBuf,
    pub genes: GeneCounts,
}

/// Classify one finished attempt from its exit and the file it left behind.
pub fn classify_attempt(
    exit: ExitClassification,
    signature_path: &Path,
) -> (AttemptOutcome, String, Option<GeneCounts>) {
    if !exit.is_ok() {
        return (AttemptOutcome::Error, exit.to_string(), None);
    }
    if !signature_path.is_file() {
        return (AttemptOutcome::Empty, format!("{SIGNATURE_FILE} not produced"), None);
    }
    match Signature::read(signature_path) {
        Ok(signature) => {
            let genes = signature.counts();
            if genes.up + genes.down == 0 {
                (AttemptOutcome::Empty, "signature has no genes".to_string(), None)
            } else {
                (
                    AttemptOutcome::Ok,
                    format!("up={} down={}", genes.up, genes.down),
                    Some(genes),
                )
            }
        }
        Err(why) => (AttemptOutcome::Error, why, None),
    }
}

/// Result of walking the provider list.
#[derive(Debug, Clone)]
pub struct ChainResult {
    pub decision: SignatureDecision,
    pub choice: Option<SignatureChoice>,
    /// `(provider, elapsed)` for every provider actually launched.
    pub timings: Vec<(String, Duration)>,
}

/// Ordered list of signature providers.
pub struct SignatureChain<'a> {
    providers: &'a [ProviderCommand],
    default_deadline_secs: u64,
}

impl<'a> SignatureChain<'a> {
    pub fn new(providers: &'a [ProviderCommand], default_deadline_secs: u64) -> Self {
        Self {
            providers,
            default_deadline_secs,
        }
    }

    /// Try each provider under `<route_dir>/signature/<provider>/` until one
    /// succeeds. The decision record is written into `route_dir` either way.
    pub async fn resolve(
        &self,
        executor: &StepExecutor,
        ctx: &StageContext,
        route_dir: &Path,
        log_dir: &Path,
    ) -> std::io::Result<ChainResult> {
        let mut result = ChainResult {
            decision: SignatureDecision::default(),
            choice: None,
            timings: Vec::new(),
        };

        for provider in self.providers {
            let stage_dir = route_dir.join("signature").join(&provider.name);
            std::fs::create_dir_all(&stage_dir)?;
            let ctx = ctx.clone().with_path("stage_dir", &stage_dir);
            let label = format!("cross.signature.{}", provider.name);

            let (outcome, detail, genes) = match provider.command.to_spec(&ctx, &stage_dir) {
                Err(why) => (AttemptOutcome::Error, why, None),
                Ok(spec) => {
                    let invocation = executor
                        .run(
                            &label,
                            provider.command.deadline(self.default_deadline_secs),
                            &spec,
                            &log_dir.join(format!("{label}.log")),
                        )
                        .await?;
                    result.timings.push((provider.name.clone(), invocation.elapsed));
                    classify_attempt(invocation.outcome, &stage_dir.join(SIGNATURE_FILE))
                }
            };

            match outcome {
                AttemptOutcome::Ok => info!(provider = %provider.name, %detail, "signature provider chosen"),
                _ => warn!(provider = %provider.name, %outcome, %detail, "signature provider skipped"),
            }
            result.decision.attempts.push(ProviderAttempt {
                provider: provider.name.clone(),
                outcome,
                detail,
            });

            if let Some(genes) = genes {
                result.decision.chosen = Some(provider.name.clone());
                result.choice = Some(SignatureChoice {
                    provider: provider.name.clone(),
                    path: stage_dir.join(SIGNATURE_FILE),
                    genes,
                });
                break;
            }
        }

        result.decision.write(route_dir)?;
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stages::StageCommand;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn provider(name: &str, script: &str) -> ProviderCommand {
        ProviderCommand {
            name: name.into(),
            command: StageCommand {
                program: "sh".into(),
                args: vec!["-c".into(), script.into()],
                outputs: vec![SIGNATURE_FILE.into()],
                timeout_secs: Some(10),
                env: BTreeMap::new(),
            },
        }
    }

    fn executor() -> StepExecutor {
        StepExecutor::new(10, Duration::from_millis(200))
    }

    #[test]
    fn classification_covers_all_outcomes() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join(SIGNATURE_FILE);

        let (outcome, detail, _) = classify_attempt(ExitClassification::Failed { code: Some(3) }, &path);
        assert_eq!(outcome, AttemptOutcome::Error);
        assert!(detail.contains("exit code 3"));

        assert_eq!(classify_attempt(ExitClassification::Ok, &path).0, AttemptOutcome::Empty);

        std::fs::write(&path, r#"{"up_genes":[],"down_genes":[]}"#).unwrap();
        assert_eq!(classify_attempt(ExitClassification::Ok, &path).0, AttemptOutcome::Empty);

        std::fs::write(&path, r#"{"up_genes":["TGFB1","COL1A1"],"down_genes":["PPARG"]}"#).unwrap();
        let (outcome, _, genes) = classify_attempt(ExitClassification::Ok, &path);
        assert_eq!(outcome, AttemptOutcome::Ok);
        assert_eq!(genes, Some(GeneCounts { up: 2, down: 1 }));

        std::fs::write(&path, "not json").unwrap();
        assert_eq!(classify_attempt(ExitClassification::Ok, &path).0, AttemptOutcome::Error);
    }

    #[tokio::test]
    async fn first_ok_provider_wins_and_later_ones_never_run() {
        let tmp = TempDir::new().unwrap();
        let route_dir = tmp.path().join("cross");
        let providers = vec![
            provider("broken", "exit 4"),
            provider("silent", "true"),
            provider(
                "dsmeta",
                r#"echo '{"up_genes":["A","B"],"down_genes":["C"]}' > signature.json"#,
            ),
            provider("never", "touch ran && exit 1"),
        ];

        let result = SignatureChain::new(&providers, 60)
            .resolve(&executor(), &StageContext::new(), &route_dir, &tmp.path().join("logs"))
            .await
            .unwrap();

        let outcomes: Vec<AttemptOutcome> = result.decision.attempts.iter().map(|a| a.outcome).collect();
        assert_eq!(
            outcomes,
            vec![AttemptOutcome::Error, AttemptOutcome::Empty, AttemptOutcome::Ok]
        );
        let choice = result.choice.unwrap();
        assert_eq!(choice.provider, "dsmeta");
        assert_eq!(choice.genes, GeneCounts { up: 2, down: 1 });
        assert!(choice.path.ends_with("signature/dsmeta/signature.json"));
        assert!(!route_dir.join("signature/never/ran").exists());
        assert_eq!(result.timings.len(), 3);

        let written: SignatureDecision =
            serde_json::from_str(&std::fs::read_to_string(route_dir.join(DECISION_FILE)).unwrap()).unwrap();
        assert_eq!(written.chosen.as_deref(), Some("dsmeta"));
        assert_eq!(written.attempts.len(), 3);
    }

    #[tokio::test]
    async fn exhausted_chain_still_writes_decision() {
        let tmp = TempDir::new().unwrap();
        let route_dir = tmp.path().join("cross");
        let providers = vec![provider("a", "exit 1"), provider("b", "echo '{}' > signature.json")];

        let result = SignatureChain::new(&providers, 60)
            .resolve(&executor(), &StageContext::new(), &route_dir, &tmp.path().join("logs"))
            .await
            .unwrap();

        assert!(result.choice.is_none());
        assert!(result.decision.chosen.is_none());
        assert!(route_dir.join(DECISION_FILE).exists());
        let summary = result.decision.summary();
        assert!(summary.starts_with("a=error"));
        assert!(summary.contains("b=empty"));
    }

    #[tokio::test]
    async fn unrenderable_provider_is_an_error_attempt() {
        let tmp = TempDir::new().unwrap();
        let mut bad = provider("needs_ref", "true");
        bad.command.args.push("{config_ref}".into());

        let result = SignatureChain::new(std::slice::from_ref(&bad), 60)
            .resolve(&executor(), &StageContext::new(), tmp.path(), &tmp.path().join("logs"))
            .await
            .unwrap();
        assert_eq!(result.decision.attempts[0].outcome, AttemptOutcome::Error);
        assert!(result.decision.attempts[0].detail.contains("{config_ref}"));
        assert!(result.timings.is_empty());
    }
}
