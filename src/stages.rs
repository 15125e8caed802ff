//! External stage commands and the file-based contract they satisfy.
//!
//! A stage is invoked with an explicit working directory and argument list.
//! It either exits 0 having produced its declared outputs, or exits non-zero.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::config::RunMode;
use crate::executor::CommandSpec;

/// Every stage the orchestrator knows how to sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StageName {
    Reversal,
    RankCross,
    ScreenOrigin,
    RankOrigin,
    Evidence,
    Scoring,
    Packaging,
}

/// The evidence-extraction chain, run once per TopN round.
pub const EVIDENCE_CHAIN: [StageName; 3] =
    [StageName::Evidence, StageName::Scoring, StageName::Packaging];

impl StageName {
    pub fn as_str(self) -> &'static str {
        match self {
            StageName::Reversal => "reversal",
            StageName::RankCross => "rank_cross",
            StageName::ScreenOrigin => "screen_origin",
            StageName::RankOrigin => "rank_origin",
            StageName::Evidence => "evidence",
            StageName::Scoring => "scoring",
            StageName::Packaging => "packaging",
        }
    }

    /// Stage commands that must be configured for a run mode.
    pub fn required_for(mode: RunMode) -> Vec<StageName> {
        let mut stages = Vec::new();
        if mode.wants_cross() {
            stages.extend([StageName::Reversal, StageName::RankCross]);
        }
        if mode.wants_origin() {
            stages.extend([StageName::ScreenOrigin, StageName::RankOrigin]);
        }
        stages.extend(EVIDENCE_CHAIN);
        stages
    }
}

/// Placeholders recognised inside stage arguments and env values.
pub const PLACEHOLDERS: &[&str] = &[
    "job_key",
    "query",
    "work_dir",
    "route_dir",
    "stage_dir",
    "route_id",
    "config_ref",
    "topn",
    "signature",
];

/// A configured external stage.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct StageCommand {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Files the stage must leave in its output directory.
    #[serde(default)]
    pub outputs: Vec<String>,
    /// Overrides the global step deadline.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

/// One entry of the ordered signature provider list.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ProviderCommand {
    pub name: String,
    #[serde(flatten)]
    pub command: StageCommand,
}

/// Values substituted into `{placeholder}` tokens.
#[derive(Debug, Clone, Default)]
pub struct StageContext {
    values: BTreeMap<&'static str, String>,
}

impl StageContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: &'static str, value: impl Into<String>) -> Self {
        self.values.insert(key, value.into());
        self
    }

    pub fn with_path(self, key: &'static str, path: &Path) -> Self {
        self.with(key, path.to_string_lossy().into_owned())
    }

    pub fn set(&mut self, key: &'static str, value: impl Into<String>) {
        self.values.insert(key, value.into());
    }

    /// Single left-to-right pass: substituted values are never re-scanned.
    fn render(&self, template: &str) -> Result<String, String> {
        let mut rendered = String::with_capacity(template.len());
        let mut rest = template;
        while let Some(open) = rest.find('{') {
            rendered.push_str(&rest[..open]);
            let after = &rest[open + 1..];
            let key = after
                .find('}')
                .map(|close| &after[..close])
                .filter(|key| PLACEHOLDERS.contains(key));
            match key {
                Some(key) => {
                    let value = self
                        .values
                        .get(key)
                        .ok_or_else(|| format!("placeholder {{{key}}} has no value"))?;
                    rendered.push_str(value);
                    rest = &after[key.len() + 1..];
                }
                None => {
                    rendered.push('{');
                    rest = after;
                }
            }
        }
        rendered.push_str(rest);
        Ok(rendered)
    }
}

impl StageCommand {
    /// Deadline for this stage, falling back to the global default.
    pub fn deadline(&self, default_secs: u64) -> Duration {
        Duration::from_secs(self.timeout_secs.unwrap_or(default_secs).max(1))
    }

    /// Render placeholders into a runnable command rooted at `cwd`.
    pub fn to_spec(&self, ctx: &StageContext, cwd: &Path) -> Result<CommandSpec, String> {
        let args = self
            .args
            .iter()
            .map(|arg| ctx.render(arg))
            .collect::<Result<Vec<_>, _>>()?;
        let env = self
            .env
            .iter()
            .map(|(key, value)| Ok((key.clone(), ctx.render(value)?)))
            .collect::<Result<Vec<_>, String>>()?;
        Ok(CommandSpec {
            program: ctx.render(&self.program)?,
            args,
            cwd: cwd.to_path_buf(),
            env,
        })
    }

    /// Declared outputs that do not exist under `stage_dir`.
    pub fn missing_outputs(&self, stage_dir: &Path) -> Vec<String> {
        self.outputs
            .iter()
            .filter(|name| !stage_dir.join(name).exists())
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn command(args: &[&str]) -> StageCommand {
        StageCommand {
            program: "python".into(),
            args: args.iter().map(|s| s.to_string()).collect(),
            outputs: vec!["ranked.csv".into(), "manifest.json".into()],
            timeout_secs: None,
            env: BTreeMap::new(),
        }
    }

    #[test]
    fn required_stages_follow_run_mode() {
        let cross = StageName::required_for(RunMode::CrossOnly);
        assert!(cross.contains(&StageName::RankCross));
        assert!(!cross.contains(&StageName::RankOrigin));
        assert!(cross.contains(&StageName::Packaging));

        let dual = StageName::required_for(RunMode::Dual);
        assert_eq!(dual.len(), 7);
    }

    #[test]
    fn renders_placeholders() {
        let ctx = StageContext::new()
            .with("job_key", "ipf")
            .with("topn", "14")
            .with_path("stage_dir", Path::new("/w/ipf/run/cross/stage1"));
        let spec = command(&["--disease", "{job_key}", "--topn={topn}", "--out", "{stage_dir}"])
            .to_spec(&ctx, Path::new("/w"))
            .unwrap();
        assert_eq!(
            spec.args,
            vec!["--disease", "ipf", "--topn=14", "--out", "/w/ipf/run/cross/stage1"]
        );
        assert_eq!(spec.cwd, Path::new("/w"));
    }

    #[test]
    fn unresolved_placeholder_is_an_error() {
        let ctx = StageContext::new().with("job_key", "ipf");
        let err = command(&["--topn", "{topn}"])
            .to_spec(&ctx, Path::new("/w"))
            .unwrap_err();
        assert!(err.contains("{topn}"));
    }

    #[test]
    fn unknown_braces_pass_through() {
        let ctx = StageContext::new();
        let spec = command(&["--json={\"a\":1}"]).to_spec(&ctx, Path::new("/")).unwrap();
        assert_eq!(spec.args, vec!["--json={\"a\":1}"]);
    }

    #[test]
    fn substituted_values_are_not_expanded_again() {
        let ctx = StageContext::new()
            .with("query", "fibrosis {topn} {signature}")
            .with("topn", "14");
        let spec = command(&["--query", "{query}", "--topn={topn}"])
            .to_spec(&ctx, Path::new("/w"))
            .unwrap();
        assert_eq!(spec.args, vec!["--query", "fibrosis {topn} {signature}", "--topn=14"]);
    }

    #[test]
    fn deadline_prefers_stage_override() {
        let mut cmd = command(&[]);
        assert_eq!(cmd.deadline(60), Duration::from_secs(60));
        cmd.timeout_secs = Some(5);
        assert_eq!(cmd.deadline(60), Duration::from_secs(5));
    }

    #[test]
    fn missing_outputs_lists_absent_files() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("ranked.csv"), "name,score\n").unwrap();
        assert_eq!(command(&[]).missing_outputs(tmp.path()), vec!["manifest.json"]);
    }

    #[test]
    fn provider_command_flattens_stage_fields() {
        let provider: ProviderCommand = toml::from_str(
            r#"
            name = "dsmeta"
            program = "bash"
            args = ["run_dsmeta.sh", "{config_ref}"]
            outputs = ["signature.json"]
        "#,
        )
        .unwrap();
        assert_eq!(provider.name, "dsmeta");
        assert_eq!(provider.command.program, "bash");
        assert_eq!(provider.command.outputs, vec!["signature.json"]);
    }
}
