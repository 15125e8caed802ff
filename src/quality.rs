//! Quality Evaluator: inspects a round's decision cards and shortlist.
//!
//! Never fails. If the artifacts cannot be read the report is a conservative
//! `quality_passed = false, trigger_stage2 = true` with the reason attached.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use crate::state_machine::Route;
use crate::topn::TopNStage;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QualityReport {
    pub route: Route,
    pub stage: TopNStage,
    pub shortlist_rows: usize,
    pub shortlist_go_count: usize,
    pub pass_shortlist_rows: bool,
    pub pass_go_threshold: bool,
    pub quality_passed: bool,
    /// Only ever true when `quality_passed` is false.
    pub trigger_stage2: bool,
    pub reasons: Vec<String>,
}

impl QualityReport {
    /// Build a report from counted artifacts.
    ///
    /// Only a stage1 miss can ask for expansion; stage2 is the last round.
    pub fn for_counts(
        route: Route,
        stage: TopNStage,
        shortlist_rows: usize,
        go_count: usize,
        topk: usize,
        min_go: usize,
    ) -> Self {
        let pass_shortlist_rows = shortlist_rows >= topk;
        let pass_go_threshold = go_count >= min_go;
        let quality_passed = pass_shortlist_rows && pass_go_threshold;

        let mut reasons = Vec::new();
        if !pass_shortlist_rows {
            reasons.push(format!("shortlist_rows {shortlist_rows} < topk {topk}"));
        }
        if !pass_go_threshold {
            reasons.push(format!("go_count {go_count} < min_go {min_go}"));
        }
        if quality_passed {
            reasons.push("quality_passed".to_string());
        }

        Self {
            route,
            stage,
            shortlist_rows,
            shortlist_go_count: go_count,
            pass_shortlist_rows,
            pass_go_threshold,
            quality_passed,
            trigger_stage2: !quality_passed && stage == TopNStage::Stage1,
            reasons,
        }
    }

    /// Conservative report used when the artifacts could not be parsed.
    pub fn unreadable(route: Route, stage: TopNStage, reason: impl Into<String>) -> Self {
        Self {
            route,
            stage,
            shortlist_rows: 0,
            shortlist_go_count: 0,
            pass_shortlist_rows: false,
            pass_go_threshold: false,
            quality_passed: false,
            trigger_stage2: true,
            reasons: vec![format!("evaluation_failed: {}", reason.into())],
        }
    }

    /// Write `quality_<stage>.json` into `dir`.
    pub fn write(&self, dir: &Path) -> std::io::Result<PathBuf> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(format!("quality_{}.json", self.stage));
        let json = serde_json::to_string_pretty(self).map_err(std::io::Error::other)?;
        std::fs::write(&path, json)?;
        Ok(path)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct QualityEvaluator {
    pub topk: usize,
    pub min_go: usize,
}

impl QualityEvaluator {
    pub fn new(topk: usize, min_go: usize) -> Self {
        Self { topk, min_go }
    }

    pub fn evaluate(
        &self,
        route: Route,
        stage: TopNStage,
        decision_cards: &Path,
        shortlist: &Path,
    ) -> QualityReport {
        let counts = count_shortlist_rows(shortlist)
            .and_then(|rows| count_go_decisions(decision_cards).map(|go| (rows, go)));
        let report = match counts {
            Ok((rows, go)) => QualityReport::for_counts(route, stage, rows, go, self.topk, self.min_go),
            Err(why) => {
                warn!(%route, %stage, "quality evaluation failed: {why}");
                QualityReport::unreadable(route, stage, why)
            }
        };
        info!(
            %route,
            %stage,
            rows = report.shortlist_rows,
            go = report.shortlist_go_count,
            passed = report.quality_passed,
            trigger_stage2 = report.trigger_stage2,
            "quality evaluated"
        );
        report
    }
}

/// Data rows in a shortlist CSV (header excluded).
pub fn count_shortlist_rows(path: &Path) -> Result<usize, String> {
    let contents = std::fs::read_to_string(path)
        .map_err(|e| format!("cannot read {}: {e}", path.display()))?;
    let lines = contents.lines().filter(|l| !l.trim().is_empty()).count();
    Ok(lines.saturating_sub(1))
}

/// Candidate names from the first column of a shortlist CSV.
pub fn shortlist_candidates(path: &Path) -> Result<Vec<String>, String> {
    let contents = std::fs::read_to_string(path)
        .map_err(|e| format!("cannot read {}: {e}", path.display()))?;
    Ok(contents
        .lines()
        .filter(|l| !l.trim().is_empty())
        .skip(1)
        .filter_map(|l| l.split(',').next())
        .map(|name| name.trim().trim_matches('"').to_string())
        .filter(|name| !name.is_empty())
        .collect())
}

/// Count GO-equivalent decisions in a decision cards file.
///
/// Accepts a top-level array or an object with a `cards` array. The verdict
/// is read from `decision`, `gate` or `verdict`.
pub fn count_go_decisions(path: &Path) -> Result<usize, String> {
    let contents = std::fs::read_to_string(path)
        .map_err(|e| format!("cannot read {}: {e}", path.display()))?;
    let value: Value = serde_json::from_str(&contents)
        .map_err(|e| format!("invalid JSON in {}: {e}", path.display()))?;
    let cards = match &value {
        Value::Array(cards) => cards,
        Value::Object(map) => match map.get("cards") {
            Some(Value::Array(cards)) => cards,
            _ => return Err(format!("{} has no cards array", path.display())),
        },
        _ => return Err(format!("{} is not a card list", path.display())),
    };
    Ok(cards
        .iter()
        .filter_map(|card| {
            ["decision", "gate", "verdict"]
                .iter()
                .find_map(|key| card.get(key).and_then(Value::as_str))
        })
        .filter(|verdict| is_go(verdict))
        .count())
}

fn is_go(verdict: &str) -> bool {
    let normalized = verdict.trim().to_ascii_uppercase().replace(['-', ' '], "_");
    normalized == "GO" || normalized.starts_with("GO_") || normalized == "CONDITIONAL_GO"
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, body).unwrap();
        path
    }

    #[test]
    fn low_go_count_triggers_stage2() {
        let report = QualityReport::for_counts(Route::Cross, TopNStage::Stage1, 8, 1, 5, 3);
        assert!(report.pass_shortlist_rows);
        assert!(!report.pass_go_threshold);
        assert!(!report.quality_passed);
        assert!(report.trigger_stage2);
        assert_eq!(report.reasons, vec!["go_count 1 < min_go 3"]);
    }

    #[test]
    fn passing_report_never_triggers() {
        let report = QualityReport::for_counts(Route::Origin, TopNStage::Stage1, 5, 3, 5, 3);
        assert!(report.quality_passed);
        assert!(!report.trigger_stage2);
    }

    #[test]
    fn stage2_miss_does_not_trigger_again() {
        let report = QualityReport::for_counts(Route::Origin, TopNStage::Stage2, 2, 0, 5, 3);
        assert!(!report.quality_passed);
        assert!(!report.trigger_stage2);
        assert_eq!(report.reasons.len(), 2);
    }

    #[test]
    fn evaluates_artifacts_on_disk() {
        let tmp = TempDir::new().unwrap();
        let cards = write(
            tmp.path(),
            "decision_cards.json",
            r#"[{"candidate":"a","decision":"GO"},{"candidate":"b","decision":"NO-GO"},
               {"candidate":"c","decision":"conditional go"},{"candidate":"d","gate":"go-with-caveats"},
               {"candidate":"e","decision":"MAYBE"},{"candidate":"f"}]"#,
        );
        let shortlist = write(tmp.path(), "shortlist.csv", "drug,score\na,1\nb,2\nc,3\n\n");
        let report = QualityEvaluator::new(3, 3).evaluate(Route::Cross, TopNStage::Stage1, &cards, &shortlist);
        assert_eq!(report.shortlist_rows, 3);
        assert_eq!(report.shortlist_go_count, 3);
        assert!(report.quality_passed);
    }

    #[test]
    fn object_with_cards_array_is_accepted() {
        let tmp = TempDir::new().unwrap();
        let cards = write(tmp.path(), "cards.json", r#"{"cards":[{"verdict":"GO"}]}"#);
        assert_eq!(count_go_decisions(&cards).unwrap(), 1);
    }

    #[test]
    fn unreadable_artifacts_yield_conservative_report() {
        let tmp = TempDir::new().unwrap();
        let cards = write(tmp.path(), "decision_cards.json", "{not json");
        let shortlist = write(tmp.path(), "shortlist.csv", "drug\na\n");
        let report = QualityEvaluator::new(1, 0).evaluate(Route::Origin, TopNStage::Stage1, &cards, &shortlist);
        assert!(!report.quality_passed);
        assert!(report.trigger_stage2);
        assert!(report.reasons[0].starts_with("evaluation_failed"));

        let missing = tmp.path().join("absent.csv");
        let report = QualityEvaluator::new(1, 0).evaluate(Route::Origin, TopNStage::Stage2, &cards, &missing);
        assert!(report.trigger_stage2);
    }

    #[test]
    fn shortlist_candidates_reads_first_column() {
        let tmp = TempDir::new().unwrap();
        let shortlist = write(tmp.path(), "shortlist.csv", "drug,score\n\"metformin\",1\n aspirin ,2\n");
        assert_eq!(shortlist_candidates(&shortlist).unwrap(), vec!["metformin", "aspirin"]);
    }

    #[test]
    fn report_written_with_all_fields() {
        let tmp = TempDir::new().unwrap();
        let report = QualityReport::for_counts(Route::Cross, TopNStage::Stage1, 1, 1, 5, 3);
        let path = report.write(tmp.path()).unwrap();
        assert!(path.ends_with("quality_stage1.json"));
        let json: Value = serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap();
        for key in [
            "route",
            "stage",
            "shortlist_rows",
            "shortlist_go_count",
            "pass_shortlist_rows",
            "pass_go_threshold",
            "quality_passed",
            "trigger_stage2",
            "reasons",
        ] {
            assert!(json.get(key).is_some(), "missing {key}");
        }
    }
}
