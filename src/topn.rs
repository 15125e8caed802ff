//! TopN Policy Engine.
//!
//! Decides how many ranked candidates go into evidence extraction, in at most
//! two rounds per route:
//!
//! ```text
//! NeedStage1 -> Stage1Resolved -> QualityPass ----------------------> Done
//!                              \-> QualityFailExpand -> Stage2Resolved -> Done
//! ```
//!
//! Every stage2 call produces a decision, including skips, and every decision
//! is written through [`TopNDecision::write`].

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::config::{ProfileBounds, TopNConfig, TopNSetting};
use crate::quality::QualityReport;
use crate::state_machine::Route;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TopNStage {
    Stage1,
    Stage2,
}

impl fmt::Display for TopNStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TopNStage::Stage1 => write!(f, "stage1"),
            TopNStage::Stage2 => write!(f, "stage2"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SizingMode {
    Normal,
    /// The ranked table could not be used; an expanded default was returned.
    Degraded,
}

/// Why stage2 did not expand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    Stage2Disabled,
    ManualTopnNoStage2,
    MaxExpandRoundsReached,
    QualityGatePassedNoExpand,
    NoAdditionalCandidates,
}

impl SkipReason {
    pub fn as_str(self) -> &'static str {
        match self {
            SkipReason::Stage2Disabled => "stage2_disabled",
            SkipReason::ManualTopnNoStage2 => "manual_topn_no_stage2",
            SkipReason::MaxExpandRoundsReached => "max_expand_rounds_reached",
            SkipReason::QualityGatePassedNoExpand => "quality_gate_passed_no_expand",
            SkipReason::NoAdditionalCandidates => "no_additional_candidates",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    Resolved {
        value: usize,
        mode: SizingMode,
        should_expand: bool,
        reason: String,
    },
    /// Stage2 did not expand; `carried` is the stage1 value kept in force.
    Skipped {
        reason: SkipReason,
        carried: usize,
        mode: SizingMode,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct TopNDecision {
    pub route: Route,
    pub stage: TopNStage,
    pub decision: Decision,
}

/// On-disk form of a decision. The only serialization path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionArtifact {
    pub route: Route,
    pub stage: TopNStage,
    pub mode: SizingMode,
    pub resolved_topn: usize,
    pub should_expand: bool,
    pub reason: String,
}

impl TopNDecision {
    pub fn resolved_topn(&self) -> usize {
        match &self.decision {
            Decision::Resolved { value, .. } => *value,
            Decision::Skipped { carried, .. } => *carried,
        }
    }

    pub fn mode(&self) -> SizingMode {
        match &self.decision {
            Decision::Resolved { mode, .. } | Decision::Skipped { mode, .. } => *mode,
        }
    }

    pub fn should_expand(&self) -> bool {
        matches!(
            self.decision,
            Decision::Resolved {
                should_expand: true,
                ..
            }
        )
    }

    pub fn reason(&self) -> String {
        match &self.decision {
            Decision::Resolved { reason, .. } => reason.clone(),
            Decision::Skipped { reason, .. } => reason.as_str().to_string(),
        }
    }

    pub fn artifact(&self) -> DecisionArtifact {
        DecisionArtifact {
            route: self.route,
            stage: self.stage,
            mode: self.mode(),
            resolved_topn: self.resolved_topn(),
            should_expand: self.should_expand(),
            reason: self.reason(),
        }
    }

    /// Write `topn_<stage>.json` into `dir`.
    pub fn write(&self, dir: &Path) -> std::io::Result<PathBuf> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(format!("topn_{}.json", self.stage));
        let json = serde_json::to_string_pretty(&self.artifact()).map_err(std::io::Error::other)?;
        std::fs::write(&path, json)?;
        Ok(path)
    }
}

/// A ranked candidate.
#[derive(Debug, Clone, PartialEq)]
pub struct RankedRow {
    pub name: String,
    pub score: f64,
}

/// The ranking bridge table, sorted by score, highest first.
#[derive(Debug, Clone, PartialEq)]
pub struct RankedTable {
    rows: Vec<RankedRow>,
}

const SCORE_COLUMNS: &[&str] = &["score", "final_score"];

impl RankedTable {
    pub fn read(path: &Path) -> Result<Self, String> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| format!("cannot read {}: {e}", path.display()))?;
        Self::parse(&contents)
    }

    /// Parse CSV with a header holding a `score` or `final_score` column.
    /// The first column is the candidate name.
    pub fn parse(contents: &str) -> Result<Self, String> {
        let mut lines = contents.lines().filter(|l| !l.trim().is_empty());
        let header = lines.next().ok_or("ranked table is empty")?;
        let columns = split_csv_line(header);
        let score_idx = columns
            .iter()
            .position(|c| SCORE_COLUMNS.iter().any(|s| c.trim().eq_ignore_ascii_case(s)))
            .ok_or("ranked table has no score column")?;

        let mut rows = Vec::new();
        for (idx, line) in lines.enumerate() {
            let fields = split_csv_line(line);
            let raw = fields
                .get(score_idx)
                .ok_or_else(|| format!("row {} has no score field", idx + 1))?;
            let score: f64 = raw
                .trim()
                .parse()
                .map_err(|_| format!("row {} has non-numeric score '{raw}'", idx + 1))?;
            if !score.is_finite() {
                return Err(format!("row {} has non-finite score", idx + 1));
            }
            rows.push(RankedRow {
                name: fields.first().cloned().unwrap_or_default(),
                score,
            });
        }
        Self::from_rows(rows)
    }

    pub fn from_rows(mut rows: Vec<RankedRow>) -> Result<Self, String> {
        if rows.is_empty() {
            return Err("ranked table has no rows".to_string());
        }
        rows.sort_by(|a, b| b.score.total_cmp(&a.score));
        Ok(Self { rows })
    }

    /// Never zero: `from_rows` rejects empty tables.
    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn top_score(&self) -> f64 {
        self.rows[0].score
    }

    #[cfg(test)]
    pub fn rows(&self) -> &[RankedRow] {
        &self.rows
    }

    /// Number of rows up to and including the knee of the score curve.
    ///
    /// Scores are normalised onto the unit square; the knee is the row
    /// furthest below the chord from the first to the last point.
    pub fn knee_count(&self) -> usize {
        let n = self.rows.len();
        if n < 3 {
            return n;
        }
        let max = self.rows[0].score;
        let min = self.rows[n - 1].score;
        let span = max - min;
        if span <= f64::EPSILON {
            return n;
        }
        let mut best = (0usize, f64::MIN);
        for (i, row) in self.rows.iter().enumerate() {
            let x = i as f64 / (n - 1) as f64;
            let y = (row.score - min) / span;
            let gap = (1.0 - x) - y;
            if gap > best.1 {
                best = (i, gap);
            }
        }
        best.0 + 1
    }

    /// Rows scoring at or above `threshold`.
    pub fn count_at_or_above(&self, threshold: f64) -> usize {
        self.rows.iter().filter(|r| r.score >= threshold).count()
    }
}

/// Split one CSV line, honouring double-quoted fields.
fn split_csv_line(line: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut field = String::new();
    let mut quoted = false;
    let mut chars = line.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '"' if quoted && chars.peek() == Some(&'"') => {
                field.push('"');
                chars.next();
            }
            '"' => quoted = !quoted,
            ',' if !quoted => fields.push(std::mem::take(&mut field)),
            _ => field.push(c),
        }
    }
    fields.push(field);
    fields
}

/// Static sizing policy, built once from configuration.
#[derive(Debug, Clone)]
pub struct TopNPolicy {
    pub setting: TopNSetting,
    pub bounds: ProfileBounds,
    pub stage2_enabled: bool,
    pub max_expand_rounds: u32,
    pub expand_ratio: f64,
}

impl TopNPolicy {
    pub fn from_config(config: &TopNConfig) -> Self {
        Self {
            setting: config.topn,
            bounds: config.bounds(),
            stage2_enabled: config.stage2_enabled,
            max_expand_rounds: config.max_expand_rounds,
            expand_ratio: config.expand_ratio,
        }
    }

    /// Stage1 sizing. Never fails: an unusable table yields degraded mode.
    pub fn resolve_stage1(&self, route: Route, table: Result<&RankedTable, &str>) -> TopNDecision {
        let decision = match (self.setting, table) {
            (TopNSetting::Fixed(n), _) => {
                let value = n.clamp(self.bounds.stage1_min, self.bounds.stage1_max);
                let reason = if value == n {
                    format!("manual_topn={n}")
                } else {
                    warn!(
                        %route,
                        requested = n,
                        used = value,
                        "manual topn outside [{}, {}], clamped",
                        self.bounds.stage1_min,
                        self.bounds.stage1_max
                    );
                    format!("manual_topn={n} clamped_to={value}")
                };
                Decision::Resolved {
                    value,
                    mode: SizingMode::Normal,
                    should_expand: false,
                    reason,
                }
            }
            (TopNSetting::Auto, Err(why)) => {
                warn!(%route, "stage1 sizing degraded: {why}");
                Decision::Resolved {
                    value: self.bounds.cap,
                    mode: SizingMode::Degraded,
                    should_expand: false,
                    reason: format!("degraded_default_cap: {why}"),
                }
            }
            (TopNSetting::Auto, Ok(table)) => {
                let knee = table.knee_count();
                let value = knee.clamp(self.bounds.stage1_min, self.bounds.stage1_max);
                Decision::Resolved {
                    value,
                    mode: SizingMode::Normal,
                    should_expand: false,
                    reason: format!(
                        "knee_at={knee} rows={} clamped_to=[{},{}]",
                        table.len(),
                        self.bounds.stage1_min,
                        self.bounds.stage1_max
                    ),
                }
            }
        };
        let decision = TopNDecision {
            route,
            stage: TopNStage::Stage1,
            decision,
        };
        info!(%route, topn = decision.resolved_topn(), reason = %decision.reason(), "stage1 topn resolved");
        decision
    }

    /// Stage2 sizing. Always returns a decision; skips carry the stage1 value.
    pub fn resolve_stage2(
        &self,
        stage1: &TopNDecision,
        quality: &QualityReport,
        rounds_used: u32,
        table: Result<&RankedTable, &str>,
    ) -> TopNDecision {
        let route = stage1.route;
        let previous = stage1.resolved_topn();
        let skip = |reason: SkipReason| Decision::Skipped {
            reason,
            carried: previous,
            mode: stage1.mode(),
        };

        // A passing stage1 is reported as such whatever else would block expansion.
        let decision = if quality.quality_passed || !quality.trigger_stage2 {
            skip(SkipReason::QualityGatePassedNoExpand)
        } else if !self.stage2_enabled {
            skip(SkipReason::Stage2Disabled)
        } else if matches!(self.setting, TopNSetting::Fixed(_)) {
            skip(SkipReason::ManualTopnNoStage2)
        } else if rounds_used >= self.max_expand_rounds {
            skip(SkipReason::MaxExpandRoundsReached)
        } else {
            match table {
                Err(why) => {
                    warn!(%route, "stage2 sizing degraded: {why}");
                    if self.bounds.cap > previous {
                        Decision::Resolved {
                            value: self.bounds.cap,
                            mode: SizingMode::Degraded,
                            should_expand: true,
                            reason: format!("degraded_expand_to_cap: {why}"),
                        }
                    } else {
                        skip(SkipReason::NoAdditionalCandidates)
                    }
                }
                Ok(table) => {
                    let top = table.top_score();
                    let threshold = if top > 0.0 { self.expand_ratio * top } else { top };
                    let admitted = table.count_at_or_above(threshold);
                    let value = admitted.max(previous).min(self.bounds.cap);
                    if value > previous {
                        Decision::Resolved {
                            value,
                            mode: SizingMode::Normal,
                            should_expand: true,
                            reason: format!(
                                "expand: {admitted} rows >= {:.4} ({} x top {:.4}), cap={}",
                                threshold, self.expand_ratio, top, self.bounds.cap
                            ),
                        }
                    } else {
                        skip(SkipReason::NoAdditionalCandidates)
                    }
                }
            }
        };

        let decision = TopNDecision {
            route,
            stage: TopNStage::Stage2,
            decision,
        };
        info!(
            %route,
            topn = decision.resolved_topn(),
            expand = decision.should_expand(),
            reason = %decision.reason(),
            "stage2 topn resolved"
        );
        decision
    }
}

/// Where a route is in the sizing state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizingState {
    NeedStage1,
    Stage1Resolved,
    QualityPass,
    QualityFailExpand,
    Stage2Resolved,
    Done,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("route {route}: sizing step not allowed in state {state:?}")]
pub struct SizingOrderError {
    pub route: Route,
    pub state: SizingState,
}

/// Per-route sizing tracker. Enforces one stage1 and at most one expansion.
#[derive(Debug, Clone)]
pub struct RouteSizing {
    route: Route,
    state: SizingState,
    rounds_used: u32,
    stage1: Option<TopNDecision>,
    stage2: Option<TopNDecision>,
}

impl RouteSizing {
    pub fn new(route: Route) -> Self {
        Self {
            route,
            state: SizingState::NeedStage1,
            rounds_used: 0,
            stage1: None,
            stage2: None,
        }
    }

    pub fn state(&self) -> SizingState {
        self.state
    }

    pub fn rounds_used(&self) -> u32 {
        self.rounds_used
    }

    pub fn stage1(
        &mut self,
        policy: &TopNPolicy,
        table: Result<&RankedTable, &str>,
    ) -> Result<&TopNDecision, SizingOrderError> {
        self.expect(SizingState::NeedStage1)?;
        self.state = SizingState::Stage1Resolved;
        Ok(self.stage1.insert(policy.resolve_stage1(self.route, table)))
    }

    /// Resolve stage2 from the stage1 quality report.
    pub fn stage2(
        &mut self,
        policy: &TopNPolicy,
        quality: &QualityReport,
        table: Result<&RankedTable, &str>,
    ) -> Result<&TopNDecision, SizingOrderError> {
        self.expect(SizingState::Stage1Resolved)?;
        let stage1 = self.stage1.as_ref().ok_or(SizingOrderError {
            route: self.route,
            state: self.state,
        })?;
        let decision = policy.resolve_stage2(stage1, quality, self.rounds_used, table);
        self.state = if decision.should_expand() {
            SizingState::QualityFailExpand
        } else {
            SizingState::QualityPass
        };
        Ok(self.stage2.insert(decision))
    }

    /// Mark the expansion re-run as started. Allowed once.
    pub fn begin_expansion(&mut self) -> Result<usize, SizingOrderError> {
        self.expect(SizingState::QualityFailExpand)?;
        self.rounds_used += 1;
        self.state = SizingState::Stage2Resolved;
        Ok(self.stage2.as_ref().map(|d| d.resolved_topn()).unwrap_or(0))
    }

    pub fn finish(&mut self) {
        self.state = SizingState::Done;
    }

    fn expect(&self, state: SizingState) -> Result<(), SizingOrderError> {
        if self.state == state {
            Ok(())
        } else {
            Err(SizingOrderError {
                route: self.route,
                state: self.state,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ProfileBounds, SizingProfile};
    use crate::quality::QualityReport;
    use tempfile::TempDir;

    fn policy(profile: SizingProfile) -> TopNPolicy {
        TopNPolicy {
            setting: TopNSetting::Auto,
            bounds: ProfileBounds::builtin(profile),
            stage2_enabled: true,
            max_expand_rounds: 1,
            expand_ratio: 0.5,
        }
    }

    fn table(scores: &[f64]) -> RankedTable {
        RankedTable::from_rows(
            scores
                .iter()
                .enumerate()
                .map(|(i, s)| RankedRow {
                    name: format!("cand{i}"),
                    score: *s,
                })
                .collect(),
        )
        .unwrap()
    }

    /// 40 rows: a steep head then a long tail.
    fn forty_rows() -> RankedTable {
        let scores: Vec<f64> = (0..40).map(|i| 1.0 / (1.0 + i as f64 * 0.5)).collect();
        table(&scores)
    }

    fn failing_quality(route: Route) -> QualityReport {
        QualityReport::for_counts(route, TopNStage::Stage1, 10, 1, 5, 3)
    }

    fn passing_quality(route: Route) -> QualityReport {
        QualityReport::for_counts(route, TopNStage::Stage1, 10, 5, 5, 3)
    }

    #[test]
    fn conservative_stage1_stays_in_bounds_for_forty_rows() {
        let p = policy(SizingProfile::Conservative);
        let t = forty_rows();
        let d = p.resolve_stage1(Route::Cross, Ok(&t));
        assert_eq!(d.mode(), SizingMode::Normal);
        assert!((12..=14).contains(&d.resolved_topn()), "got {}", d.resolved_topn());
    }

    #[test]
    fn stage1_always_within_profile_bounds() {
        let shapes: Vec<Vec<f64>> = vec![
            vec![5.0],
            vec![9.0, 1.0],
            vec![1.0; 100],
            (0..200).map(|i| 200.0 - i as f64).collect(),
            (0..60).map(|i| if i < 3 { 10.0 } else { 0.1 }).collect(),
            (0..80).map(|i| (-(i as f64) / 4.0).exp()).collect(),
        ];
        for profile in [
            SizingProfile::Conservative,
            SizingProfile::Balanced,
            SizingProfile::Exploratory,
        ] {
            let p = policy(profile);
            for scores in &shapes {
                let t = table(scores);
                let d = p.resolve_stage1(Route::Origin, Ok(&t));
                let v = d.resolved_topn();
                assert!(
                    p.bounds.stage1_min <= v && v <= p.bounds.stage1_max,
                    "{profile}: {v} outside bounds"
                );
            }
        }
    }

    #[test]
    fn unusable_table_degrades_to_cap() {
        let p = policy(SizingProfile::Balanced);
        let d = p.resolve_stage1(Route::Cross, Err("ranked table has no rows"));
        assert_eq!(d.mode(), SizingMode::Degraded);
        assert_eq!(d.resolved_topn(), 40);
        assert!(d.reason().contains("no rows"));
    }

    #[test]
    fn manual_topn_within_bounds_is_used_and_never_expands() {
        let mut p = policy(SizingProfile::Balanced);
        p.setting = TopNSetting::Fixed(20);
        let t = forty_rows();
        let s1 = p.resolve_stage1(Route::Cross, Ok(&t));
        assert_eq!(s1.resolved_topn(), 20);
        assert_eq!(s1.reason(), "manual_topn=20");
        let s2 = p.resolve_stage2(&s1, &failing_quality(Route::Cross), 0, Ok(&t));
        assert_eq!(s2.reason(), "manual_topn_no_stage2");
        assert!(!s2.should_expand());
        assert_eq!(s2.resolved_topn(), 20);
    }

    #[test]
    fn manual_topn_outside_bounds_is_clamped() {
        let mut p = policy(SizingProfile::Conservative);
        let t = forty_rows();

        p.setting = TopNSetting::Fixed(7);
        let low = p.resolve_stage1(Route::Cross, Ok(&t));
        assert_eq!(low.mode(), SizingMode::Normal);
        assert_eq!(low.resolved_topn(), 12);
        assert_eq!(low.reason(), "manual_topn=7 clamped_to=12");

        p.setting = TopNSetting::Fixed(50);
        let high = p.resolve_stage1(Route::Origin, Err("unreadable"));
        assert_eq!(high.resolved_topn(), 14);
    }

    #[test]
    fn passing_stage1_reports_quality_reason_even_when_expansion_is_blocked() {
        let t = forty_rows();
        let quality = passing_quality(Route::Cross);
        assert!(quality.quality_passed);

        let mut disabled = policy(SizingProfile::Conservative);
        disabled.stage2_enabled = false;
        let s1 = disabled.resolve_stage1(Route::Cross, Ok(&t));
        let s2 = disabled.resolve_stage2(&s1, &quality, 0, Ok(&t));
        assert_eq!(s2.reason(), "quality_gate_passed_no_expand");
        assert!(!s2.should_expand());

        let mut manual = policy(SizingProfile::Conservative);
        manual.setting = TopNSetting::Fixed(13);
        let s1 = manual.resolve_stage1(Route::Cross, Ok(&t));
        let s2 = manual.resolve_stage2(&s1, &quality, 0, Ok(&t));
        assert_eq!(s2.reason(), "quality_gate_passed_no_expand");

        let exhausted = policy(SizingProfile::Conservative);
        let s1 = exhausted.resolve_stage1(Route::Cross, Ok(&t));
        let s2 = exhausted.resolve_stage2(&s1, &quality, 1, Ok(&t));
        assert_eq!(s2.reason(), "quality_gate_passed_no_expand");
    }

    #[test]
    fn stage2_disabled_is_reported_even_when_triggered() {
        let mut p = policy(SizingProfile::Conservative);
        p.stage2_enabled = false;
        let t = forty_rows();
        let s1 = p.resolve_stage1(Route::Cross, Ok(&t));
        let quality = failing_quality(Route::Cross);
        assert!(quality.trigger_stage2);
        let s2 = p.resolve_stage2(&s1, &quality, 0, Ok(&t));
        assert_eq!(s2.reason(), "stage2_disabled");
        assert!(!s2.should_expand());
    }

    #[test]
    fn quality_pass_skips_expansion() {
        let p = policy(SizingProfile::Conservative);
        let t = forty_rows();
        let s1 = p.resolve_stage1(Route::Origin, Ok(&t));
        let s2 = p.resolve_stage2(&s1, &passing_quality(Route::Origin), 0, Ok(&t));
        assert_eq!(s2.reason(), "quality_gate_passed_no_expand");
        assert_eq!(s2.resolved_topn(), s1.resolved_topn());
    }

    #[test]
    fn rounds_budget_exhausted_skips() {
        let p = policy(SizingProfile::Conservative);
        let t = forty_rows();
        let s1 = p.resolve_stage1(Route::Origin, Ok(&t));
        let s2 = p.resolve_stage2(&s1, &failing_quality(Route::Origin), 1, Ok(&t));
        assert_eq!(s2.reason(), "max_expand_rounds_reached");
    }

    #[test]
    fn expansion_admits_rows_above_ratio_and_respects_cap() {
        let p = policy(SizingProfile::Conservative);
        // 30 rows at >= 0.5 x top; cap is 18.
        let scores: Vec<f64> = (0..40).map(|i| if i < 30 { 1.0 - i as f64 * 0.01 } else { 0.1 }).collect();
        let t = table(&scores);
        let s1 = p.resolve_stage1(Route::Cross, Ok(&t));
        let s2 = p.resolve_stage2(&s1, &failing_quality(Route::Cross), 0, Ok(&t));
        assert!(s2.should_expand());
        assert_eq!(s2.resolved_topn(), 18);
        assert!(s2.reason().starts_with("expand"));
    }

    #[test]
    fn expansion_without_new_rows_is_skipped() {
        let p = policy(SizingProfile::Conservative);
        // Only 2 rows at or above half the top score.
        let mut scores = vec![10.0, 9.0];
        scores.extend(std::iter::repeat_n(1.0, 38));
        let t = table(&scores);
        let s1 = p.resolve_stage1(Route::Cross, Ok(&t));
        let s2 = p.resolve_stage2(&s1, &failing_quality(Route::Cross), 0, Ok(&t));
        assert!(!s2.should_expand());
        assert_eq!(s2.reason(), "no_additional_candidates");
    }

    #[test]
    fn route_sizing_allows_one_expansion_only() {
        let p = policy(SizingProfile::Conservative);
        let scores: Vec<f64> = (0..40).map(|i| 1.0 - i as f64 * 0.01).collect();
        let t = table(&scores);
        let mut sizing = RouteSizing::new(Route::Cross);

        assert!(sizing.stage2(&p, &failing_quality(Route::Cross), Ok(&t)).is_err());
        sizing.stage1(&p, Ok(&t)).unwrap();
        assert!(sizing.stage1(&p, Ok(&t)).is_err());

        let expand = sizing
            .stage2(&p, &failing_quality(Route::Cross), Ok(&t))
            .unwrap()
            .should_expand();
        assert!(expand);
        assert_eq!(sizing.state(), SizingState::QualityFailExpand);
        assert_eq!(sizing.begin_expansion().unwrap(), 18);
        assert!(sizing.begin_expansion().is_err());
        assert!(sizing.stage2(&p, &failing_quality(Route::Cross), Ok(&t)).is_err());
        assert_eq!(sizing.rounds_used(), 1);
        sizing.finish();
        assert_eq!(sizing.state(), SizingState::Done);
    }

    #[test]
    fn skipped_decision_cannot_begin_expansion() {
        let p = policy(SizingProfile::Conservative);
        let t = forty_rows();
        let mut sizing = RouteSizing::new(Route::Origin);
        sizing.stage1(&p, Ok(&t)).unwrap();
        sizing
            .stage2(&p, &passing_quality(Route::Origin), Ok(&t))
            .unwrap();
        assert_eq!(sizing.state(), SizingState::QualityPass);
        assert!(sizing.begin_expansion().is_err());
    }

    #[test]
    fn parse_ranked_csv() {
        let csv = "drug,\"mechanism, notes\",final_score\n\
                   aspirin,\"COX, irreversible\",0.2\n\
                   metformin,AMPK,0.9\n\n";
        let t = RankedTable::parse(csv).unwrap();
        assert_eq!(t.len(), 2);
        assert_eq!(t.rows()[0].name, "metformin");
        assert_eq!(t.top_score(), 0.9);
    }

    #[test]
    fn parse_rejects_malformed_tables() {
        assert!(RankedTable::parse("").is_err());
        assert!(RankedTable::parse("drug,score\n").is_err());
        assert!(RankedTable::parse("drug,weight\na,1\n").is_err());
        assert!(RankedTable::parse("drug,score\na,high\n").is_err());
        assert!(RankedTable::parse("drug,score\na,NaN\n").is_err());
    }

    #[test]
    fn knee_of_flat_and_tiny_tables() {
        assert_eq!(table(&[3.0, 3.0, 3.0, 3.0]).knee_count(), 4);
        assert_eq!(table(&[1.0, 0.5]).knee_count(), 2);
        let steep = table(&[100.0, 99.0, 98.0, 2.0, 1.5, 1.0, 0.5, 0.0]);
        assert_eq!(steep.knee_count(), 4);
    }

    #[test]
    fn artifact_is_written_per_stage() {
        let tmp = TempDir::new().unwrap();
        let p = policy(SizingProfile::Conservative);
        let t = forty_rows();
        let s1 = p.resolve_stage1(Route::Cross, Ok(&t));
        let mut disabled = p.clone();
        disabled.stage2_enabled = false;
        let s2 = disabled.resolve_stage2(&s1, &failing_quality(Route::Cross), 0, Ok(&t));

        let path = s2.write(tmp.path()).unwrap();
        assert!(path.ends_with("topn_stage2.json"));
        let artifact: DecisionArtifact =
            serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap();
        assert_eq!(artifact.stage, TopNStage::Stage2);
        assert_eq!(artifact.reason, "stage2_disabled");
        assert!(!artifact.should_expand);
        assert_eq!(artifact.resolved_topn, s1.resolved_topn());

        let json: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(s1.write(tmp.path()).unwrap()).unwrap())
                .unwrap();
        assert_eq!(json["stage"], "stage1");
        assert_eq!(json["route"], "cross");
        assert_eq!(json["mode"], "normal");
    }
}
