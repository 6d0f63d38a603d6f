//! Baseline-vs-latest regression classification.
//!
//! The baseline for a run is the run immediately preceding it in the same
//! tool's history. A change counts as a finding only when it clears both the
//! combined error bars of the two measurements and the configured alert
//! threshold; everything inside those bounds is noise.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::schema::{Measurement, Run};

/// Classification thresholds.
#[derive(Debug, Clone)]
pub struct DetectorConfig {
    /// Relative change a finding must exceed, on top of the noise bound,
    /// before it is flagged. 1.5 flags changes beyond a 2.5x slowdown.
    pub alert_threshold: f64,
    /// Floor applied to baseline values when forming ratios, so a zero
    /// baseline cannot poison the report with NaN.
    pub epsilon: f64,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            alert_threshold: 1.5,
            epsilon: 1e-9,
        }
    }
}

/// Verdict for one measurement name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    /// Slowdown beyond noise and threshold.
    Regression,
    /// Speedup beyond noise and threshold.
    Improvement,
    /// Within the combined error bars or below threshold. Not a finding.
    Noise,
    /// Present only in the new run. Informational.
    Added,
    /// Present only in the baseline. Informational.
    Removed,
}

/// Comparison result for one measurement name.
#[derive(Debug, Clone, Serialize)]
pub struct Finding {
    pub name: String,
    pub old_value: Option<f64>,
    pub new_value: Option<f64>,
    /// Relative change against the baseline; absent for added/removed names.
    pub change_pct: Option<f64>,
    pub classification: Classification,
}

/// Full comparison of a run against its baseline, ordered by measurement
/// name. Plain data: callers decide whether a regression fails the build.
#[derive(Debug, Clone, Serialize)]
pub struct RegressionReport {
    pub tool: String,
    pub commit_id: String,
    /// Commit the run was compared against; `None` for the first run of a
    /// tool, in which case `findings` is empty.
    pub baseline_commit: Option<String>,
    pub findings: Vec<Finding>,
}

impl RegressionReport {
    fn empty(tool: &str, commit_id: &str) -> Self {
        Self {
            tool: tool.to_string(),
            commit_id: commit_id.to_string(),
            baseline_commit: None,
            findings: Vec::new(),
        }
    }

    /// True when at least one finding classifies as a regression.
    pub fn has_regressions(&self) -> bool {
        self.regressions().next().is_some()
    }

    /// The regression findings only.
    pub fn regressions(&self) -> impl Iterator<Item = &Finding> {
        self.findings
            .iter()
            .filter(|f| f.classification == Classification::Regression)
    }
}

/// Compares runs against their history baseline.
#[derive(Debug, Clone, Default)]
pub struct Detector {
    config: DetectorConfig,
}

impl Detector {
    pub fn new(config: DetectorConfig) -> Self {
        Self { config }
    }

    /// Compare `run` against its baseline within `history` (runs ordered by
    /// date ascending, as the store returns them).
    pub fn evaluate(&self, tool: &str, history: &[Run], run: &Run) -> RegressionReport {
        let baseline = match baseline_for(history, run) {
            Some(b) => b,
            None => return RegressionReport::empty(tool, &run.commit.id),
        };

        // Union of measurement names from both sides, ordered by name.
        let mut by_name: BTreeMap<&str, (Option<&Measurement>, Option<&Measurement>)> =
            BTreeMap::new();
        for m in &baseline.benches {
            by_name.entry(m.name.as_str()).or_default().0 = Some(m);
        }
        for m in &run.benches {
            by_name.entry(m.name.as_str()).or_default().1 = Some(m);
        }

        let findings = by_name
            .into_iter()
            .filter_map(|(name, pair)| self.finding_for(name, pair))
            .collect();

        RegressionReport {
            tool: tool.to_string(),
            commit_id: run.commit.id.clone(),
            baseline_commit: Some(baseline.commit.id.clone()),
            findings,
        }
    }

    fn finding_for(
        &self,
        name: &str,
        pair: (Option<&Measurement>, Option<&Measurement>),
    ) -> Option<Finding> {
        let finding = match pair {
            (Some(old), Some(new)) => {
                let (change_pct, classification) = self.classify(old, new);
                Finding {
                    name: name.to_string(),
                    old_value: Some(old.value),
                    new_value: Some(new.value),
                    change_pct: Some(change_pct),
                    classification,
                }
            }
            (Some(old), None) => Finding {
                name: name.to_string(),
                old_value: Some(old.value),
                new_value: None,
                change_pct: None,
                classification: Classification::Removed,
            },
            (None, Some(new)) => Finding {
                name: name.to_string(),
                old_value: None,
                new_value: Some(new.value),
                change_pct: None,
                classification: Classification::Added,
            },
            (None, None) => return None,
        };
        Some(finding)
    }

    fn classify(&self, old: &Measurement, new: &Measurement) -> (f64, Classification) {
        let denom = old.value.max(self.config.epsilon);
        let change_pct = (new.value - old.value) / denom;

        // Combined relative noise of both measurements.
        let noise_bound =
            (new.range.bound().unwrap_or(0.0) + old.range.bound().unwrap_or(0.0)) / denom;
        let gate = noise_bound.max(self.config.alert_threshold);

        let classification = if change_pct > gate {
            Classification::Regression
        } else if change_pct < -gate {
            Classification::Improvement
        } else {
            Classification::Noise
        };
        (change_pct, classification)
    }
}

/// Locate the baseline: the run immediately preceding `run` in `history`.
///
/// When `run` is already appended it is found by commit id and the baseline
/// is its direct predecessor; otherwise the last run dated at or before it.
fn baseline_for<'a>(history: &'a [Run], run: &Run) -> Option<&'a Run> {
    if let Some(idx) = history.iter().position(|r| r.commit.id == run.commit.id) {
        return idx.checked_sub(1).map(|i| &history[i]);
    }
    let pos = history.partition_point(|r| r.date <= run.date);
    pos.checked_sub(1).map(|i| &history[i])
}
