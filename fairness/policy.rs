// --- Public Data Structures ---
// These structs define the public, human-readable format of a fitted policy when
// serialized to a TOML file.

use crate::data::{DataError, FitData};
use crate::estimate::FitConfig;
use crate::metrics::{DisparityReport, group_rates};
use crate::types::{Degeneracy, GroupCounts, TieRule};
use ndarray::{Array1, ArrayView1};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::{BufWriter, Write};
use thiserror::Error;

/// The decision rule of one group.
///
/// With probability `ignore_probability` the score is ignored and the decision is
/// Bernoulli(`constant_rate`). Otherwise `threshold_lo` applies with probability
/// `mix_probability` and `threshold_hi` with the remaining probability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupRule {
    pub group: String,
    pub threshold_lo: f64,
    pub threshold_hi: f64,
    pub mix_probability: f64,
    #[serde(default)]
    pub ignore_probability: f64,
    #[serde(default)]
    pub constant_rate: f64,
}

impl GroupRule {
    /// A deterministic single-threshold rule.
    pub fn threshold(group: &str, threshold: f64) -> Self {
        Self::mixture(group, threshold, threshold, 1.0)
    }

    /// Applies `threshold_lo` with probability `mix_probability`, else `threshold_hi`.
    pub fn mixture(group: &str, threshold_lo: f64, threshold_hi: f64, mix_probability: f64) -> Self {
        Self {
            group: group.to_string(),
            threshold_lo,
            threshold_hi,
            mix_probability,
            ignore_probability: 0.0,
            constant_rate: 0.0,
        }
    }

    pub fn blended(mut self, ignore_probability: f64, constant_rate: f64) -> Self {
        self.ignore_probability = ignore_probability;
        self.constant_rate = constant_rate;
        self
    }

    pub fn is_deterministic(&self) -> bool {
        self.threshold_lo == self.threshold_hi && self.ignore_probability == 0.0
    }

    fn validate(&self) -> Result<(), PolicyError> {
        let invalid = |reason: String| {
            Err(PolicyError::InvalidRule {
                group: self.group.clone(),
                reason,
            })
        };
        for (name, p) in [
            ("mix_probability", self.mix_probability),
            ("ignore_probability", self.ignore_probability),
            ("constant_rate", self.constant_rate),
        ] {
            if !(0.0..=1.0).contains(&p) {
                return invalid(format!("{name} = {p} is not a probability"));
            }
        }
        if self.threshold_lo.is_nan() || self.threshold_hi.is_nan() {
            return invalid("thresholds must not be NaN".to_string());
        }
        if self.threshold_lo > self.threshold_hi {
            return invalid(format!(
                "threshold_lo {} exceeds threshold_hi {}",
                self.threshold_lo, self.threshold_hi
            ));
        }
        Ok(())
    }

    /// One decision. Every call draws fresh outcomes from `rng`.
    pub fn decide<R: Rng + ?Sized>(&self, score: f64, tie_rule: TieRule, rng: &mut R) -> bool {
        if self.ignore_probability > 0.0 && rng.gen_bool(self.ignore_probability) {
            return rng.gen_bool(self.constant_rate);
        }
        if self.threshold_lo == self.threshold_hi {
            return tie_rule.accepts(score, self.threshold_lo);
        }
        let threshold = if rng.gen_bool(self.mix_probability) {
            self.threshold_lo
        } else {
            self.threshold_hi
        };
        tie_rule.accepts(score, threshold)
    }

    /// Exact probability that [`GroupRule::decide`] returns `true` for `score`.
    pub fn selection_probability(&self, score: f64, tie_rule: TieRule) -> f64 {
        let indicator = |threshold: f64| f64::from(u8::from(tie_rule.accepts(score, threshold)));
        let thresholded = if self.threshold_lo == self.threshold_hi {
            indicator(self.threshold_lo)
        } else {
            self.mix_probability * indicator(self.threshold_lo)
                + (1.0 - self.mix_probability) * indicator(self.threshold_hi)
        };
        self.ignore_probability * self.constant_rate
            + (1.0 - self.ignore_probability) * thresholded
    }
}

/// What the optimizer found for one group, measured on the fitting samples.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupSummary {
    pub counts: GroupCounts,
    pub base_rate: f64,
    pub expected_fpr: f64,
    pub expected_tpr: f64,
    pub expected_selection_rate: f64,
    pub hull_vertices: usize,
    /// Set when the group lacks positives or negatives.
    #[serde(default)]
    pub degeneracy: Option<Degeneracy>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FitSummary {
    pub objective_value: f64,
    /// Shared fpr (equalized odds) or shared rate (parity constraints) at the optimum.
    pub frontier_coordinate: f64,
    pub frontier_vertices: usize,
    pub groups: BTreeMap<String, GroupSummary>,
}

impl FitSummary {
    /// Groups flagged as degenerate, in sorted order.
    pub fn degenerate_groups(&self) -> Vec<(&str, Degeneracy)> {
        self.groups
            .iter()
            .filter_map(|(group, summary)| summary.degeneracy.map(|d| (group.as_str(), d)))
            .collect()
    }
}

/// A fitted post-processing policy: one rule per group seen during fitting.
///
/// The only ways to obtain a `Policy` are a successful fit and loading a saved one, so
/// an unfitted policy cannot be used for inference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Policy {
    config: FitConfig,
    summary: FitSummary,
    rules: BTreeMap<String, GroupRule>,
}

/// Custom error type for policy persistence and reporting.
#[derive(Error, Debug)]
pub enum PolicyError {
    #[error("Failed to read or write policy file: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse TOML policy file: {0}")]
    TomlParseError(#[from] toml::de::Error),
    #[error("Failed to serialize policy to TOML format: {0}")]
    TomlSerializeError(#[from] toml::ser::Error),
    #[error("The rule for group '{group}' is invalid: {reason}.")]
    InvalidRule { group: String, reason: String },
    #[error(transparent)]
    UnknownGroup(#[from] PredictError),
    #[error("Invalid evaluation data: {0}")]
    Data(#[from] DataError),
}

/// The only expected inference-time failure. It affects a single prediction.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PredictError {
    #[error("Group '{0}' was not present when the policy was fitted.")]
    UnknownGroup(String),
}

impl Policy {
    pub(crate) fn new(
        config: FitConfig,
        rules: BTreeMap<String, GroupRule>,
        summary: FitSummary,
    ) -> Self {
        Self {
            config,
            summary,
            rules,
        }
    }

    pub fn config(&self) -> &FitConfig {
        &self.config
    }

    pub fn summary(&self) -> &FitSummary {
        &self.summary
    }

    pub fn rules(&self) -> &BTreeMap<String, GroupRule> {
        &self.rules
    }

    pub fn rule(&self, group: &str) -> Option<&GroupRule> {
        self.rules.get(group)
    }

    fn lookup(&self, group: &str) -> Result<&GroupRule, PredictError> {
        self.rules
            .get(group)
            .ok_or_else(|| PredictError::UnknownGroup(group.to_string()))
    }

    /// Decides one sample. Randomized rules draw from `rng` on every call.
    pub fn predict<R: Rng + ?Sized>(
        &self,
        score: f64,
        group: &str,
        rng: &mut R,
    ) -> Result<bool, PredictError> {
        Ok(self.lookup(group)?.decide(score, self.config.tie_rule, rng))
    }

    /// Decides a batch in order. An unknown group fails only its own entry.
    pub fn predict_many<R: Rng + ?Sized, S: AsRef<str>>(
        &self,
        scores: ArrayView1<f64>,
        groups: &[S],
        rng: &mut R,
    ) -> Vec<Result<bool, PredictError>> {
        scores
            .iter()
            .zip(groups)
            .map(|(&score, group)| self.predict(score, group.as_ref(), rng))
            .collect()
    }

    pub fn selection_probability(&self, score: f64, group: &str) -> Result<f64, PredictError> {
        Ok(self
            .lookup(group)?
            .selection_probability(score, self.config.tie_rule))
    }

    /// Disparities the policy is expected to produce on `data`, computed from exact
    /// selection probabilities rather than sampled decisions.
    pub fn expected_report(&self, data: &FitData) -> Result<DisparityReport, PolicyError> {
        data.validate()?;
        let probabilities = data
            .scores
            .iter()
            .zip(&data.groups)
            .map(|(&score, group)| self.selection_probability(score, group))
            .collect::<Result<Array1<f64>, _>>()?;
        let rates = group_rates(probabilities.view(), data.labels.view(), &data.groups)?;
        Ok(DisparityReport::from_rates(rates))
    }

    /// Saves the policy to a human-readable TOML file.
    pub fn save(&self, path: &str) -> Result<(), PolicyError> {
        let toml_string = toml::to_string_pretty(self)?;
        let mut file = BufWriter::new(fs::File::create(path)?);
        file.write_all(toml_string.as_bytes())?;
        Ok(())
    }

    /// Loads a policy from a TOML file and checks every rule.
    pub fn load(path: &str) -> Result<Self, PolicyError> {
        let toml_string = fs::read_to_string(path)?;
        let policy: Policy = toml::from_str(&toml_string)?;
        for (group, rule) in &policy.rules {
            if *group != rule.group {
                return Err(PolicyError::InvalidRule {
                    group: group.clone(),
                    reason: format!("it is stored under the key of group '{}'", rule.group),
                });
            }
            rule.validate()?;
        }
        Ok(policy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::estimate::fit;
    use approx::assert_abs_diff_eq;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use tempfile::NamedTempFile;

    fn worked_policy() -> Policy {
        fit(
            &[0.9, 0.8, 0.4, 0.2, 0.9, 0.3, 0.2, 0.1],
            &[1, 1, 0, 0, 1, 0, 1, 0],
            &["A", "A", "A", "A", "B", "B", "B", "B"],
            "demographic_parity",
            "accuracy",
        )
        .unwrap()
    }

    #[test]
    fn deterministic_rule_follows_the_tie_rule() {
        let rule = GroupRule::threshold("A", 0.5);
        let mut rng = StdRng::seed_from_u64(1);
        assert!(rule.decide(0.7, TieRule::StrictlyAbove, &mut rng));
        assert!(!rule.decide(0.5, TieRule::StrictlyAbove, &mut rng));
        assert!(rule.decide(0.5, TieRule::AtOrAbove, &mut rng));
        assert_eq!(rule.selection_probability(0.5, TieRule::AtOrAbove), 1.0);
    }

    #[test]
    fn empirical_rate_matches_analytic_probability() {
        let rule = GroupRule::mixture("A", 0.2, 0.6, 0.5);
        let score = 0.4;
        let expected = rule.selection_probability(score, TieRule::StrictlyAbove);
        assert_eq!(expected, 0.5);

        let mut rng = StdRng::seed_from_u64(20240611);
        let draws = 100_000;
        let hits = (0..draws)
            .filter(|_| rule.decide(score, TieRule::StrictlyAbove, &mut rng))
            .count();
        let empirical = hits as f64 / draws as f64;
        // Five standard errors of a Bernoulli(0.5) mean over 100k draws.
        assert!((empirical - expected).abs() < 5.0 * (0.25f64 / draws as f64).sqrt());
    }

    #[test]
    fn blended_rule_mixes_in_a_constant_decision() {
        let rule = GroupRule::threshold("A", 0.5).blended(0.4, 0.25);
        assert!(!rule.is_deterministic());
        assert_abs_diff_eq!(
            rule.selection_probability(0.9, TieRule::StrictlyAbove),
            0.4 * 0.25 + 0.6,
            epsilon = 1e-12
        );
        assert_abs_diff_eq!(
            rule.selection_probability(0.1, TieRule::StrictlyAbove),
            0.1,
            epsilon = 1e-12
        );
    }

    #[test]
    fn unknown_group_fails_only_its_prediction() {
        let policy = worked_policy();
        let mut rng = StdRng::seed_from_u64(9);
        assert_eq!(
            policy.predict(0.5, "Z", &mut rng),
            Err(PredictError::UnknownGroup("Z".to_string()))
        );
        let scores = Array1::from(vec![0.95, 0.5, 0.05]);
        let results = policy.predict_many(scores.view(), &["A", "Z", "A"], &mut rng);
        assert_eq!(results[0], Ok(true));
        assert!(results[1].is_err());
        assert_eq!(results[2], Ok(false));
    }

    #[test]
    fn same_seed_gives_same_decisions() {
        let policy = worked_policy();
        let draw = |seed| {
            let mut rng = StdRng::seed_from_u64(seed);
            (0..64)
                .map(|i| policy.predict(0.2 + f64::from(i % 3) * 0.05, "B", &mut rng))
                .collect::<Result<Vec<bool>, _>>()
                .unwrap()
        };
        assert_eq!(draw(42), draw(42));
    }

    #[test]
    fn save_and_load_preserve_the_policy() {
        let policy = worked_policy();
        let file = NamedTempFile::new().unwrap();
        let path = file.path().to_str().unwrap();
        policy.save(path).unwrap();
        let loaded = Policy::load(path).unwrap();
        assert_eq!(loaded, policy);
    }

    #[test]
    fn load_rejects_out_of_range_probabilities() {
        let mut policy = worked_policy();
        if let Some(rule) = policy.rules.get_mut("B") {
            rule.mix_probability = 1.5;
        }
        let file = NamedTempFile::new().unwrap();
        let path = file.path().to_str().unwrap();
        policy.save(path).unwrap();
        assert!(matches!(
            Policy::load(path),
            Err(PolicyError::InvalidRule { group, .. }) if group == "B"
        ));
    }
}
